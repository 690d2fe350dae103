//! # Slednik
//!
//! TCP terminator for fleets of Concox V5 GPS trackers.
//!
//! Slednik holds the persistent device connections, reassembles the binary
//! framing out of the raw byte stream, parses the sixteen payload kinds,
//! answers with the protocol acknowledgments the devices expect, and lets an
//! operator push text commands (relay cut/restore, status, location) to any
//! online device over a small HTTP surface.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Operator HTTP Surface                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Session Registry (identifier → session)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Per-Connection Session Tasks                    │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │ Device 1 │  │ Device 2 │  │ Device 3 │  │ Device N │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Frame Codec  /  Payload Parsers  /  Ack Builders         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      TCP Listener (tokio)                       │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Wire constants read better raw
#![allow(clippy::cast_possible_truncation)]  // Intentional for wire field widths
#![allow(clippy::cast_sign_loss)]            // Quadrant arithmetic is explicit
#![allow(clippy::cast_precision_loss)]       // Acceptable for coordinate division
#![allow(clippy::similar_names)]             // lat/lon, mcc/mnc are intentionally named
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::cognitive_complexity)]      // Per-opcode dispatch is one big match
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::match_same_arms)]           // Explicit arm per opcode is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod server;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port devices connect to
pub const DEFAULT_DEVICE_PORT: u16 = 5027;

/// Default port for the operator HTTP surface
pub const DEFAULT_CONTROL_PORT: u16 = 3000;

/// Cap on the per-connection receive buffer; a declared frame length that
/// would require more closes the connection
pub const MAX_RECV_BUFFER: usize = 64 * 1024;

/// Pending operator commands expire after this long without a device reply
pub const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::control::ControlServer;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{FrameCodec, Message, RawFrame};
    pub use crate::server::{DeviceServer, DeviceSession, SessionRegistry};
    pub use crate::types::*;
}
