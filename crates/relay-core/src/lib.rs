//! # filerocket relay core
//!
//! Session state machine and chunk relay for pickup-code file transfer.
//!
//! A sender registers a transfer and receives a short pickup code. A receiver
//! presenting that code is paired with the sender, opens a download stream,
//! and the sender's chunks are relayed into that stream one at a time.
//!
//! ## Architecture
//!
//! - [`code`] generates pickup codes.
//! - [`registry`] stores sessions with per-code serialized mutation, over a
//!   swappable [`registry::SessionBackend`].
//! - [`coordinator`] runs one task per session; every event for a code is
//!   handled by that task in arrival order.
//! - [`sink`] adapts the receiver's download body (streaming or buffering).
//! - [`protocol`] is the closed set of signaling messages.
//! - [`connections`] maps connection handles to live transports.
//! - [`sweeper`] expires idle sessions on a fixed interval.

pub mod code;
pub mod config;
pub mod connections;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod sweeper;
pub mod types;

pub use code::{CodeGenerator, RandomCodeGenerator};
pub use config::RelayConfig;
pub use connections::{ConnectionTable, Outbound};
pub use coordinator::RelayCoordinator;
pub use errors::{ErrorKind, RelayError, Result};
pub use logging::{setup_logging, LoggingConfig};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::SessionRegistry;
pub use sink::{DownloadBody, DownloadStream, FramingHeaders};
pub use sweeper::spawn_sweeper;
pub use types::{ConnectionId, FileInfo, PickupCode, Role, Session, SessionState, SinkId};
