//! Board agent core: serial transport, protocol state machine, and the
//! process-wide context that the daemon binary wires up.
//!
//! Module map follows the spec's numbering: transport (§4.1), line
//! inspection (§4.2), rx demultiplexing (§4.3), board session (§4.4),
//! adapter registry (§4.5), port monitor (§4.6), control gateway (§4.7).

pub mod collaborators;
pub mod config;
pub mod context;
pub mod demux;
pub mod error;
pub mod gateway;
pub mod inspector;
pub mod monitor;
pub mod notification;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::AgentConfig;
pub use context::AgentContext;
pub use error::{DownloadError, SessionError};
pub use session::BoardSession;
