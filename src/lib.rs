//! Building blocks for real-time TCP game-protocol servers.
//!
//! `playwire` accepts persistent connections, decodes a length-prefixed
//! binary+JSON wire protocol into discrete requests, routes each request to
//! a registered operation under an execution budget, tracks per-connection
//! liveness, and lets independent subsystems broadcast events to interested
//! listeners.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod message;
pub mod operation;
pub mod pubsub;
pub mod request;
pub mod resources;
pub mod server;
pub mod session;
pub mod subsystem;

pub use codec::{CodecError, Packer};
pub use config::{ConfigError, ServerConfig};
pub use dispatch::{Dispatcher, RegisterError};
pub use message::{CmdCode, DataCode, EventCode, OpCode, Payload, SystemCode};
pub use operation::Operation;
pub use pubsub::{Hub, Subscriber, SubscriptionId};
pub use request::{Request, RequestError};
pub use resources::ServerResources;
pub use server::{Server, ServerError};
pub use session::{DisconnectReason, SendError, Session};
pub use subsystem::{Subsystem, SubsystemError, SubsystemManager, SystemEvent};
