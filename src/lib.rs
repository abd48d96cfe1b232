#![deny(unsafe_op_in_unsafe_fn)]

pub mod broadcast;
pub mod buffer_pool;
pub mod channel;
pub mod completion;
pub mod config;
pub mod error;
pub mod handler;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod sockopt; // OS-level socket-option helpers

/// Convenience re-exports
pub use broadcast::BroadcastService;
pub use buffer_pool::{SendBuffer, SendBufferPool};
pub use channel::{Channel, InterestOps};
pub use completion::Completion;
pub use config::{BroadcastConfig, ReactorConfig, SocketTuning};
pub use error::WriteError;
pub use handler::{Acceptor, ChannelHandler};
pub use reactor::{Handle, Reactor};
pub use registry::SessionRegistry;
pub use session::Session;
