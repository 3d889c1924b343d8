pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod supervisor;
pub mod transport;

pub use channel::{ChannelClient, ConnectionState, SubscriptionId};
pub use config::{ChannelConfig, ClientConfig};
pub use context::AppContext;
pub use error::ChannelError;
pub use fwdpanel_core::{Envelope, EventKind, WILDCARD};
