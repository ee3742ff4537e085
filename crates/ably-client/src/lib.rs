//! Client library core for the Ably realtime pub/sub platform.
//!
//! Two clients are provided: [`Rest`] for request/response operations
//! (publishing, history, presence queries, stats) and [`Realtime`] for the
//! persistent connection with channels, subscriptions and presence.
//!
//! # Features
//! - Connection state machine with automatic reconnection, resume/recover,
//!   and fallback host rotation
//! - Channel attach/detach lifecycle with suspension propagation
//! - Publish pipeline with per-connection message serials, range ACK/NACK,
//!   and queueing while disconnected
//! - Presence set synchronization (SYNC stream assembly and reconciliation)
//! - Link-header-driven pagination for history, presence and stats
//! - Layered payload encoding (utf-8, base64, json, AES-CBC encryption)
//! - JSON and MessagePack wire formats
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_client::Error> {
//! use ably_client::{ClientOptions, Data, Message, Realtime};
//!
//! let mut opts = ClientOptions::with_key("appId.keyId:secret");
//! opts.client_id = Some("worker-1".into());
//! let client = Realtime::new(opts)?;
//! client.connect().await?;
//!
//! let channel = client.channel("orders:live");
//! channel.attach().await?;
//!
//! let mut sub = channel.subscribe();
//! channel.publish(Message::new("created", "order #1")).await?;
//! if let Some(msg) = sub.next().await {
//!     println!("got {:?}: {:?}", msg.name, msg.data);
//! }
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod connection;
mod crypto;
mod emitter;
mod error;
mod hosts;
mod message;
mod options;
mod pagination;
mod presence;
pub mod protocol;
mod queue;
mod realtime;
mod rest;
mod transport;

pub use auth::{AuthCallback, Token, TokenDetails, TokenFuture, TokenParams, TokenRequest};
pub use channel::{
    ChannelEvent, ChannelState, ChannelStateChange, Channels, MessageStream, Presence,
    RealtimeChannel,
};
pub use connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use crypto::CipherParams;
pub use emitter::{Emitter, ListenerGuard};
pub use error::{codes, BoxError, Error, ErrorInfo};
pub use message::{Data, Message, PresenceAction, PresenceMessage};
pub use options::ClientOptions;
pub use pagination::{PaginatedItems, PaginatedResult};
pub use realtime::Realtime;
pub use rest::{Direction, PaginateParams, Rest, RestChannel, Stats};
pub use transport::{Dialer, Transport};
