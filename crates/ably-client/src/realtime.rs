//! The realtime client: wires together the connection dispatcher, the
//! channel registry, and the embedded REST client.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{Channels, RealtimeChannel};
use crate::connection::{Connection, ConnectionInner, Dispatcher};
use crate::error::Error;
use crate::options::ClientOptions;
use crate::rest::Rest;

/// A realtime client. Owns one connection, its channels, and a REST client
/// that follows the connection's active host.
///
/// Must be created within a tokio runtime; the connection state machine runs
/// on a background task.
pub struct Realtime {
    rest: Rest,
    connection: Connection,
    channels: Channels,
}

impl Realtime {
    pub fn new(opts: ClientOptions) -> Result<Self, Error> {
        let auto_connect = opts.auto_connect;
        let opts = Arc::new(opts);
        let rest = Rest::with_shared_options(opts.clone())?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner::new(cmd_tx));
        let channels = Channels::new(opts.clone(), inner.clone());
        let dispatcher = Dispatcher::new(
            opts,
            rest.clone(),
            inner.clone(),
            channels.clone(),
            cmd_rx,
        );
        tokio::spawn(dispatcher.run());

        let connection = Connection::new(inner);
        if auto_connect {
            connection.request_connect();
        }
        Ok(Realtime {
            rest,
            connection,
            channels,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Shorthand for `channels().get(name)`.
    pub fn channel(&self, name: impl Into<String>) -> RealtimeChannel {
        self.channels.get(name)
    }

    /// The embedded REST client (history, time, stats, REST publishing).
    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    /// Connect and wait until CONNECTED.
    pub async fn connect(&self) -> Result<(), Error> {
        self.connection.connect().await
    }

    /// Close the connection and wait for CLOSED.
    pub async fn close(&self) -> Result<(), Error> {
        self.connection.close().await
    }
}
