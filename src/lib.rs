//! # hubwire
//!
//! Client for SignalR-classic style persistent connections: a logical
//! bidirectional channel multiplexing raw payloads and hub RPC over
//! whichever wire transport the server and network allow.
//!
//! The crate splits into two layers:
//!
//! - [`connection`]: negotiation, transport selection with fallback
//!   (WebSockets, server-sent events, forever frame, long polling),
//!   keep-alive monitoring with slow-connection detection, and
//!   automatic reconnection inside a bounded window.
//! - [`hub`]: named hub proxies over one connection, with correlated
//!   method invocation, server event dispatch, and round-tripped
//!   per-hub state.
//!
//! ## Example
//!
//! ```no_run
//! use hubwire::{ConnectionConfig, HubConnection};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), hubwire::ClientError> {
//! let hub = HubConnection::new(ConnectionConfig::new(
//!     "https://example.com/signalr".to_string(),
//! ));
//! let chat = hub.create_proxy("chatHub");
//! chat.on("newMessage", |args| {
//!     println!("message: {:?}", args);
//! });
//!
//! hub.start().await?;
//! let reply = chat.invoke("send", vec![json!("general"), json!("hi")]).await?;
//! println!("server replied: {:?}", reply);
//! hub.stop(false).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod transport;

pub use config::{ConnectionConfig, TransportPreference};
pub use connection::state::{ConnectionState, StateChange};
pub use connection::Connection;
pub use error::ClientError;
pub use hub::{HubConnection, HubProxy, SubscriptionHandle};
pub use transport::{
    DefaultTransportFactory, Transport, TransportContext, TransportFactory, TransportKind,
    TransportSignal,
};
