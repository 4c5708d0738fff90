//! # StateBus Hub
//!
//! The client-side message broker and transport session layer of the
//! StateBus authoring application.
//!
//! ## Overview
//!
//! GUI components share state and talk to the server exclusively through
//! topics. The hub multiplexes arbitrarily many logical subscriptions and
//! one-shot requests over a single WebSocket connection:
//!
//! - **Topic Resolver**: expands short names into canonical topic URIs
//! - **Broker**: the topic registry with subscribe/publish/request, caching,
//!   and error propagation
//! - **Transport Client**: the connection, its outbound queue, and the
//!   reconnect/backoff state machine
//! - **Session Auth**: cached credentials and the encrypted
//!   re-authentication handshake performed on every reconnect
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  commands   ┌─────────────────┐  frames  ┌───────────┐
//! │  Hub handle   │────────────▶│  Broker task    │─────────▶│ Transport │
//! │ (GUI callers) │             │ (topic registry)│◀─────────│   task    │
//! └───────────────┘  deferred   └─────────────────┘  events  └───────────┘
//!                    deliveries
//! ```
//!
//! All registry state is owned by one task; deliveries scheduled by an
//! operation run only after the operation completes, so subscribing code
//! always finishes before its first callback fires.
//!
//! ## Example
//!
//! ```no_run
//! use hub::{Config, Hub, Payload};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> hub::Result<()> {
//!     let hub = Hub::connect(Config::default())?;
//!
//!     // Local shared state: never leaves the client.
//!     hub.publish("selection", Payload::Json(json!("page-1")), None)?;
//!
//!     // A document topic: fetched from the server, cached for later
//!     // subscribers.
//!     let token = hub
//!         .subscribe(
//!             "/Pages/home.json",
//!             Box::new(|topic, _data| println!("{topic} changed")),
//!             None,
//!             None,
//!         )
//!         .await?;
//!
//!     hub.unsubscribe(token, false)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`broker`]: the topic registry, commands, and the [`Hub`] handle
//! - [`topic`]: per-topic state and the deferred delivery queue
//! - [`resolver`]: topic-URI resolution
//! - [`transport`]: connection state machine and backoff
//! - [`auth`]: credentials and the reconnect handshake
//! - [`config`]: TOML configuration
//! - [`error`]: error types

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod resolver;
pub mod topic;
pub mod transport;

pub use broker::{
    forward_transport_events, is_local, Broker, Command, FrameSink, Hub, Token, TOPIC_ANY,
    TOPIC_CONNECTION, TOPIC_ERRORS,
};
pub use config::Config;
pub use error::{HubError, Result};
pub use resolver::TopicResolver;
pub use topic::{CallbackId, DataCallback, ErrorCallback, ValidateCallback};
pub use transport::{
    ConnectionState, TransportClient, TransportConfig, TransportEvent, TransportHandle,
};

// Wire-level types consumers see in callbacks and filters.
pub use protocol::{ErrorMsg, Filter, Frame, Payload, Severity, SortDirection};
