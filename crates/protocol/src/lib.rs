//! # StateBus Protocol Library
//!
//! This crate provides the wire protocol definitions and session
//! cryptography for the StateBus client.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of StateBus's communication layer,
//! providing:
//!
//! - **Frame Definitions**: the JSON wire frames exchanged over the
//!   persistent connection (`subscribe`, `unsubscribe`, `publish`,
//!   `request`, `response`, `error`, `delete`)
//! - **Payload Variants**: the closed set of payload shapes, decoded once
//!   at the wire boundary by topic scheme
//! - **Session Cryptography**: the ECDH exchange and symmetric transform
//!   used for credential material and the reconnect handshake
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Topic Payloads                 │  JSON / text / base64 bytes
//! ├─────────────────────────────────────────┤
//! │          Wire Frames                    │  JSON text, tagged by event
//! ├─────────────────────────────────────────┤
//! │       Transport (WebSocket)             │
//! └─────────────────────────────────────────┘
//!
//! Credential material travels inside frames, encrypted by the
//! ECDH-derived session key (ChaCha20).
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Frame, Payload};
//! use serde_json::json;
//!
//! // Build a publish frame for a document topic
//! let payload = Payload::Json(json!({"title": "Home"}));
//! let frame = Frame::Publish {
//!     topic: "json:/notes/Pages/home.json".to_string(),
//!     content: payload.to_wire(),
//! };
//!
//! // Serialize to the JSON wire form
//! let text = frame.to_json().unwrap();
//! assert!(text.contains("\"event\":\"publish\""));
//! ```
//!
//! ## Modules
//!
//! - [`frames`]: wire frame, filter, and notification definitions
//! - [`payload`]: per-scheme payload variants and boundary codecs
//! - [`crypto`]: ECDH session and credential encryption
//! - [`error`]: error types

pub mod crypto;
pub mod error;
pub mod frames;
pub mod payload;

pub use crypto::{CryptoSession, SESSION_KEY_LENGTH};
pub use error::{ProtocolError, Result};
pub use frames::{ErrorMsg, Filter, Frame, Severity, SortDirection};
pub use payload::{scheme_of, Payload};
