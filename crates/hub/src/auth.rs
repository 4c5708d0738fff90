//! Shared authentication state.
//!
//! Credentials and the crypto session live in one place, shared between the
//! login flow (driven through the broker's request machinery) and the
//! transport's reconnect handshake. On every reconnect the transport derives
//! a fresh per-connection credential from here and submits it before
//! replaying queued frames.

use protocol::{CryptoSession, Frame};
use serde_json::json;
use uuid::Uuid;

/// Topic carrying the initial key exchange, parameterized by app name.
pub fn login_topic(app_name: &str) -> String {
    format!("session:/{app_name}/login")
}

/// Topic carrying the encrypted password digest after the key exchange.
pub fn authenticate_topic(app_name: &str) -> String {
    format!("session:/{app_name}/authenticate")
}

/// Topic carrying the re-authentication request on reconnect.
pub fn reconnect_topic(app_name: &str) -> String {
    format!("session:/{app_name}/reconnect")
}

/// Credentials retained for transparent re-authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account the session was established for.
    pub username: String,
    /// App namespace the session belongs to.
    pub app_name: String,
}

/// Authentication state shared between login and reconnect.
pub struct SessionAuth {
    /// Current app namespace; used for the handshake topics.
    pub app_name: String,
    /// Cached credentials; `None` before login and after logout.
    pub credentials: Option<Credentials>,
    /// The ECDH session keying credential encryption.
    pub crypto: CryptoSession,
}

impl SessionAuth {
    /// Creates an unauthenticated state for the given app.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            credentials: None,
            crypto: CryptoSession::new(),
        }
    }

    /// Returns whether a session is cached and the crypto session can still
    /// encrypt for it.
    pub fn can_reauthenticate(&self) -> bool {
        self.credentials.is_some() && self.crypto.has_shared_secret()
    }

    /// Clears credentials and the derived session key. Used on logout.
    pub fn reset(&mut self) {
        self.credentials = None;
        self.crypto = CryptoSession::new();
    }

    /// Builds the re-authentication request for a fresh connection.
    ///
    /// A new session identifier is drawn per call, so the encrypted
    /// credential differs on every reconnect even though the underlying
    /// password does not. Returns `None` when no session is cached.
    pub fn reconnect_frame(&self) -> Option<Frame> {
        let credentials = self.credentials.as_ref()?;
        if !self.crypto.has_shared_secret() {
            return None;
        }

        let session_id = Uuid::new_v4().to_string();
        let secret = match self.crypto.reauth_token(&credentials.username, &session_id) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(error = %e, "failed to derive reconnect credential");
                return None;
            }
        };

        Some(Frame::Request {
            topic: reconnect_topic(&credentials.app_name),
            content: json!({
                "username": credentials.username,
                "session": session_id,
                "secret": secret,
            }),
        })
    }
}

impl std::fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuth")
            .field("app_name", &self.app_name)
            .field("credentials", &self.credentials)
            .field("crypto", &self.crypto)
            .finish()
    }
}
