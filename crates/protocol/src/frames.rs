//! Wire frame definitions for the StateBus protocol.
//!
//! All traffic between the client and the server consists of JSON text
//! frames, one frame per transport message, tagged by their `event` field.
//! Frames carry a topic and, depending on the event, a content value, a
//! table filter, or an error description.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Sort direction for a table filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending sort order.
    #[default]
    Ascending,
    /// Descending sort order.
    Descending,
}

/// Server-side paging, sorting and search restriction attached to a
/// subscription.
///
/// Changing the filter on a live subscription re-issues the `subscribe`
/// frame; the server answers with a fresh result page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Filter {
    /// First row of the requested page.
    pub offset: u64,
    /// Number of rows per page (0 = no limit).
    pub row_count: u64,
    /// Column to sort by.
    pub sort_col: Option<String>,
    /// Sort direction.
    pub sort_direction: SortDirection,
    /// Free-text search restriction.
    pub search_text: Option<String>,
    /// Columns to include in the result.
    pub columns: Vec<String>,
    /// Additional restrictions, passed through to the server verbatim.
    pub filter_list: Vec<Value>,
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Operation failed.
    Error,
    /// Something is off but the operation continued.
    Warning,
    /// Informational notice.
    Info,
    /// Positive confirmation.
    Success,
}

/// A user-visible notification about a topic or the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMsg {
    /// Short headline, suitable for a banner.
    pub title: String,
    /// Longer description of what happened.
    pub detail: String,
    /// How the notification should be presented.
    pub severity: Severity,
}

impl ErrorMsg {
    /// Creates a notification with the given severity.
    pub fn new(title: impl Into<String>, detail: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
            severity,
        }
    }

    /// Creates an error-severity notification.
    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(title, detail, Severity::Error)
    }

    /// Creates a warning-severity notification.
    pub fn warning(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(title, detail, Severity::Warning)
    }

    /// Creates an info-severity notification.
    pub fn info(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(title, detail, Severity::Info)
    }

    /// Creates a success-severity notification.
    pub fn success(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(title, detail, Severity::Success)
    }
}

/// Top-level frame enum, one per transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Frame {
    /// Open or refresh a server-side subscription.
    Subscribe {
        /// Fully qualified topic.
        topic: String,
        /// Optional paging/sort restriction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    },
    /// Tear down a server-side subscription.
    Unsubscribe {
        /// Fully qualified topic.
        topic: String,
    },
    /// Value update; sent by the client on publish, by the server on change.
    Publish {
        /// Fully qualified topic.
        topic: String,
        /// Opaque payload, decoded by scheme at the boundary.
        content: Value,
    },
    /// One-shot request expecting a single `response`.
    Request {
        /// Fully qualified topic.
        topic: String,
        /// Request payload; null when the request carries no arguments.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        content: Value,
    },
    /// The single answer to a `request`.
    Response {
        /// Fully qualified topic.
        topic: String,
        /// Response payload.
        content: Value,
    },
    /// Error report, either direction.
    Error {
        /// Topic the error relates to.
        topic: String,
        /// Short headline.
        title: String,
        /// Longer description.
        detail: String,
    },
    /// Remove the server-side resource behind a topic.
    Delete {
        /// Fully qualified topic.
        topic: String,
    },
}

impl Frame {
    /// Returns the topic this frame addresses.
    pub fn topic(&self) -> &str {
        match self {
            Frame::Subscribe { topic, .. }
            | Frame::Unsubscribe { topic }
            | Frame::Publish { topic, .. }
            | Frame::Request { topic, .. }
            | Frame::Response { topic, .. }
            | Frame::Error { topic, .. }
            | Frame::Delete { topic } => topic,
        }
    }

    /// Serializes the frame to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserializes a frame from its JSON wire form.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Into::into)
    }
}
