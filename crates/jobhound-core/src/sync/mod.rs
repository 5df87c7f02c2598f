pub mod provider;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{parse_rfc3339, to_rfc3339};

pub use provider::{
    AccountProviderResolver, MailProvider, ProviderError, ProviderResolver, RawMessage,
    StaticMailProvider,
};
pub use worker::{SyncError, SyncReport, SyncWorker};

/// Per-account sync state machine:
/// `idle -> fetching -> classifying -> committed -> idle`, or `-> error -> idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Classifying,
    Committed,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Fetching => "fetching",
            SyncState::Classifying => "classifying",
            SyncState::Committed => "committed",
            SyncState::Error => "error",
        }
    }
}

/// Cursors are the receipt time of the newest committed message.
pub fn cursor_for(received_at: DateTime<Utc>) -> String {
    to_rfc3339(received_at)
}

/// Unparseable cursors are treated as absent so the account resyncs from scratch.
pub fn cursor_time(cursor: Option<&str>) -> Option<DateTime<Utc>> {
    cursor.and_then(|value| parse_rfc3339(value).ok())
}
