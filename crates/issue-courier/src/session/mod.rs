//! Persisted browser state.
//!
//! The saved state is the portal cookie jar. Other components treat it as
//! opaque; only the browser engine restores it.

pub mod store;

pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// Serialized browser context: cookies plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Cookie domain the jar belongs to.
    pub domain: String,
    pub cookies: BTreeMap<String, String>,
}

impl SessionState {
    pub fn new(domain: impl Into<String>, cookies: BTreeMap<String, String>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            domain: domain.into(),
            cookies,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}
