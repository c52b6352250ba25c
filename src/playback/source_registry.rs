//! Transient source URLs for attached audio.
//!
//! Every attached source gets an opaque `cadence-source://<uuid>` handle that
//! stays resolvable until revoked. The resource manager revokes the previous
//! handle only after the next source is attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use uuid::Uuid;

use crate::protocol::AudioBytes;
use crate::streaming::appendable_source::AppendableSource;

const SCHEME: &str = "cadence-source://";

/// Audio the output can open.
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    /// Complete encoded body.
    Blob(AudioBytes),
    /// Growing body fed by the streaming transport.
    Stream(AppendableSource),
}

/// Shared handle table. Clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: Arc<Mutex<HashMap<String, PlaybackSource>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PlaybackSource>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, source: PlaybackSource) -> String {
        let url = format!("{SCHEME}{}", Uuid::new_v4());
        self.lock().insert(url.clone(), source);
        url
    }

    pub fn resolve(&self, url: &str) -> Option<PlaybackSource> {
        self.lock().get(url).cloned()
    }

    /// Returns `false` when the URL was unknown or already revoked.
    pub fn revoke(&self, url: &str) -> bool {
        let removed = self.lock().remove(url).is_some();
        if removed {
            debug!("SourceRegistry: revoked {}", url);
        }
        removed
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}
