//! Engine error taxonomy.
//!
//! Network and decode failures abort one play attempt and are reported on the
//! bus; storage failures are logged and degrade to "no cache". Invalid catalog
//! data never produces an error, see [`crate::track::sanitize_track`].

use thiserror::Error;

/// Failure raised while resolving, attaching or playing a track.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Origin request rejected or returned a non-success status.
    #[error("network failure: {0}")]
    Network(String),

    /// Output or append target rejected the bytes.
    #[error("decode failure: {0}")]
    Decode(String),

    /// Persistent store read/write rejected.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A bounded wait expired.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Audio device unavailable or stream could not be built.
    #[error("audio output failure: {0}")]
    Output(String),
}

impl PlaybackError {
    /// Whether the failure came from the bytes themselves rather than their transport.
    pub fn is_decode(&self) -> bool {
        matches!(self, PlaybackError::Decode(_))
    }
}

impl From<rusqlite::Error> for PlaybackError {
    fn from(err: rusqlite::Error) -> Self {
        PlaybackError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PlaybackError {
    fn from(err: serde_json::Error) -> Self {
        PlaybackError::Storage(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for PlaybackError {
    fn from(err: std::io::Error) -> Self {
        PlaybackError::Network(err.to_string())
    }
}
