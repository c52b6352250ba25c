//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the queue,
//! the playback resource manager, the streaming transport and the OS media
//! controls bridge.

use std::fmt;
use std::sync::Arc;

use crate::error::PlaybackError;
use crate::playback::state::PlaybackStatus;
use crate::track::Track;

/// Repeat behavior applied when the current track ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off, // Stop after the queue runs out
    All, // Requeue history once the queue runs out
    One, // Replay the current track
}

/// Requested encoding quality, forwarded to the audio origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioQuality {
    Low,
    #[default]
    Standard,
    High,
    Lossless,
}

impl AudioQuality {
    pub fn as_query_value(self) -> &'static str {
        match self {
            AudioQuality::Low => "low",
            AudioQuality::Standard => "standard",
            AudioQuality::High => "high",
            AudioQuality::Lossless => "lossless",
        }
    }
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Queue(QueueMessage),
    Playback(PlaybackMessage),
    Audio(AudioMessage),
    Notice(UserNotice),
}

/// Queue and history state published after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    /// Most recent first.
    pub history: Vec<Track>,
    pub repeat_mode: RepeatMode,
    pub shuffle: bool,
}

/// Queue-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum QueueMessage {
    PlayTrack {
        track: Track,
        autoplay: bool,
        /// Replaces the queue when present.
        context: Option<Vec<Track>>,
    },
    Skip,
    Previous,
    AddToQueue(Vec<Track>),
    RemoveFromQueue(usize),
    QueueItemClicked {
        track: Track,
        index: usize,
    },
    ClearQueue,
    SetRepeatMode(RepeatMode),
    SetShuffle(bool),
    /// Tracks appended once the queue runs out with repeat off.
    SetRecommendations(Vec<Track>),
    QueueChanged(QueueSnapshot),
    NoNextTrack,
    NoPreviousTrack,
}

/// Parameters of one play attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub track: Track,
    pub offset_secs: f64,
    /// Bypass the blob cache and refetch from the origin.
    pub force_fresh: bool,
    pub autoplay: bool,
}

impl PlayRequest {
    pub fn new(track: Track) -> Self {
        Self {
            track,
            offset_secs: 0.0,
            force_fresh: false,
            autoplay: true,
        }
    }
}

/// Progressive download progress for the active stream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamProgress {
    pub bytes_loaded: u64,
    pub total_bytes: Option<u64>,
    /// Fraction in `[0, 1]`, zero while the total is unknown.
    pub progress: f32,
}

/// Playback-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum PlaybackMessage {
    Play(PlayRequest),
    Resume,
    Pause,
    Seek(f64),
    SetVolume(f32),
    SetAudioQuality(AudioQuality),
    VisibilityChanged {
        visible: bool,
    },
    TrackLoading(Track),
    Started {
        track: Track,
        /// Set when an already attached source resumed.
        resumed: bool,
    },
    Paused {
        track_id: String,
        position_secs: f64,
    },
    Ended {
        track_id: String,
    },
    TimeProgress {
        position_secs: f64,
        duration_secs: Option<f64>,
    },
    DurationKnown(f64),
    PlaybackFailed {
        track_id: String,
        error: PlaybackError,
    },
    VolumeChanged(f32),
    StatusChanged(PlaybackStatus),
    StreamProgress(StreamProgress),
}

/// Shared encoded audio payload.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioBytes(Arc<[u8]>);

impl AudioBytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AudioBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl AsRef<[u8]> for AudioBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AudioBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioBytes({} bytes)", self.0.len())
    }
}

/// Where resolved audio comes from.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    Blob { bytes: AudioBytes, from_cache: bool },
    /// Cache miss with streaming enabled; the transport fetches progressively.
    Stream,
}

/// Result of one resolution worker, tagged with its request generation.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub generation: u64,
    pub request: PlayRequest,
    pub result: Result<ResolvedSource, PlaybackError>,
}

/// Resource-manager internal traffic.
#[derive(Debug, Clone)]
pub enum AudioMessage {
    Resolved(ResolveOutcome),
    StreamFailed {
        generation: u64,
        track_id: String,
        error: PlaybackError,
    },
    StreamCompleted {
        generation: u64,
        track_id: String,
    },
    ProgressTick,
}

/// Non-blocking notification meant for the user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserNotice {
    pub message: String,
}
