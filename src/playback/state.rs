//! Playback status machine and the ephemeral playback state record.

use log::warn;

use crate::track::Track;

/// Lifecycle of the shared output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Ended,
}

impl PlaybackStatus {
    /// Transition table. Self-transitions are accepted as no-ops.
    pub fn can_transition_to(self, next: PlaybackStatus) -> bool {
        use PlaybackStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            // A new play request may interrupt any state.
            (_, Loading) => true,
            (Loading, Playing | Paused | Idle) => true,
            (Playing, Paused | Ended | Idle) => true,
            (Paused, Playing | Idle) => true,
            (Ended, Playing | Paused | Idle) => true,
            _ => false,
        }
    }
}

/// Ephemeral state written only by the resource manager.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub current_track: Option<Track>,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub volume: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            current_track: None,
            current_time: 0.0,
            duration: None,
            volume: 1.0,
        }
    }
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    /// Applies `next` when the table allows it. Returns `true` when the status changed.
    pub fn transition(&mut self, next: PlaybackStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "PlaybackState: rejected transition {:?} -> {:?}",
                self.status, next
            );
            return false;
        }
        let changed = self.status != next;
        self.status = next;
        changed
    }
}
