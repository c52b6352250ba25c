//! The one shared audio output, behind a trait so it can be swapped in tests.

use crate::error::PlaybackError;

/// Hardware-adjacent playback resource.
///
/// Sources are attached by transient URL from a
/// [`SourceRegistry`](crate::playback::source_registry::SourceRegistry).
pub trait AudioOutput {
    /// Replaces the current source. Starts out paused at position zero.
    fn attach(&mut self, url: &str) -> Result<(), PlaybackError>;
    /// Drops the current source, if any.
    fn detach(&mut self);
    /// Starts or resumes output. Fails when the source cannot be played.
    fn play(&mut self) -> Result<(), PlaybackError>;
    /// Idempotent.
    fn pause(&mut self);
    fn seek(&mut self, position_secs: f64);
    fn set_volume(&mut self, volume: f32);
    fn position_secs(&self) -> f64;
    /// Known once the decoder has read the container header.
    fn duration_secs(&self) -> Option<f64>;
    /// Set once the attached source has played out.
    fn has_ended(&self) -> bool;
    /// Asynchronous decode or device failure, reported once.
    fn take_error(&mut self) -> Option<PlaybackError>;
}
