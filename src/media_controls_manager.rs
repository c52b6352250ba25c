//! OS media controls bridge (MPRIS/SMTC/Now Playing).
//!
//! This manager mirrors playback state onto platform media controls via
//! `souvlaki` and turns OS intents back into queue and playback commands.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::config::MediaControlsConfig;
use crate::protocol::{Message, PlaybackMessage, QueueMessage};
use crate::track::Track;

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "Cadence";
const MEDIA_CONTROLS_DBUS_NAME: &str = "cadence";

/// Repeats of the same intent inside this window are OS echoes.
const DUPLICATE_INTENT_WINDOW: Duration = Duration::from_millis(150);
/// A second next/previous inside this window changes track.
const RAPID_INTENT_WINDOW: Duration = Duration::from_millis(1500);
/// First intents closer than this to the track edge change track directly.
const EDGE_MARGIN_SECS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlState {
    pub is_playing: bool,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    pub seek_offset_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackIntent {
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentRepeat {
    Echo,
    Rapid,
    First,
}

/// Remembers the last next/previous intent to tell echoes and double presses apart.
#[derive(Debug, Default)]
pub struct IntentGuard {
    last: Option<(TrackIntent, Instant)>,
}

impl IntentGuard {
    fn register(&mut self, intent: TrackIntent, now: Instant) -> IntentRepeat {
        let since_last = self
            .last
            .filter(|(last_intent, _)| *last_intent == intent)
            .map(|(_, at)| now.saturating_duration_since(at));
        match since_last {
            Some(elapsed) if elapsed < DUPLICATE_INTENT_WINDOW => IntentRepeat::Echo,
            Some(elapsed) if elapsed < RAPID_INTENT_WINDOW => {
                self.last = Some((intent, now));
                IntentRepeat::Rapid
            }
            _ => {
                self.last = Some((intent, now));
                IntentRepeat::First
            }
        }
    }
}

#[derive(Debug, Default)]
struct ControlShared {
    state: ControlState,
    guard: IntentGuard,
}

fn lock_shared(shared: &Mutex<ControlShared>) -> MutexGuard<'_, ControlShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Translates one OS event into a bus command.
pub fn map_control_event(
    event: MediaControlEvent,
    state: ControlState,
    guard: &mut IntentGuard,
    now: Instant,
) -> Option<Message> {
    let playback = |message| Some(Message::Playback(message));
    match event {
        MediaControlEvent::Play => playback(PlaybackMessage::Resume),
        MediaControlEvent::Pause | MediaControlEvent::Stop => playback(PlaybackMessage::Pause),
        MediaControlEvent::Toggle => {
            if state.is_playing {
                playback(PlaybackMessage::Pause)
            } else {
                playback(PlaybackMessage::Resume)
            }
        }
        MediaControlEvent::Next => match guard.register(TrackIntent::Next, now) {
            IntentRepeat::Echo => None,
            IntentRepeat::Rapid => Some(Message::Queue(QueueMessage::Skip)),
            IntentRepeat::First => match state.duration_secs {
                Some(duration) if duration - state.position_secs > EDGE_MARGIN_SECS => {
                    playback(PlaybackMessage::Seek(duration))
                }
                _ => Some(Message::Queue(QueueMessage::Skip)),
            },
        },
        MediaControlEvent::Previous => match guard.register(TrackIntent::Previous, now) {
            IntentRepeat::Echo => None,
            IntentRepeat::Rapid => Some(Message::Queue(QueueMessage::Previous)),
            IntentRepeat::First if state.position_secs > EDGE_MARGIN_SECS => {
                playback(PlaybackMessage::Seek(0.0))
            }
            IntentRepeat::First => Some(Message::Queue(QueueMessage::Previous)),
        },
        MediaControlEvent::SetPosition(MediaPosition(position)) => {
            seek_message(state, position.as_secs_f64())
        }
        MediaControlEvent::SeekBy(direction, delta) => {
            seek_message(state, offset_position(state, direction, delta.as_secs_f64()))
        }
        MediaControlEvent::Seek(direction) => seek_message(
            state,
            offset_position(state, direction, state.seek_offset_secs),
        ),
        MediaControlEvent::SetVolume(volume) => {
            playback(PlaybackMessage::SetVolume(volume as f32))
        }
        MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise | MediaControlEvent::Quit => None,
    }
}

fn offset_position(state: ControlState, direction: SeekDirection, delta_secs: f64) -> f64 {
    match direction {
        SeekDirection::Forward => state.position_secs + delta_secs,
        SeekDirection::Backward => state.position_secs - delta_secs,
    }
}

fn seek_message(state: ControlState, target_secs: f64) -> Option<Message> {
    if !target_secs.is_finite() {
        return None;
    }
    let mut target = target_secs.max(0.0);
    if let Some(duration) = state.duration_secs {
        target = target.min(duration);
    }
    Some(Message::Playback(PlaybackMessage::Seek(target)))
}

/// Position worth handing to the OS, if any.
pub fn publishable_position(position_secs: f64, duration_secs: Option<f64>) -> Option<Duration> {
    if !position_secs.is_finite() || position_secs < 0.0 {
        return None;
    }
    match duration_secs {
        Some(duration) if !duration.is_finite() || position_secs > duration => None,
        _ => Some(Duration::from_secs_f64(position_secs)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackPublishState {
    Stopped,
    Paused,
    Playing,
}

/// Handles OS media control events and publishes app playback state.
pub struct MediaControlsManager {
    bus_consumer: Receiver<Message>,
    shared: Arc<Mutex<ControlShared>>,
    controls: Option<MediaControls>,
    current_track: Option<Track>,
    last_published_playback: Option<PlaybackPublishState>,
    last_published_metadata: Option<(String, u64)>,
    position_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl MediaControlsManager {
    /// Creates a manager and attempts to initialize platform media controls.
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        config: &MediaControlsConfig,
    ) -> Self {
        let shared = Arc::new(Mutex::new(ControlShared::default()));
        let controls = Self::create_controls(bus_producer, Arc::clone(&shared));
        Self::with_controls(bus_consumer, shared, controls, config)
    }

    fn with_controls(
        bus_consumer: Receiver<Message>,
        shared: Arc<Mutex<ControlShared>>,
        controls: Option<MediaControls>,
        config: &MediaControlsConfig,
    ) -> Self {
        lock_shared(&shared).state.seek_offset_secs = f64::from(config.seek_offset_secs);
        let quota = Quota::with_period(Duration::from_millis(u64::from(
            config.position_publish_interval_ms,
        )))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::MIN);
        Self {
            bus_consumer,
            shared,
            controls,
            current_track: None,
            last_published_playback: None,
            last_published_metadata: None,
            position_limiter: RateLimiter::direct(quota),
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(
        bus_producer: Sender<Message>,
        shared: Arc<Mutex<ControlShared>>,
    ) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: MEDIA_CONTROLS_DISPLAY_NAME,
            dbus_name: MEDIA_CONTROLS_DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(
                    "MediaControlsManager: failed to create media controls backend: {:?}",
                    err
                );
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let message = {
                let mut shared = lock_shared(&shared);
                let state = shared.state;
                map_control_event(event, state, &mut shared.guard, Instant::now())
            };
            if let Some(message) = message {
                debug!("MediaControlsManager: OS intent -> {:?}", message);
                let _ = bus_producer.send(message);
            }
        }) {
            warn!(
                "MediaControlsManager: failed to attach media controls handler: {:?}",
                err
            );
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(
        _bus_producer: Sender<Message>,
        _shared: Arc<Mutex<ControlShared>>,
    ) -> Option<MediaControls> {
        // Souvlaki requires an HWND on Windows and the headless driver has none.
        warn!("MediaControlsManager: Windows media controls need a window handle, disabled");
        None
    }

    fn update_state<F>(&self, update: F)
    where
        F: FnOnce(&mut ControlState),
    {
        update(&mut lock_shared(&self.shared).state);
    }

    fn state_snapshot(&self) -> ControlState {
        lock_shared(&self.shared).state
    }

    fn desired_playback_publish_state(&self) -> PlaybackPublishState {
        if self.current_track.is_none() {
            return PlaybackPublishState::Stopped;
        }
        if self.state_snapshot().is_playing {
            PlaybackPublishState::Playing
        } else {
            PlaybackPublishState::Paused
        }
    }

    fn playback_with_progress(
        publish_state: PlaybackPublishState,
        progress: Option<Duration>,
    ) -> MediaPlayback {
        let progress = progress.map(MediaPosition);
        match publish_state {
            PlaybackPublishState::Stopped => MediaPlayback::Stopped,
            PlaybackPublishState::Paused => MediaPlayback::Paused { progress },
            PlaybackPublishState::Playing => MediaPlayback::Playing { progress },
        }
    }

    fn publish_playback_if_needed(&mut self) {
        let desired_state = self.desired_playback_publish_state();
        if self.last_published_playback == Some(desired_state) {
            return;
        }
        let state = self.state_snapshot();
        let progress = publishable_position(state.position_secs, state.duration_secs);
        self.last_published_playback = Some(desired_state);

        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        if let Err(err) = controls.set_playback(Self::playback_with_progress(desired_state, progress))
        {
            warn!(
                "MediaControlsManager: failed to publish playback state {:?}: {:?}",
                desired_state, err
            );
            self.last_published_playback = None;
        }
    }

    fn publish_position(&mut self) {
        let state = self.state_snapshot();
        let Some(progress) = publishable_position(state.position_secs, state.duration_secs) else {
            return;
        };
        if self.position_limiter.check().is_err() {
            return;
        }
        let desired_state = self.desired_playback_publish_state();
        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        if let Err(err) =
            controls.set_playback(Self::playback_with_progress(desired_state, Some(progress)))
        {
            warn!("MediaControlsManager: failed to publish position: {:?}", err);
        }
    }

    fn publish_metadata_if_needed(&mut self) {
        let duration_ms = self
            .state_snapshot()
            .duration_secs
            .filter(|duration| duration.is_finite() && *duration > 0.0)
            .map(|duration| (duration * 1000.0) as u64)
            .unwrap_or(0);
        let key = self
            .current_track
            .as_ref()
            .map(|track| (track.id.clone(), duration_ms));
        if self.last_published_metadata == key {
            return;
        }
        self.last_published_metadata = key;

        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        let publish_result = match self.current_track.as_ref() {
            Some(track) => controls.set_metadata(MediaMetadata {
                title: Some(track.title.as_str()),
                artist: Some(track.artist.name.as_str()),
                album: Some(track.album.title.as_str()),
                cover_url: track.album.largest_cover(),
                duration: (duration_ms > 0).then(|| Duration::from_millis(duration_ms)),
            }),
            None => controls.set_metadata(MediaMetadata::default()),
        };
        if let Err(err) = publish_result {
            warn!("MediaControlsManager: failed to publish metadata: {:?}", err);
            self.last_published_metadata = None;
        }
    }

    fn set_current_track(&mut self, track: Track) {
        let changed = self.current_track.as_ref().map(|current| &current.id) != Some(&track.id);
        if changed {
            self.update_state(|state| {
                state.position_secs = 0.0;
                state.duration_secs = None;
            });
        }
        self.current_track = Some(track);
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Playback(PlaybackMessage::TrackLoading(track)) => {
                self.set_current_track(track);
                self.update_state(|state| state.is_playing = false);
            }
            Message::Playback(PlaybackMessage::Started { track, .. }) => {
                self.set_current_track(track);
                self.update_state(|state| state.is_playing = true);
            }
            Message::Playback(PlaybackMessage::Paused { position_secs, .. }) => {
                self.update_state(|state| {
                    state.is_playing = false;
                    state.position_secs = position_secs;
                });
            }
            Message::Playback(PlaybackMessage::Ended { .. })
            | Message::Playback(PlaybackMessage::PlaybackFailed { .. }) => {
                self.update_state(|state| state.is_playing = false);
            }
            Message::Playback(PlaybackMessage::DurationKnown(duration_secs)) => {
                self.update_state(|state| state.duration_secs = Some(duration_secs));
            }
            Message::Playback(PlaybackMessage::TimeProgress {
                position_secs,
                duration_secs,
            }) => {
                self.update_state(|state| {
                    state.position_secs = position_secs;
                    if duration_secs.is_some() {
                        state.duration_secs = duration_secs;
                    }
                });
                self.publish_metadata_if_needed();
                self.publish_position();
                return;
            }
            _ => return,
        }
        self.publish_playback_if_needed();
        self.publish_metadata_if_needed();
    }

    /// Starts the blocking manager loop.
    pub fn run(&mut self) {
        info!("MediaControlsManager: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("MediaControlsManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Drop for MediaControlsManager {
    fn drop(&mut self) {
        if let Some(mut controls) = self.controls.take() {
            if let Err(err) = controls.detach() {
                warn!("MediaControlsManager: failed to detach media controls: {:?}", err);
            }
        }
    }
}
