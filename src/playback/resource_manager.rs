//! Owner of the one shared audio output.
//!
//! Every play request bumps a generation counter before any work starts.
//! Resolution (cache lookup or origin fetch) runs on a worker thread and posts
//! its outcome back on the bus; an outcome whose generation is no longer
//! current is discarded, although its bytes were already cached by the worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::app_bootstrap::services::panic_payload_to_string;
use crate::backends::AudioOrigin;
use crate::config::Config;
use crate::db_manager::{DbManager, EvictionPolicy};
use crate::error::PlaybackError;
use crate::playback::output::AudioOutput;
use crate::playback::source_registry::{PlaybackSource, SourceRegistry};
use crate::playback::state::{PlaybackState, PlaybackStatus};
use crate::protocol::{
    AudioBytes, AudioMessage, AudioQuality, Message, PlayRequest, PlaybackMessage,
    ResolveOutcome, ResolvedSource, UserNotice,
};
use crate::settings::{self, SettingKey};
use crate::streaming::transport::{StreamEvent, StreamingTransport};
use crate::track::Track;

/// Work order handed to a resolution worker.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub generation: u64,
    pub request: PlayRequest,
    pub bypass_cache: bool,
    pub allow_streaming: bool,
    pub quality: AudioQuality,
}

/// What [`PlaybackResourceManager::commit`] did with a resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A newer request started after this one.
    Superseded,
    Failed,
    /// Streaming could not start; a full download was requested instead.
    FellBack,
}

struct AttachedSource {
    url: String,
    streamed: bool,
}

struct RememberedPlayback {
    track: Track,
    position_secs: f64,
    was_playing: bool,
}

fn lock_store(store: &Mutex<DbManager>) -> MutexGuard<'_, DbManager> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes freshly fetched bytes to the blob cache and applies eviction.
/// Store failures are logged only.
fn cache_blob(store: &Mutex<DbManager>, track_id: &str, bytes: &[u8], eviction: &EvictionPolicy) {
    let db = lock_store(store);
    if let Err(err) = db.put_blob(track_id, bytes) {
        warn!("PlaybackResourceManager: failed to cache {}: {}", track_id, err);
        return;
    }
    if let Err(err) = db.evict_blobs(eviction, Some(track_id)) {
        warn!("PlaybackResourceManager: cache eviction failed: {}", err);
    }
}

/// Resolves a track to playable audio: cache first unless bypassed, then
/// either a streaming source or a full fetch that is written back to the cache.
pub fn resolve_audio(
    store: &Mutex<DbManager>,
    origin: &dyn AudioOrigin,
    resolve: &ResolveRequest,
    eviction: &EvictionPolicy,
) -> Result<ResolvedSource, PlaybackError> {
    let track_id = resolve.request.track.id.as_str();
    if !resolve.bypass_cache {
        match lock_store(store).get_blob(track_id) {
            Ok(Some(bytes)) if !bytes.is_empty() => {
                debug!("PlaybackResourceManager: cache hit for {}", track_id);
                return Ok(ResolvedSource::Blob {
                    bytes: AudioBytes::from(bytes),
                    from_cache: true,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(
                "PlaybackResourceManager: cache read failed for {}: {}",
                track_id, err
            ),
        }
    }

    if resolve.allow_streaming {
        return Ok(ResolvedSource::Stream);
    }

    let bytes = origin.fetch(track_id, resolve.quality)?;
    if bytes.is_empty() {
        return Err(PlaybackError::Decode(format!("origin sent an empty body for {track_id}")));
    }
    cache_blob(store, track_id, &bytes, eviction);
    Ok(ResolvedSource::Blob {
        bytes: AudioBytes::from(bytes),
        from_cache: false,
    })
}

/// [`resolve_audio`] for worker threads: a panic while resolving becomes a
/// failed attempt so the manager never waits on an outcome that won't come.
pub fn resolve_guarded(
    store: &Mutex<DbManager>,
    origin: &dyn AudioOrigin,
    resolve: &ResolveRequest,
    eviction: &EvictionPolicy,
) -> Result<ResolvedSource, PlaybackError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        resolve_audio(store, origin, resolve, eviction)
    }))
    .unwrap_or_else(|payload| {
        let reason = panic_payload_to_string(payload.as_ref());
        error!(
            "PlaybackResourceManager: resolution of {} panicked: {}",
            resolve.request.track.id, reason
        );
        Err(PlaybackError::Network(format!("resolution aborted: {reason}")))
    })
}

pub struct PlaybackResourceManager<O: AudioOutput> {
    bus_receiver: Receiver<Message>,
    bus_sender: Sender<Message>,
    output: O,
    registry: SourceRegistry,
    store: Arc<Mutex<DbManager>>,
    origin: Arc<dyn AudioOrigin>,
    config: Config,
    eviction: EvictionPolicy,
    state: PlaybackState,
    generation: u64,
    active_request: Option<PlayRequest>,
    attached: Option<AttachedSource>,
    transport: Option<StreamingTransport>,
    quality: AudioQuality,
    backgrounded: bool,
    remembered: Option<RememberedPlayback>,
    duration_announced: bool,
    ended_announced: bool,
    notice_sent: bool,
}

impl<O: AudioOutput> PlaybackResourceManager<O> {
    pub fn new(
        bus_receiver: Receiver<Message>,
        bus_sender: Sender<Message>,
        mut output: O,
        registry: SourceRegistry,
        store: Arc<Mutex<DbManager>>,
        origin: Arc<dyn AudioOrigin>,
        config: Config,
    ) -> Self {
        let (volume, quality) = {
            let db = lock_store(&store);
            (
                settings::load_volume(&db).unwrap_or(1.0),
                settings::load_audio_quality(&db),
            )
        };
        output.set_volume(volume);
        let state = PlaybackState {
            volume,
            ..PlaybackState::default()
        };
        let eviction = EvictionPolicy::from(&config.cache);
        Self {
            bus_receiver,
            bus_sender,
            output,
            registry,
            store,
            origin,
            config,
            eviction,
            state,
            generation: 0,
            active_request: None,
            attached: None,
            transport: None,
            quality,
            backgrounded: false,
            remembered: None,
            duration_announced: false,
            ended_announced: false,
            notice_sent: false,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn emit(&self, message: PlaybackMessage) {
        let _ = self.bus_sender.send(Message::Playback(message));
    }

    fn set_status(&mut self, next: PlaybackStatus) {
        if self.state.transition(next) {
            self.emit(PlaybackMessage::StatusChanged(next));
        }
    }

    fn current_track_id(&self) -> Option<String> {
        self.state.current_track.as_ref().map(|track| track.id.clone())
    }

    /// Starts a play attempt: supersedes anything in flight, pauses the
    /// output and returns the work order for the resolution worker.
    pub fn begin_play(&mut self, request: PlayRequest) -> ResolveRequest {
        self.generation += 1;
        self.output.pause();
        if let Some(transport) = self.transport.as_ref() {
            transport.abort();
        }

        let bypass_cache = request.force_fresh || self.backgrounded;
        self.backgrounded = false;

        self.state.current_track = Some(request.track.clone());
        self.state.current_time = request.offset_secs.max(0.0);
        self.state.duration = None;
        self.duration_announced = false;
        self.ended_announced = false;
        self.active_request = Some(request.clone());
        self.set_status(PlaybackStatus::Loading);
        self.emit(PlaybackMessage::TrackLoading(request.track.clone()));
        debug!(
            "PlaybackResourceManager: play {} (generation {}, bypass_cache={})",
            request.track.id, self.generation, bypass_cache
        );

        ResolveRequest {
            generation: self.generation,
            request,
            bypass_cache,
            allow_streaming: self.config.playback.streaming_enabled,
            quality: self.quality,
        }
    }

    fn spawn_resolution(&self, resolve: ResolveRequest) {
        let store = Arc::clone(&self.store);
        let origin = Arc::clone(&self.origin);
        let bus_sender = self.bus_sender.clone();
        let eviction = self.eviction;
        thread::spawn(move || {
            let result = resolve_guarded(&store, origin.as_ref(), &resolve, &eviction);
            let _ = bus_sender.send(Message::Audio(AudioMessage::Resolved(ResolveOutcome {
                generation: resolve.generation,
                request: resolve.request,
                result,
            })));
        });
    }

    pub fn play(&mut self, request: PlayRequest) {
        let resolve = self.begin_play(request);
        self.spawn_resolution(resolve);
    }

    fn restart_without_streaming(&mut self, request: PlayRequest) {
        let mut resolve = self.begin_play(request);
        resolve.allow_streaming = false;
        self.spawn_resolution(resolve);
    }

    /// Reports a failed attempt. Only the first failure of a streak reaches
    /// the user as a notice.
    fn fail_attempt(&mut self, track: &Track, error: PlaybackError, status: Option<PlaybackStatus>) {
        warn!(
            "PlaybackResourceManager: playback of {} failed: {}",
            track.id, error
        );
        if let Some(status) = status {
            self.set_status(status);
        }
        self.emit(PlaybackMessage::PlaybackFailed {
            track_id: track.id.clone(),
            error: error.clone(),
        });
        if !self.notice_sent {
            self.notice_sent = true;
            let _ = self.bus_sender.send(Message::Notice(UserNotice {
                message: format!("Couldn't play \"{}\": {}", track.title, error),
            }));
        }
    }

    fn attach_blob(&mut self, bytes: AudioBytes) -> Result<AttachedSource, PlaybackError> {
        let url = self.registry.register(PlaybackSource::Blob(bytes));
        if let Err(err) = self.output.attach(&url) {
            self.registry.revoke(&url);
            return Err(err);
        }
        Ok(AttachedSource {
            url,
            streamed: false,
        })
    }

    fn attach_stream(
        &mut self,
        track_id: &str,
    ) -> Result<(AttachedSource, StreamingTransport), PlaybackError> {
        let mut transport =
            StreamingTransport::new(self.registry.clone(), self.config.streaming.clone());
        let output = &mut self.output;
        let url = transport.open(|url| output.attach(url))?;

        let origin = Arc::clone(&self.origin);
        let fetch_id = track_id.to_string();
        let quality = self.quality;
        let event_id = track_id.to_string();
        let bus_sender = self.bus_sender.clone();
        let store = Arc::clone(&self.store);
        let eviction = self.eviction;
        let generation = self.generation;
        transport.stream(
            move || origin.open_stream(&fetch_id, quality),
            move |event| match event {
                StreamEvent::Progress(progress) => {
                    let _ = bus_sender.send(Message::Playback(PlaybackMessage::StreamProgress(
                        progress,
                    )));
                }
                StreamEvent::Completed(bytes) => {
                    cache_blob(&store, &event_id, &bytes, &eviction);
                    let _ = bus_sender.send(Message::Audio(AudioMessage::StreamCompleted {
                        generation,
                        track_id: event_id.clone(),
                    }));
                }
                StreamEvent::Failed(error) => {
                    let _ = bus_sender.send(Message::Audio(AudioMessage::StreamFailed {
                        generation,
                        track_id: event_id.clone(),
                        error,
                    }));
                }
            },
        );
        Ok((
            AttachedSource {
                url,
                streamed: true,
            },
            transport,
        ))
    }

    /// Swaps in the newly attached source, then releases the previous one.
    fn release_previous(&mut self, attached: AttachedSource, transport: Option<StreamingTransport>) {
        let previous_transport = match transport {
            Some(transport) => self.transport.replace(transport),
            None => self.transport.take(),
        };
        if let Some(mut previous_transport) = previous_transport {
            previous_transport.destroy();
        }
        if let Some(previous) = self.attached.replace(attached) {
            if !previous.streamed {
                self.registry.revoke(&previous.url);
            }
        }
    }

    /// Drops the bookkeeping for a source the output no longer plays after a
    /// failed attach.
    fn release_attachment(&mut self) {
        self.output.detach();
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        if let Some(previous) = self.attached.take() {
            if !previous.streamed {
                self.registry.revoke(&previous.url);
            }
        }
    }

    /// Applies a resolution outcome if it is still current.
    pub fn commit(&mut self, outcome: ResolveOutcome) -> CommitOutcome {
        if outcome.generation != self.generation {
            debug!(
                "PlaybackResourceManager: discarding superseded result for {} (generation {} < {})",
                outcome.request.track.id, outcome.generation, self.generation
            );
            return CommitOutcome::Superseded;
        }
        // Pause/seek/resume issued while loading live on the active request.
        let request = self.active_request.clone().unwrap_or(outcome.request);
        let track = request.track.clone();

        let source = match outcome.result {
            Ok(source) => source,
            Err(err) => {
                self.fail_attempt(&track, err, Some(PlaybackStatus::Idle));
                return CommitOutcome::Failed;
            }
        };

        let attached = match source {
            ResolvedSource::Blob { bytes, from_cache } => {
                debug!(
                    "PlaybackResourceManager: attaching {} bytes for {} (cached={})",
                    bytes.len(),
                    track.id,
                    from_cache
                );
                self.attach_blob(bytes).map(|attached| (attached, None))
            }
            ResolvedSource::Stream => match self.attach_stream(&track.id) {
                Ok((attached, transport)) => Ok((attached, Some(transport))),
                Err(err) => {
                    warn!(
                        "PlaybackResourceManager: streaming unavailable for {} ({}), downloading instead",
                        track.id, err
                    );
                    self.release_attachment();
                    self.restart_without_streaming(request);
                    return CommitOutcome::FellBack;
                }
            },
        };
        let (attached, transport) = match attached {
            Ok(attached) => attached,
            Err(err) => {
                self.release_attachment();
                self.fail_attempt(&track, err, Some(PlaybackStatus::Idle));
                return CommitOutcome::Failed;
            }
        };
        self.release_previous(attached, transport);

        if request.offset_secs > 0.0 {
            self.output.seek(request.offset_secs);
        }
        self.output.set_volume(self.state.volume);
        self.state.current_time = request.offset_secs.max(0.0);

        if !request.autoplay {
            self.set_status(PlaybackStatus::Paused);
            self.emit(PlaybackMessage::Paused {
                track_id: track.id.clone(),
                position_secs: self.state.current_time,
            });
            return CommitOutcome::Committed;
        }
        match self.output.play() {
            Ok(()) => {
                self.set_status(PlaybackStatus::Playing);
                self.notice_sent = false;
                self.emit(PlaybackMessage::Started {
                    track,
                    resumed: false,
                });
                CommitOutcome::Committed
            }
            Err(err) => {
                // Keep the track current so a later resume can retry.
                self.fail_attempt(&track, err, Some(PlaybackStatus::Paused));
                CommitOutcome::Failed
            }
        }
    }

    /// Records the position and pauses. Repeated calls are no-ops.
    pub fn pause(&mut self) {
        match self.state.status {
            PlaybackStatus::Playing => {
                self.output.pause();
                self.state.current_time = self.output.position_secs();
                self.set_status(PlaybackStatus::Paused);
                if let Some(track_id) = self.current_track_id() {
                    self.emit(PlaybackMessage::Paused {
                        track_id,
                        position_secs: self.state.current_time,
                    });
                }
            }
            PlaybackStatus::Loading => {
                if let Some(request) = self.active_request.as_mut() {
                    if request.autoplay {
                        request.autoplay = false;
                        let track_id = request.track.id.clone();
                        self.emit(PlaybackMessage::Paused {
                            track_id,
                            position_secs: self.state.current_time,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    /// Continues the attached source, or re-resolves the current track when
    /// nothing is attached.
    pub fn resume(&mut self) {
        match self.state.status {
            PlaybackStatus::Playing => {}
            PlaybackStatus::Loading => {
                if let Some(request) = self.active_request.as_mut() {
                    request.autoplay = true;
                }
            }
            PlaybackStatus::Paused | PlaybackStatus::Ended if self.attached.is_some() => {
                if self.state.status == PlaybackStatus::Ended {
                    self.output.seek(0.0);
                    self.state.current_time = 0.0;
                    self.ended_announced = false;
                }
                let Some(track) = self.state.current_track.clone() else {
                    return;
                };
                match self.output.play() {
                    Ok(()) => {
                        self.set_status(PlaybackStatus::Playing);
                        self.notice_sent = false;
                        self.emit(PlaybackMessage::Started {
                            track,
                            resumed: true,
                        });
                    }
                    Err(err) => self.fail_attempt(&track, err, None),
                }
            }
            _ => match self.state.current_track.clone() {
                Some(track) => {
                    let request = PlayRequest {
                        offset_secs: self.state.current_time,
                        ..PlayRequest::new(track)
                    };
                    self.play(request);
                }
                None => debug!("PlaybackResourceManager: nothing to resume"),
            },
        }
    }

    pub fn seek(&mut self, position_secs: f64) {
        if !position_secs.is_finite() {
            warn!("PlaybackResourceManager: ignoring non-finite seek");
            return;
        }
        let mut target = position_secs.max(0.0);
        if let Some(duration) = self.state.duration {
            target = target.min(duration);
        }
        self.state.current_time = target;

        if self.state.status == PlaybackStatus::Loading {
            if let Some(request) = self.active_request.as_mut() {
                request.offset_secs = target;
            }
        } else if self.attached.is_some() {
            self.output.seek(target);
            if self.state.status == PlaybackStatus::Ended {
                self.ended_announced = false;
                self.set_status(PlaybackStatus::Paused);
            }
        } else if let Some(request) = self.active_request.as_mut() {
            request.offset_secs = target;
        }
        self.emit(PlaybackMessage::TimeProgress {
            position_secs: target,
            duration_secs: self.state.duration,
        });
    }

    pub fn set_volume(&mut self, volume: f32) {
        if !volume.is_finite() {
            warn!("PlaybackResourceManager: ignoring non-finite volume");
            return;
        }
        let volume = volume.clamp(0.0, 1.0);
        self.output.set_volume(volume);
        self.state.volume = volume;
        settings::store_json(&lock_store(&self.store), SettingKey::Volume, &volume);
        self.emit(PlaybackMessage::VolumeChanged(volume));
    }

    pub fn set_audio_quality(&mut self, quality: AudioQuality) {
        if self.quality == quality {
            return;
        }
        info!("PlaybackResourceManager: audio quality set to {:?}", quality);
        self.quality = quality;
        settings::store_json(&lock_store(&self.store), SettingKey::AudioQuality, &quality);
    }

    pub fn on_visibility_changed(&mut self, visible: bool) {
        if !visible {
            if let Some(track) = self.state.current_track.clone() {
                let position_secs = if self.attached.is_some() {
                    self.output.position_secs()
                } else {
                    self.state.current_time
                };
                self.remembered = Some(RememberedPlayback {
                    track,
                    position_secs,
                    was_playing: self.state.is_playing(),
                });
            }
            self.backgrounded = true;
            return;
        }

        let Some(remembered) = self.remembered.take() else {
            return;
        };
        if !self.config.playback.refresh_after_background || self.state.is_playing() {
            return;
        }
        info!(
            "PlaybackResourceManager: refreshing {} after returning to foreground",
            remembered.track.id
        );
        self.play(PlayRequest {
            track: remembered.track,
            offset_secs: remembered.position_secs,
            force_fresh: true,
            autoplay: remembered.was_playing,
        });
    }

    fn on_stream_failed(&mut self, generation: u64, track_id: &str, error: PlaybackError) {
        if generation != self.generation {
            return;
        }
        let Some(track) = self
            .state
            .current_track
            .clone()
            .filter(|track| track.id == track_id)
        else {
            return;
        };
        if !error.is_decode() {
            self.fail_attempt(&track, error, None);
            return;
        }
        warn!(
            "PlaybackResourceManager: stream append failed for {} ({}), falling back to full download",
            track_id, error
        );
        let position_secs = if self.attached.is_some() {
            self.output.position_secs()
        } else {
            self.state.current_time
        };
        let autoplay = self.state.is_playing()
            || self
                .active_request
                .as_ref()
                .is_some_and(|request| request.autoplay);
        self.restart_without_streaming(PlayRequest {
            track,
            offset_secs: position_secs,
            force_fresh: false,
            autoplay,
        });
    }

    /// Publishes progress and detects errors and the end of the track.
    pub fn on_progress_tick(&mut self) {
        if let Some(err) = self.output.take_error() {
            if let Some(track) = self.state.current_track.clone() {
                self.fail_attempt(&track, err, Some(PlaybackStatus::Idle));
            }
            return;
        }
        if self.state.status != PlaybackStatus::Playing {
            return;
        }

        let position_secs = self.output.position_secs();
        self.state.current_time = position_secs;
        let duration = self
            .output
            .duration_secs()
            .filter(|duration| duration.is_finite() && *duration > 0.0);
        if let Some(duration) = duration {
            self.state.duration = Some(duration);
            if !self.duration_announced {
                self.duration_announced = true;
                self.emit(PlaybackMessage::DurationKnown(duration));
            }
        }
        self.emit(PlaybackMessage::TimeProgress {
            position_secs,
            duration_secs: self.state.duration,
        });

        if self.output.has_ended() && !self.ended_announced {
            self.ended_announced = true;
            self.set_status(PlaybackStatus::Ended);
            if let Some(track_id) = self.current_track_id() {
                self.emit(PlaybackMessage::Ended { track_id });
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Playback(PlaybackMessage::Play(request)) => self.play(request),
            Message::Playback(PlaybackMessage::Resume) => self.resume(),
            Message::Playback(PlaybackMessage::Pause) => self.pause(),
            Message::Playback(PlaybackMessage::Seek(position_secs)) => self.seek(position_secs),
            Message::Playback(PlaybackMessage::SetVolume(volume)) => self.set_volume(volume),
            Message::Playback(PlaybackMessage::SetAudioQuality(quality)) => {
                self.set_audio_quality(quality)
            }
            Message::Playback(PlaybackMessage::VisibilityChanged { visible }) => {
                self.on_visibility_changed(visible)
            }
            Message::Audio(AudioMessage::Resolved(outcome)) => {
                let _ = self.commit(outcome);
            }
            Message::Audio(AudioMessage::StreamFailed {
                generation,
                track_id,
                error,
            }) => self.on_stream_failed(generation, &track_id, error),
            Message::Audio(AudioMessage::StreamCompleted {
                generation,
                track_id,
            }) => debug!(
                "PlaybackResourceManager: stream for {} complete (generation {})",
                track_id, generation
            ),
            Message::Audio(AudioMessage::ProgressTick) => self.on_progress_tick(),
            _ => {}
        }
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_receiver.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "PlaybackResourceManager lagged on bus, skipped {} message(s)",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_support::MemoryOrigin;
    use crate::playback::output::test_support::FakeOutput;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    struct Fixture {
        manager: PlaybackResourceManager<FakeOutput>,
        output: FakeOutput,
        registry: SourceRegistry,
        store: Arc<Mutex<DbManager>>,
        origin: Arc<MemoryOrigin>,
        receiver: Receiver<Message>,
    }

    fn track(id: &str) -> Track {
        Track::from_catalog_json(&json!({ "id": id, "title": format!("Song {id}") }))
    }

    fn fixture_with(config: Config, origin: MemoryOrigin) -> Fixture {
        let (bus_sender, _) = broadcast::channel(1024);
        let receiver = bus_sender.subscribe();
        let registry = SourceRegistry::new();
        let output = FakeOutput::new(registry.clone());
        let store = Arc::new(Mutex::new(DbManager::new_in_memory().expect("db")));
        let origin = Arc::new(origin);
        let manager = PlaybackResourceManager::new(
            bus_sender.subscribe(),
            bus_sender,
            output.clone(),
            registry.clone(),
            Arc::clone(&store),
            origin.clone(),
            config,
        );
        Fixture {
            manager,
            output,
            registry,
            store,
            origin,
            receiver,
        }
    }

    fn blob_config() -> Config {
        let mut config = Config::default();
        config.playback.streaming_enabled = false;
        config
    }

    fn fixture() -> Fixture {
        fixture_with(
            blob_config(),
            MemoryOrigin::default()
                .with_body("a", vec![1; 32])
                .with_body("b", vec![2; 32]),
        )
    }

    fn drain(receiver: &mut Receiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return messages,
            }
        }
    }

    fn resolved(fixture: &Fixture, resolve: &ResolveRequest) -> ResolveOutcome {
        let store = fixture.store.as_ref();
        let result = resolve_audio(
            store,
            fixture.origin.as_ref(),
            resolve,
            &EvictionPolicy::default(),
        );
        ResolveOutcome {
            generation: resolve.generation,
            request: resolve.request.clone(),
            result,
        }
    }

    fn wait_for<F>(receiver: &mut Receiver<Message>, mut predicate: F) -> Message
    where
        F: FnMut(&Message) -> bool,
    {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < Duration::from_secs(2),
                "timed out waiting for expected message"
            );
            match receiver.try_recv() {
                Ok(message) if predicate(&message) => return message,
                Ok(_) => {}
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed"),
            }
        }
    }

    #[test]
    fn test_superseded_result_is_discarded_but_still_cached() {
        let mut fx = fixture();
        let first = fx.manager.begin_play(PlayRequest::new(track("a")));
        let second = fx.manager.begin_play(PlayRequest::new(track("b")));

        let second_outcome = resolved(&fx, &second);
        assert_eq!(fx.manager.commit(second_outcome), CommitOutcome::Committed);
        let first_outcome = resolved(&fx, &first);
        assert_eq!(fx.manager.commit(first_outcome), CommitOutcome::Superseded);

        let state = fx.manager.state();
        assert_eq!(state.current_track.as_ref().map(|t| t.id.as_str()), Some("b"));
        assert!(state.is_playing());
        assert_eq!(fx.output.lock().attach_log.len(), 1);
        let db = lock_store(&fx.store);
        assert!(db.get_blob("a").expect("blob").is_some());
        assert!(db.get_blob("b").expect("blob").is_some());
    }

    #[test]
    fn test_cache_hit_skips_origin_and_force_fresh_bypasses_it() {
        let mut fx = fixture();
        lock_store(&fx.store).put_blob("a", &[9; 8]).expect("seed");

        let cached = fx.manager.begin_play(PlayRequest::new(track("a")));
        assert!(!cached.bypass_cache);
        let outcome = resolved(&fx, &cached);
        assert!(matches!(
            outcome.result,
            Ok(ResolvedSource::Blob { from_cache: true, .. })
        ));
        assert_eq!(fx.origin.fetches(), 0);

        let fresh = fx.manager.begin_play(PlayRequest {
            force_fresh: true,
            ..PlayRequest::new(track("a"))
        });
        assert!(fresh.bypass_cache);
        let outcome = resolved(&fx, &fresh);
        assert!(matches!(
            outcome.result,
            Ok(ResolvedSource::Blob { from_cache: false, .. })
        ));
        assert_eq!(fx.origin.fetches(), 1);
        assert_eq!(
            lock_store(&fx.store).get_blob("a").expect("blob"),
            Some(vec![1; 32])
        );
    }

    #[test]
    fn test_previous_url_revoked_only_after_new_attach() {
        let mut fx = fixture();
        let first = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &first);
        fx.manager.commit(outcome);
        let first_url = fx.output.lock().attached.clone().expect("attached");

        let second = fx.manager.begin_play(PlayRequest::new(track("b")));
        assert!(fx.registry.is_live(&first_url));
        let outcome = resolved(&fx, &second);
        fx.manager.commit(outcome);

        let output = fx.output.lock();
        // Both URLs were live while the second one was attached.
        assert_eq!(output.attach_log[1].1, 2);
        assert!(!fx.registry.is_live(&first_url));
        assert!(fx.registry.is_live(output.attached.as_deref().expect("attached")));
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut fx = fixture();
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &resolve);
        fx.manager.commit(outcome);
        fx.output.lock().position_secs = 12.5;
        drain(&mut fx.receiver);

        fx.manager.pause();
        fx.manager.pause();
        let paused: Vec<f64> = drain(&mut fx.receiver)
            .into_iter()
            .filter_map(|message| match message {
                Message::Playback(PlaybackMessage::Paused { position_secs, .. }) => {
                    Some(position_secs)
                }
                _ => None,
            })
            .collect();
        assert_eq!(paused, vec![12.5]);
        assert_eq!(fx.manager.state().status, PlaybackStatus::Paused);
        assert_eq!(fx.manager.state().current_time, 12.5);
    }

    #[test]
    fn test_volume_is_clamped_and_persisted() {
        let mut fx = fixture();
        fx.manager.set_volume(1.7);
        assert_eq!(fx.output.lock().volume, 1.0);
        fx.manager.set_volume(-0.2);
        assert_eq!(fx.manager.state().volume, 0.0);
        fx.manager.set_volume(f32::NAN);
        assert_eq!(fx.manager.state().volume, 0.0);
        fx.manager.set_volume(0.35);
        assert_eq!(
            settings::load_volume(&lock_store(&fx.store)),
            Some(0.35)
        );
    }

    struct PanickingOrigin;

    impl AudioOrigin for PanickingOrigin {
        fn fetch(&self, track_id: &str, _quality: AudioQuality) -> Result<Vec<u8>, PlaybackError> {
            panic!("origin blew up fetching {track_id}");
        }

        fn open_stream(
            &self,
            track_id: &str,
            _quality: AudioQuality,
        ) -> Result<crate::backends::OriginStream, PlaybackError> {
            panic!("origin blew up streaming {track_id}");
        }
    }

    #[test]
    fn test_panicking_resolution_still_posts_failed_outcome() {
        let (bus_sender, _) = broadcast::channel(64);
        let mut receiver = bus_sender.subscribe();
        let registry = SourceRegistry::new();
        let output = FakeOutput::new(registry.clone());
        let store = Arc::new(Mutex::new(DbManager::new_in_memory().expect("db")));
        let mut manager = PlaybackResourceManager::new(
            bus_sender.subscribe(),
            bus_sender,
            output,
            registry,
            store,
            Arc::new(PanickingOrigin),
            blob_config(),
        );

        manager.play(PlayRequest::new(track("a")));
        assert_eq!(manager.state().status, PlaybackStatus::Loading);
        let message = wait_for(&mut receiver, |message| {
            matches!(message, Message::Audio(AudioMessage::Resolved(_)))
        });
        let Message::Audio(AudioMessage::Resolved(outcome)) = message else {
            unreachable!();
        };
        assert!(matches!(outcome.result, Err(PlaybackError::Network(_))));

        assert_eq!(manager.commit(outcome), CommitOutcome::Failed);
        assert_eq!(manager.state().status, PlaybackStatus::Idle);
        assert!(drain(&mut receiver).iter().any(|message| matches!(
            message,
            Message::Playback(PlaybackMessage::PlaybackFailed { track_id, .. }) if track_id == "a"
        )));
    }

    #[test]
    fn test_failed_attach_releases_previous_source() {
        let mut fx = fixture();
        let first = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &first);
        fx.manager.commit(outcome);
        let first_url = fx.output.lock().attached.clone().expect("attached");

        fx.output.lock().fail_next_attach = Some(PlaybackError::Output("device gone".to_string()));
        let second = fx.manager.begin_play(PlayRequest::new(track("b")));
        let outcome = resolved(&fx, &second);
        assert_eq!(fx.manager.commit(outcome), CommitOutcome::Failed);

        assert_eq!(fx.output.lock().attached, None);
        assert!(!fx.registry.is_live(&first_url));
        assert_eq!(fx.registry.live_count(), 0);
        assert_eq!(fx.manager.state().status, PlaybackStatus::Idle);

        // Seeking while idle targets the next attempt, not the dropped source.
        fx.output.lock().position_secs = 0.0;
        fx.manager.seek(30.0);
        assert_eq!(fx.output.lock().position_secs, 0.0);
        assert_eq!(
            fx.manager.active_request.as_ref().map(|request| request.offset_secs),
            Some(30.0)
        );
    }

    #[test]
    fn test_network_failure_reports_once_and_leaves_idle() {
        let mut fx = fixture();
        for _ in 0..2 {
            let resolve = fx.manager.begin_play(PlayRequest::new(track("missing")));
            let outcome = resolved(&fx, &resolve);
            assert_eq!(fx.manager.commit(outcome), CommitOutcome::Failed);
        }
        let messages = drain(&mut fx.receiver);
        let failures = messages
            .iter()
            .filter(|message| {
                matches!(
                    message,
                    Message::Playback(PlaybackMessage::PlaybackFailed {
                        error: PlaybackError::Network(_),
                        ..
                    })
                )
            })
            .count();
        let notices = messages
            .iter()
            .filter(|message| matches!(message, Message::Notice(_)))
            .count();
        assert_eq!(failures, 2);
        assert_eq!(notices, 1);
        assert_eq!(fx.manager.state().status, PlaybackStatus::Idle);
    }

    #[test]
    fn test_autoplay_failure_keeps_track_current_but_not_playing() {
        let mut fx = fixture();
        fx.output.lock().fail_next_play = Some(PlaybackError::Decode("blocked".to_string()));
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &resolve);
        assert_eq!(fx.manager.commit(outcome), CommitOutcome::Failed);

        let state = fx.manager.state();
        assert!(!state.is_playing());
        assert_eq!(state.current_track.as_ref().map(|t| t.id.as_str()), Some("a"));

        fx.manager.resume();
        assert!(fx.manager.state().is_playing());
    }

    #[test]
    fn test_progress_tick_reports_duration_once_and_end_once() {
        let mut fx = fixture();
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &resolve);
        fx.manager.commit(outcome);
        drain(&mut fx.receiver);
        {
            let mut output = fx.output.lock();
            output.duration_secs = Some(180.0);
            output.position_secs = 179.9;
        }
        fx.manager.on_progress_tick();
        fx.output.lock().ended = true;
        fx.manager.on_progress_tick();
        fx.manager.on_progress_tick();

        let messages = drain(&mut fx.receiver);
        let durations = messages
            .iter()
            .filter(|m| matches!(m, Message::Playback(PlaybackMessage::DurationKnown(_))))
            .count();
        let ended = messages
            .iter()
            .filter(|m| matches!(m, Message::Playback(PlaybackMessage::Ended { .. })))
            .count();
        assert_eq!(durations, 1);
        assert_eq!(ended, 1);
        assert_eq!(fx.manager.state().status, PlaybackStatus::Ended);
    }

    #[test]
    fn test_seek_while_loading_applies_on_commit() {
        let mut fx = fixture();
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        fx.manager.seek(42.0);
        fx.manager.pause();
        let outcome = resolved(&fx, &resolve);
        fx.manager.commit(outcome);
        let output = fx.output.lock();
        assert_eq!(output.position_secs, 42.0);
        assert!(output.paused);
        assert_eq!(fx.manager.state().status, PlaybackStatus::Paused);
    }

    #[test]
    fn test_background_refresh_refetches_remembered_track() {
        let mut fx = fixture();
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &resolve);
        fx.manager.commit(outcome);
        assert_eq!(fx.origin.fetches(), 1);
        fx.output.lock().position_secs = 30.0;
        fx.manager.pause();

        fx.manager.on_visibility_changed(false);
        let generation = fx.manager.generation();
        fx.manager.on_visibility_changed(true);
        assert_eq!(fx.manager.generation(), generation + 1);

        let outcome = wait_for(&mut fx.receiver, |message| {
            matches!(message, Message::Audio(AudioMessage::Resolved(_)))
        });
        let Message::Audio(AudioMessage::Resolved(outcome)) = outcome else {
            unreachable!();
        };
        assert!(outcome.request.force_fresh);
        assert_eq!(outcome.request.offset_secs, 30.0);
        assert!(!outcome.request.autoplay);
        assert_eq!(fx.origin.fetches(), 2);
        fx.manager.commit(outcome);
        assert_eq!(fx.output.lock().position_secs, 30.0);
    }

    #[test]
    fn test_stream_miss_attaches_stream_and_caches_on_completion() {
        let mut config = Config::default();
        config.streaming.segment_bytes = 8;
        config.streaming.release_grace_ms = 0;
        let mut fx = fixture_with(config, MemoryOrigin::default().with_body("a", vec![5; 20]));

        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        assert!(resolve.allow_streaming);
        let outcome = resolved(&fx, &resolve);
        assert!(matches!(outcome.result, Ok(ResolvedSource::Stream)));
        assert_eq!(fx.manager.commit(outcome), CommitOutcome::Committed);
        assert!(fx.manager.state().is_playing());

        wait_for(&mut fx.receiver, |message| {
            matches!(message, Message::Audio(AudioMessage::StreamCompleted { .. }))
        });
        assert_eq!(
            lock_store(&fx.store).get_blob("a").expect("blob"),
            Some(vec![5; 20])
        );
        assert_eq!(fx.origin.fetches(), 0);
    }

    #[test]
    fn test_stream_append_failure_falls_back_to_full_download() {
        let mut fx = fixture_with(
            Config::default(),
            MemoryOrigin::default().with_body("a", vec![5; 20]),
        );
        let resolve = fx.manager.begin_play(PlayRequest::new(track("a")));
        let outcome = resolved(&fx, &resolve);
        fx.manager.commit(outcome);
        let generation = fx.manager.generation();

        fx.manager.handle_message(Message::Audio(AudioMessage::StreamFailed {
            generation,
            track_id: "a".to_string(),
            error: PlaybackError::Decode("quota".to_string()),
        }));
        assert_eq!(fx.manager.generation(), generation + 1);

        let message = wait_for(&mut fx.receiver, |message| {
            matches!(message, Message::Audio(AudioMessage::Resolved(_)))
        });
        let Message::Audio(AudioMessage::Resolved(outcome)) = message else {
            unreachable!();
        };
        // The aborted stream may already have cached the body; either way a blob comes back.
        assert!(matches!(outcome.result, Ok(ResolvedSource::Blob { .. })));
        assert_eq!(fx.manager.commit(outcome), CommitOutcome::Committed);
        assert!(fx.manager.state().is_playing());
    }

    #[test]
    fn test_run_loop_plays_requested_track() {
        let (bus_sender, _) = broadcast::channel(256);
        let mut receiver = bus_sender.subscribe();
        let registry = SourceRegistry::new();
        let output = FakeOutput::new(registry.clone());
        let manager_receiver = bus_sender.subscribe();
        let manager_sender = bus_sender.clone();
        let store = Arc::new(Mutex::new(DbManager::new_in_memory().expect("db")));
        let origin: Arc<dyn AudioOrigin> =
            Arc::new(MemoryOrigin::default().with_body("a", vec![1; 16]));
        let config = blob_config();
        let manager_output = output.clone();
        thread::spawn(move || {
            let mut manager = PlaybackResourceManager::new(
                manager_receiver,
                manager_sender,
                manager_output,
                registry,
                store,
                origin,
                config,
            );
            manager.run();
        });

        bus_sender
            .send(Message::Playback(PlaybackMessage::Play(PlayRequest::new(
                track("a"),
            ))))
            .expect("send");
        let started = wait_for(&mut receiver, |message| {
            matches!(
                message,
                Message::Playback(PlaybackMessage::Started { resumed: false, .. })
            )
        });
        let Message::Playback(PlaybackMessage::Started { track, .. }) = started else {
            unreachable!();
        };
        assert_eq!(track.id, "a");
        assert!(!output.lock().paused);
    }
}
