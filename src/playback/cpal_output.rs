//! cpal-backed [`AudioOutput`]: symphonia decode thread, rubato resampling and
//! a render callback that drains the decoded sample queue.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use log::{debug, error, warn};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::PlaybackError;
use crate::playback::output::AudioOutput;
use crate::playback::source_registry::{PlaybackSource, SourceRegistry};

/// Decoded audio kept ahead of the render cursor.
const MAX_BUFFERED_SECS: f64 = 2.0;
const RESAMPLER_CHUNK_FRAMES: usize = 1024;
const BLOB_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const END_SEEK_TOLERANCE_SECS: f64 = 0.05;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the control side, the decode thread and the render callback.
struct SharedPlayback {
    samples: Mutex<VecDeque<f32>>,
    playing: AtomicBool,
    ended: AtomicBool,
    decode_done: AtomicBool,
    volume: AtomicU32,
    /// Frames rendered since `base_secs`.
    frames_played: AtomicU64,
    base_secs: Mutex<f64>,
    duration_secs: Mutex<Option<f64>>,
    seek_request: Mutex<Option<f64>>,
    error: Mutex<Option<PlaybackError>>,
    /// Bumped on every attach; stale decode threads exit when it moves on.
    attachment: AtomicU64,
    output_rate: AtomicU32,
    output_channels: AtomicU32,
}

impl SharedPlayback {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            playing: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            decode_done: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
            frames_played: AtomicU64::new(0),
            base_secs: Mutex::new(0.0),
            duration_secs: Mutex::new(None),
            seek_request: Mutex::new(None),
            error: Mutex::new(None),
            attachment: AtomicU64::new(0),
            output_rate: AtomicU32::new(44_100),
            output_channels: AtomicU32::new(2),
        }
    }

    fn channels(&self) -> usize {
        self.output_channels.load(Ordering::Relaxed).max(1) as usize
    }

    fn rate(&self) -> u32 {
        self.output_rate.load(Ordering::Relaxed).max(1)
    }

    fn position_secs(&self) -> f64 {
        let frames = self.frames_played.load(Ordering::Relaxed) as f64;
        *lock(&self.base_secs) + frames / f64::from(self.rate())
    }

    /// Restarts the position clock at `secs` and drops buffered audio.
    fn rebase(&self, secs: f64) {
        lock(&self.samples).clear();
        *lock(&self.base_secs) = secs;
        self.frames_played.store(0, Ordering::Relaxed);
        self.ended.store(false, Ordering::Relaxed);
    }

    fn record_error(&self, err: PlaybackError) {
        error!("CpalOutput: {}", err);
        *lock(&self.error) = Some(err);
    }

    fn buffered_secs(&self) -> f64 {
        let frames = lock(&self.samples).len() / self.channels();
        frames as f64 / f64::from(self.rate())
    }
}

/// Fills `output_buffer` from the shared queue, emitting silence when paused
/// or starved. Marks the source ended once decoding is done and the queue drains.
fn render_output_buffer<T>(output_buffer: &mut [T], shared: &SharedPlayback)
where
    T: SizedSample + FromSample<f32>,
{
    let silence = T::EQUILIBRIUM;
    if !shared.playing.load(Ordering::Relaxed) {
        output_buffer.fill(silence);
        return;
    }

    let gain = f32::from_bits(shared.volume.load(Ordering::Relaxed)).clamp(0.0, 1.0);
    let channels = shared.channels();
    let mut samples = lock(&shared.samples);
    let mut written = 0;
    for slot in output_buffer.iter_mut() {
        match samples.pop_front() {
            Some(sample) => {
                *slot = T::from_sample((sample * gain).clamp(-1.0, 1.0));
                written += 1;
            }
            None => *slot = silence,
        }
    }
    let drained = samples.is_empty();
    drop(samples);

    shared
        .frames_played
        .fetch_add((written / channels) as u64, Ordering::Relaxed);
    if drained && shared.decode_done.load(Ordering::Relaxed) {
        shared.playing.store(false, Ordering::Relaxed);
        shared.ended.store(true, Ordering::Relaxed);
    }
}

/// Maps interleaved frames between channel layouts. Extra output channels
/// repeat the source channels; surplus source channels are dropped.
fn map_channels(interleaved: &[f32], source_channels: usize, output_channels: usize) -> Vec<f32> {
    if source_channels == output_channels || source_channels == 0 {
        return interleaved.to_vec();
    }
    let frames = interleaved.len() / source_channels;
    let mut mapped = Vec::with_capacity(frames * output_channels);
    for frame in interleaved.chunks_exact(source_channels) {
        for channel in 0..output_channels {
            mapped.push(frame[channel % source_channels]);
        }
    }
    mapped
}

/// Chunked sample-rate converter over interleaved input.
struct StreamResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<Vec<f32>>,
    channels: usize,
}

impl StreamResampler {
    fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, PlaybackError> {
        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            RESAMPLER_CHUNK_FRAMES,
            2,
            channels,
        )
        .map_err(|err| PlaybackError::Output(format!("resampler setup failed: {err}")))?;
        Ok(Self {
            inner,
            pending: vec![Vec::new(); channels],
            channels,
        })
    }

    fn interleave(planar: &[Vec<f32>], out: &mut Vec<f32>) {
        let frames = planar.first().map(Vec::len).unwrap_or(0);
        for frame in 0..frames {
            for channel in planar {
                out.push(channel[frame]);
            }
        }
    }

    fn push(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<(), PlaybackError> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (channel, sample) in frame.iter().enumerate() {
                self.pending[channel].push(*sample);
            }
        }
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let resampled = self
                .inner
                .process(&chunk, None)
                .map_err(|err| PlaybackError::Decode(format!("resampling failed: {err}")))?;
            Self::interleave(&resampled, out);
        }
    }

    fn flush(&mut self, out: &mut Vec<f32>) -> Result<(), PlaybackError> {
        if self.pending[0].is_empty() {
            return Ok(());
        }
        let rest: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        let resampled = self
            .inner
            .process_partial(Some(rest.as_slice()), None)
            .map_err(|err| PlaybackError::Decode(format!("resampling failed: {err}")))?;
        Self::interleave(&resampled, out);
        Ok(())
    }
}

struct OpenedTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    duration_secs: Option<f64>,
}

fn open_track(media: Box<dyn MediaSource>) -> Result<OpenedTrack, PlaybackError> {
    let stream = MediaSourceStream::new(media, Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| PlaybackError::Decode(format!("unrecognized audio: {err}")))?;
    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| PlaybackError::Decode("no default track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let duration_secs = match (track.codec_params.time_base, track.codec_params.n_frames) {
        (Some(time_base), Some(frames)) => {
            let time = time_base.calc_time(frames);
            Some(time.seconds as f64 + time.frac)
        }
        _ => None,
    };
    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| PlaybackError::Decode(format!("unsupported codec: {err}")))?;
    Ok(OpenedTrack {
        format,
        decoder,
        track_id,
        sample_rate,
        duration_secs,
    })
}

/// Decode loop for one attachment. Stays alive after end of stream so
/// seeks can restart decoding.
fn run_decode_thread(
    shared: Arc<SharedPlayback>,
    attachment: u64,
    media: Box<dyn MediaSource>,
    probe_result: mpsc::Sender<Result<(), PlaybackError>>,
) {
    let is_current = || shared.attachment.load(Ordering::SeqCst) == attachment;
    let mut track = match open_track(media) {
        Ok(track) => {
            let _ = probe_result.send(Ok(()));
            track
        }
        Err(err) => {
            let _ = probe_result.send(Err(err.clone()));
            if is_current() {
                shared.decode_done.store(true, Ordering::SeqCst);
                shared.record_error(err);
            }
            return;
        }
    };
    if !is_current() {
        return;
    }
    *lock(&shared.duration_secs) = track.duration_secs;

    let output_rate = shared.rate();
    let output_channels = shared.channels();
    let mut resampler: Option<StreamResampler> = None;
    let mut resampler_channels = 0usize;

    while is_current() {
        if let Some(target) = lock(&shared.seek_request).take() {
            let seek = track.format.seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(target),
                    track_id: Some(track.track_id),
                },
            );
            match seek {
                Ok(seeked) => {
                    track.decoder.reset();
                    resampler = None;
                    shared.decode_done.store(false, Ordering::SeqCst);
                    let actual = track
                        .format
                        .tracks()
                        .iter()
                        .find(|candidate| candidate.id == track.track_id)
                        .and_then(|candidate| candidate.codec_params.time_base)
                        .map(|time_base| {
                            let time = time_base.calc_time(seeked.actual_ts);
                            time.seconds as f64 + time.frac
                        })
                        .unwrap_or(target);
                    shared.rebase(actual);
                }
                Err(err) => warn!("CpalOutput: seek to {:.2}s failed: {}", target, err),
            }
        }

        if shared.decode_done.load(Ordering::SeqCst)
            || shared.buffered_secs() >= MAX_BUFFERED_SECS
        {
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        let packet = match track.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                let mut tail = Vec::new();
                if let Some(active) = resampler.as_mut() {
                    if let Err(err) = active.flush(&mut tail) {
                        warn!("CpalOutput: {}", err);
                    }
                }
                lock(&shared.samples).extend(tail);
                shared.decode_done.store(true, Ordering::SeqCst);
                debug!("CpalOutput: end of stream");
                continue;
            }
            Err(err) => {
                shared.decode_done.store(true, Ordering::SeqCst);
                shared.record_error(PlaybackError::Decode(format!("read failed: {err}")));
                continue;
            }
        };
        if packet.track_id() != track.track_id {
            continue;
        }

        let decoded = match track.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                warn!("CpalOutput: skipping corrupt packet: {}", err);
                continue;
            }
            Err(err) => {
                shared.decode_done.store(true, Ordering::SeqCst);
                shared.record_error(PlaybackError::Decode(err.to_string()));
                continue;
            }
        };
        let spec = *decoded.spec();
        let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buffer.copy_interleaved_ref(decoded);
        let mapped = map_channels(
            sample_buffer.samples(),
            spec.channels.count(),
            output_channels,
        );

        let source_rate = if spec.rate > 0 { spec.rate } else { track.sample_rate };
        if source_rate == output_rate {
            lock(&shared.samples).extend(mapped);
            continue;
        }
        if resampler.is_none() || resampler_channels != output_channels {
            match StreamResampler::new(source_rate, output_rate, output_channels) {
                Ok(created) => {
                    resampler = Some(created);
                    resampler_channels = output_channels;
                }
                Err(err) => {
                    shared.decode_done.store(true, Ordering::SeqCst);
                    shared.record_error(err);
                    continue;
                }
            }
        }
        let mut converted = Vec::with_capacity(mapped.len());
        if let Some(active) = resampler.as_mut() {
            if let Err(err) = active.push(&mapped, &mut converted) {
                shared.record_error(err);
            }
        }
        lock(&shared.samples).extend(converted);
    }
    debug!("CpalOutput: decode thread {} retired", attachment);
}

/// Default-device output. The cpal stream is built lazily on first use.
pub struct CpalOutput {
    registry: SourceRegistry,
    shared: Arc<SharedPlayback>,
    stream: Option<cpal::Stream>,
    attached: bool,
}

impl CpalOutput {
    pub fn new(registry: SourceRegistry) -> Self {
        Self {
            registry,
            shared: Arc::new(SharedPlayback::new()),
            stream: None,
            attached: false,
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        shared: Arc<SharedPlayback>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        device.build_output_stream(
            config,
            move |output_buffer: &mut [T], _: &cpal::OutputCallbackInfo| {
                render_output_buffer(output_buffer, &shared);
            },
            |err| error!("Audio stream error: {}", err),
            None,
        )
    }

    fn ensure_stream(&mut self) -> Result<(), PlaybackError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Output("no default output device".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|err| PlaybackError::Output(err.to_string()))?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.config();
        self.shared
            .output_rate
            .store(config.sample_rate.0, Ordering::Relaxed);
        self.shared
            .output_channels
            .store(u32::from(config.channels), Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let stream = match sample_format {
            cpal::SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, shared),
            cpal::SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, shared),
            cpal::SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, shared),
            other => {
                return Err(PlaybackError::Output(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        }
        .map_err(|err| PlaybackError::Output(err.to_string()))?;
        stream
            .play()
            .map_err(|err| PlaybackError::Output(err.to_string()))?;
        debug!(
            "CpalOutput: stream created ({} Hz, {} ch, {:?})",
            config.sample_rate.0, config.channels, sample_format
        );
        self.stream = Some(stream);
        Ok(())
    }
}

impl AudioOutput for CpalOutput {
    fn attach(&mut self, url: &str) -> Result<(), PlaybackError> {
        self.ensure_stream()?;
        let source = self
            .registry
            .resolve(url)
            .ok_or_else(|| PlaybackError::Output(format!("source {url} is not registered")))?;

        let attachment = self.shared.attachment.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.decode_done.store(false, Ordering::SeqCst);
        *lock(&self.shared.error) = None;
        *lock(&self.shared.duration_secs) = None;
        *lock(&self.shared.seek_request) = None;
        self.shared.rebase(0.0);

        let is_blob = matches!(source, PlaybackSource::Blob(_));
        let media: Box<dyn MediaSource> = match source {
            PlaybackSource::Blob(bytes) => Box::new(Cursor::new(bytes)),
            PlaybackSource::Stream(stream) => Box::new(stream.reader()),
        };
        let (probe_tx, probe_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || run_decode_thread(shared, attachment, media, probe_tx));
        self.attached = true;

        // Streamed bodies are probed while they arrive.
        if is_blob {
            match probe_rx.recv_timeout(BLOB_PROBE_TIMEOUT) {
                Ok(Err(err)) => {
                    *lock(&self.shared.error) = None;
                    self.attached = false;
                    return Err(err);
                }
                Ok(Ok(())) => {}
                Err(_) => warn!("CpalOutput: probe still running for {}", url),
            }
        }
        Ok(())
    }

    fn detach(&mut self) {
        self.shared.attachment.fetch_add(1, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.rebase(0.0);
        self.attached = false;
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        if !self.attached {
            return Err(PlaybackError::Output("no source attached".to_string()));
        }
        self.ensure_stream()?;
        if let Some(err) = lock(&self.shared.error).clone() {
            return Err(err);
        }
        self.shared.ended.store(false, Ordering::SeqCst);
        self.shared.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.playing.store(false, Ordering::SeqCst);
    }

    fn seek(&mut self, position_secs: f64) {
        if !position_secs.is_finite() {
            return;
        }
        let target = position_secs.max(0.0);
        let duration = *lock(&self.shared.duration_secs);
        self.shared.rebase(target);
        // Seeking to the very end plays out immediately instead of asking the demuxer.
        if duration.is_some_and(|duration| target >= duration - END_SEEK_TOLERANCE_SECS) {
            *lock(&self.shared.seek_request) = None;
            self.shared.decode_done.store(true, Ordering::SeqCst);
            return;
        }
        *lock(&self.shared.seek_request) = Some(target);
        self.shared.decode_done.store(false, Ordering::SeqCst);
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn position_secs(&self) -> f64 {
        self.shared.position_secs()
    }

    fn duration_secs(&self) -> Option<f64> {
        *lock(&self.shared.duration_secs)
    }

    fn has_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    fn take_error(&mut self) -> Option<PlaybackError> {
        lock(&self.shared.error).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with(samples: &[f32], channels: u32, rate: u32) -> SharedPlayback {
        let shared = SharedPlayback::new();
        shared.output_channels.store(channels, Ordering::Relaxed);
        shared.output_rate.store(rate, Ordering::Relaxed);
        lock(&shared.samples).extend(samples.iter().copied());
        shared
    }

    #[test]
    fn test_render_outputs_silence_while_paused() {
        let shared = shared_with(&[0.5; 8], 2, 4);
        let mut out = [1.0f32; 4];
        render_output_buffer(&mut out, &shared);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(lock(&shared.samples).len(), 8);
    }

    #[test]
    fn test_render_applies_volume_and_advances_position() {
        let shared = shared_with(&[0.5, -0.5, 1.0, -1.0], 2, 2);
        shared.playing.store(true, Ordering::Relaxed);
        shared.volume.store(0.5f32.to_bits(), Ordering::Relaxed);
        let mut out = [0.0f32; 4];
        render_output_buffer(&mut out, &shared);
        assert_eq!(out, [0.25, -0.25, 0.5, -0.5]);
        assert_eq!(shared.position_secs(), 1.0);
        assert!(!shared.ended.load(Ordering::Relaxed));
    }

    #[test]
    fn test_render_marks_end_after_decode_done_and_drained() {
        let shared = shared_with(&[0.1, 0.1], 2, 44_100);
        shared.playing.store(true, Ordering::Relaxed);
        shared.decode_done.store(true, Ordering::Relaxed);
        let mut out = [7i16; 6];
        render_output_buffer(&mut out, &shared);
        assert_eq!(&out[2..], &[0, 0, 0, 0]);
        assert!(shared.ended.load(Ordering::Relaxed));
        assert!(!shared.playing.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rebase_resets_clock_and_buffer() {
        let shared = shared_with(&[0.1; 16], 2, 8);
        shared.frames_played.store(8, Ordering::Relaxed);
        shared.rebase(30.0);
        assert_eq!(shared.position_secs(), 30.0);
        assert!(lock(&shared.samples).is_empty());
    }

    #[test]
    fn test_map_channels_mono_to_stereo_and_down() {
        assert_eq!(map_channels(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(
            map_channels(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3, 2),
            vec![0.1, 0.2, 0.4, 0.5]
        );
        assert_eq!(map_channels(&[0.1, 0.2], 2, 2), vec![0.1, 0.2]);
    }

    #[test]
    fn test_resampler_converts_rate_in_chunks() {
        let mut resampler = StreamResampler::new(22_050, 44_100, 1).expect("resampler");
        let mut out = Vec::new();
        resampler
            .push(&vec![0.0; RESAMPLER_CHUNK_FRAMES * 2], &mut out)
            .expect("push");
        let after_full_chunks = out.len();
        assert!(after_full_chunks >= RESAMPLER_CHUNK_FRAMES * 3);
        resampler.push(&[0.0; 10], &mut out).expect("push");
        assert_eq!(out.len(), after_full_chunks);
        resampler.flush(&mut out).expect("flush");
        assert!(out.len() > after_full_chunks);
    }

    #[test]
    fn test_decode_thread_reports_unrecognized_audio() {
        let shared = Arc::new(SharedPlayback::new());
        let (tx, rx) = mpsc::channel();
        let media: Box<dyn MediaSource> = Box::new(Cursor::new(vec![0u8; 64]));
        run_decode_thread(Arc::clone(&shared), 0, media, tx);
        let probe = rx.recv().expect("probe result");
        assert!(matches!(probe, Err(PlaybackError::Decode(_))));
        assert!(shared.decode_done.load(Ordering::SeqCst));
        assert!(lock(&shared.error).is_some());
    }
}
