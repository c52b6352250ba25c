//! Progressive download feeding an [`AppendableSource`].

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::backends::OriginStream;
use crate::config::StreamingConfig;
use crate::error::PlaybackError;
use crate::playback::source_registry::{PlaybackSource, SourceRegistry};
use crate::protocol::StreamProgress;
use crate::streaming::appendable_source::AppendableSource;

/// Worker notifications delivered through the `stream` callback.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Progress(StreamProgress),
    /// Body fully appended. Carries the complete bytes.
    Completed(Vec<u8>),
    Failed(PlaybackError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn compute_progress(bytes_loaded: u64, total_bytes: Option<u64>) -> StreamProgress {
    let progress = match total_bytes {
        Some(total) if total > 0 => (bytes_loaded as f64 / total as f64).clamp(0.0, 1.0) as f32,
        _ => 0.0,
    };
    StreamProgress {
        bytes_loaded,
        total_bytes,
        progress,
    }
}

/// Reads until `segment` holds `segment_bytes` or the body ends.
fn fill_segment(reader: &mut dyn Read, segment_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut segment = vec![0u8; segment_bytes];
    let mut filled = 0;
    while filled < segment_bytes {
        match reader.read(&mut segment[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    segment.truncate(filled);
    Ok(segment)
}

/// One progressive download bound to one transient source URL.
pub struct StreamingTransport {
    registry: SourceRegistry,
    config: StreamingConfig,
    source: AppendableSource,
    url: Option<String>,
    aborted: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<Vec<u8>>>>,
    progress: Arc<Mutex<StreamProgress>>,
    worker: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl StreamingTransport {
    pub fn new(registry: SourceRegistry, config: StreamingConfig) -> Self {
        let source = AppendableSource::with_limit(config.buffer_limit());
        Self {
            registry,
            config,
            source,
            url: None,
            aborted: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            progress: Arc::new(Mutex::new(StreamProgress::default())),
            worker: None,
            destroyed: false,
        }
    }

    /// Registers the source, hands its URL to `attach` and waits until the
    /// consumer starts reading.
    pub fn open<F>(&mut self, attach: F) -> Result<String, PlaybackError>
    where
        F: FnOnce(&str) -> Result<(), PlaybackError>,
    {
        let url = self
            .registry
            .register(PlaybackSource::Stream(self.source.clone()));
        self.url = Some(url.clone());
        attach(&url)?;

        let timeout_ms = u64::from(self.config.open_timeout_ms);
        if !self.source.wait_ready(Duration::from_millis(timeout_ms)) {
            warn!(
                "StreamingTransport: consumer did not open {} within {} ms",
                url, timeout_ms
            );
            return Err(PlaybackError::Timeout(timeout_ms));
        }
        debug!("StreamingTransport: source {} opened", url);
        Ok(url)
    }

    /// Starts the download worker. `fetch` runs on the worker thread.
    pub fn stream<F, E>(&mut self, fetch: F, on_event: E)
    where
        F: FnOnce() -> Result<OriginStream, PlaybackError> + Send + 'static,
        E: Fn(StreamEvent) + Send + 'static,
    {
        if self.worker.is_some() || self.destroyed {
            warn!("StreamingTransport: stream already started or destroyed");
            return;
        }
        let source = self.source.clone();
        let aborted = Arc::clone(&self.aborted);
        let pending = Arc::clone(&self.pending);
        let progress = Arc::clone(&self.progress);
        let segment_bytes = self.config.segment_bytes.max(1) as usize;

        self.worker = Some(thread::spawn(move || {
            let OriginStream {
                mut reader,
                total_bytes,
            } = match fetch() {
                Ok(stream) => stream,
                Err(err) => {
                    if !aborted.load(Ordering::SeqCst) {
                        source.fail(err.to_string());
                        on_event(StreamEvent::Failed(err));
                    }
                    return;
                }
            };
            *lock(&progress) = compute_progress(0, total_bytes);
            let mut bytes_loaded = 0u64;

            loop {
                if aborted.load(Ordering::SeqCst) {
                    debug!("StreamingTransport: worker aborted");
                    return;
                }
                let segment = match fill_segment(reader.as_mut(), segment_bytes) {
                    Ok(segment) => segment,
                    Err(err) => {
                        if !aborted.load(Ordering::SeqCst) {
                            source.fail(err.to_string());
                            on_event(StreamEvent::Failed(PlaybackError::Network(format!(
                                "stream read failed: {err}"
                            ))));
                        }
                        return;
                    }
                };
                let end_of_body = segment.len() < segment_bytes;
                if !segment.is_empty() {
                    lock(&pending).push_back(segment);
                }

                // Single writer: segments go in one at a time, in order.
                loop {
                    if aborted.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(next) = lock(&pending).pop_front() else {
                        break;
                    };
                    if let Err(err) = source.append(&next) {
                        warn!("StreamingTransport: append rejected: {}", err);
                        lock(&pending).clear();
                        on_event(StreamEvent::Failed(err));
                        return;
                    }
                    bytes_loaded += next.len() as u64;
                    let snapshot = compute_progress(bytes_loaded, total_bytes);
                    *lock(&progress) = snapshot;
                    on_event(StreamEvent::Progress(snapshot));
                }

                if end_of_body {
                    source.finish();
                    let snapshot = compute_progress(bytes_loaded, total_bytes.or(Some(bytes_loaded)));
                    *lock(&progress) = snapshot;
                    debug!("StreamingTransport: body complete ({} bytes)", bytes_loaded);
                    on_event(StreamEvent::Completed(source.snapshot()));
                    return;
                }
            }
        }));
    }

    pub fn progress(&self) -> StreamProgress {
        *lock(&self.progress)
    }

    #[cfg(test)]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    #[cfg(test)]
    pub fn source(&self) -> &AppendableSource {
        &self.source
    }

    #[cfg(test)]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Stops the download. Safe to call repeatedly.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            debug!("StreamingTransport: abort requested");
        }
    }

    /// Aborts, drops queued segments, closes the source and revokes its URL
    /// after the grace period.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.abort();
        lock(&self.pending).clear();
        self.source.finish();
        // Not joined: the worker may sit in a blocking read until its timeout.
        self.worker.take();

        let Some(url) = self.url.take() else {
            return;
        };
        let grace = Duration::from_millis(u64::from(self.config.release_grace_ms));
        if grace.is_zero() {
            self.registry.revoke(&url);
            return;
        }
        let registry = self.registry.clone();
        thread::spawn(move || {
            thread::sleep(grace);
            registry.revoke(&url);
        });
    }
}

impl Drop for StreamingTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    fn config() -> StreamingConfig {
        StreamingConfig {
            segment_bytes: 4,
            open_timeout_ms: 500,
            release_grace_ms: 0,
            max_buffer_bytes: 0,
        }
    }

    fn origin_body(body: Vec<u8>) -> Result<OriginStream, PlaybackError> {
        Ok(OriginStream {
            total_bytes: Some(body.len() as u64),
            reader: Box::new(Cursor::new(body)),
        })
    }

    fn open_with_reader(transport: &mut StreamingTransport) -> thread::JoinHandle<Vec<u8>> {
        let (reader_tx, reader_rx) = mpsc::channel();
        let registry = transport.registry.clone();
        transport
            .open(|url| {
                let Some(PlaybackSource::Stream(source)) = registry.resolve(url) else {
                    return Err(PlaybackError::Output("unknown url".to_string()));
                };
                let mut reader = source.reader();
                let handle = thread::spawn(move || {
                    let mut body = Vec::new();
                    let _ = reader.read_to_end(&mut body);
                    body
                });
                let _ = reader_tx.send(handle);
                Ok(())
            })
            .expect("open should succeed");
        reader_rx.recv().expect("reader handle")
    }

    #[test]
    fn test_stream_appends_segments_in_order_and_completes() {
        let registry = SourceRegistry::new();
        let mut transport = StreamingTransport::new(registry.clone(), config());
        let reader = open_with_reader(&mut transport);

        let (event_tx, event_rx) = mpsc::channel();
        transport.stream(
            || origin_body(b"0123456789".to_vec()),
            move |event| {
                let _ = event_tx.send(event);
            },
        );

        let mut progress_events = Vec::new();
        let completed = loop {
            match event_rx.recv_timeout(Duration::from_secs(2)).expect("event") {
                StreamEvent::Progress(progress) => progress_events.push(progress),
                StreamEvent::Completed(bytes) => break bytes,
                StreamEvent::Failed(err) => panic!("unexpected failure: {err}"),
            }
        };
        assert_eq!(completed, b"0123456789");
        let loaded: Vec<u64> = progress_events.iter().map(|p| p.bytes_loaded).collect();
        assert_eq!(loaded, vec![4, 8, 10]);
        assert_eq!(progress_events[2].progress, 1.0);
        assert_eq!(reader.join().expect("reader"), b"0123456789");
        assert_eq!(transport.progress().bytes_loaded, 10);
    }

    #[test]
    fn test_open_times_out_when_consumer_never_reads() {
        let registry = SourceRegistry::new();
        let mut transport = StreamingTransport::new(
            registry,
            StreamingConfig {
                open_timeout_ms: 30,
                ..config()
            },
        );
        let err = transport.open(|_| Ok(())).expect_err("should time out");
        assert_eq!(err, PlaybackError::Timeout(30));
    }

    #[test]
    fn test_append_rejection_is_reported_as_decode_failure() {
        let registry = SourceRegistry::new();
        let mut transport = StreamingTransport::new(
            registry,
            StreamingConfig {
                max_buffer_bytes: 6,
                ..config()
            },
        );
        let _reader = open_with_reader(&mut transport);

        let (event_tx, event_rx) = mpsc::channel();
        transport.stream(
            || origin_body(vec![7u8; 12]),
            move |event| {
                let _ = event_tx.send(event);
            },
        );
        let failure = loop {
            if let StreamEvent::Failed(err) =
                event_rx.recv_timeout(Duration::from_secs(2)).expect("event")
            {
                break err;
            }
        };
        assert!(failure.is_decode());
        transport.destroy();
    }

    #[test]
    fn test_abort_is_idempotent_and_destroy_revokes_url() {
        let registry = SourceRegistry::new();
        let mut transport = StreamingTransport::new(registry.clone(), config());
        let _reader = open_with_reader(&mut transport);
        let url = transport.url().expect("url").to_string();
        assert!(registry.is_live(&url));

        transport.abort();
        transport.abort();
        assert!(transport.is_aborted());

        transport.destroy();
        transport.destroy();
        assert!(!registry.is_live(&url));
        assert!(transport.source().is_finished());
    }

    #[test]
    fn test_destroy_waits_grace_period_before_revoking() {
        let registry = SourceRegistry::new();
        let mut transport = StreamingTransport::new(
            registry.clone(),
            StreamingConfig {
                release_grace_ms: 50,
                ..config()
            },
        );
        let _reader = open_with_reader(&mut transport);
        let url = transport.url().expect("url").to_string();
        transport.destroy();
        assert!(registry.is_live(&url));
        thread::sleep(Duration::from_millis(300));
        assert!(!registry.is_live(&url));
    }
}
