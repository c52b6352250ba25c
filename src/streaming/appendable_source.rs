//! Growing in-memory audio body shared between one writer and its readers.
//!
//! The streaming transport appends segments while the decoder reads through
//! an [`AppendableReader`]. Reads past the written end block until more data
//! arrives or the source is finished.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use symphonia::core::io::MediaSource;

use crate::error::PlaybackError;

#[derive(Debug, Default)]
struct SourceBuffer {
    data: Vec<u8>,
    finished: bool,
    failure: Option<String>,
    /// Set on the first read attempt by a consumer.
    ready: bool,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<SourceBuffer>,
    changed: Condvar,
    max_bytes: Option<usize>,
}

/// Cloneable handle to one appendable body.
#[derive(Debug, Clone)]
pub struct AppendableSource {
    shared: Arc<Shared>,
}

impl Default for AppendableSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendableSource {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Appends that would grow the body past `max_bytes` are rejected.
    pub fn with_limit(max_bytes: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(SourceBuffer::default()),
                changed: Condvar::new(),
                max_bytes,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceBuffer> {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, segment: &[u8]) -> Result<(), PlaybackError> {
        let mut buffer = self.lock();
        if buffer.finished || buffer.failure.is_some() {
            return Err(PlaybackError::Decode(
                "append rejected: source already closed".to_string(),
            ));
        }
        if let Some(max_bytes) = self.shared.max_bytes {
            if buffer.data.len() + segment.len() > max_bytes {
                return Err(PlaybackError::Decode(format!(
                    "append rejected: buffer limit of {max_bytes} bytes reached"
                )));
            }
        }
        buffer.data.extend_from_slice(segment);
        drop(buffer);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Marks end of stream. Blocked readers drain the rest and then see EOF.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.shared.changed.notify_all();
    }

    /// Fails pending and future reads.
    pub fn fail(&self, message: impl Into<String>) {
        self.lock().failure = Some(message.into());
        self.shared.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Waits until a consumer starts reading. Returns `false` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.lock();
        while !buffer.ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            buffer = match self.shared.changed.wait_timeout(buffer, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Copy of everything appended so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn reader(&self) -> AppendableReader {
        AppendableReader {
            source: self.clone(),
            position: 0,
        }
    }
}

/// Independent read cursor over an [`AppendableSource`].
#[derive(Debug)]
pub struct AppendableReader {
    source: AppendableSource,
    position: u64,
}

impl Read for AppendableReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let shared = &self.source.shared;
        let mut buffer = self.source.lock();
        if !buffer.ready {
            buffer.ready = true;
            shared.changed.notify_all();
        }
        loop {
            let available = (buffer.data.len() as u64).saturating_sub(self.position) as usize;
            if available > 0 {
                let start = self.position as usize;
                let count = available.min(out.len());
                out[..count].copy_from_slice(&buffer.data[start..start + count]);
                self.position += count as u64;
                return Ok(count);
            }
            if let Some(failure) = buffer.failure.as_ref() {
                return Err(io::Error::new(io::ErrorKind::Other, failure.clone()));
            }
            if buffer.finished {
                return Ok(0);
            }
            buffer = shared
                .changed
                .wait(buffer)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Seek for AppendableReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let buffer = self.source.lock();
                if !buffer.finished {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "stream length unknown until finished",
                    ));
                }
                (buffer.data.len() as u64).checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl MediaSource for AppendableReader {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        let buffer = self.source.lock();
        buffer.finished.then_some(buffer.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_blocks_until_append_then_sees_eof_after_finish() {
        let source = AppendableSource::new();
        let mut reader = source.reader();
        let handle = thread::spawn(move || {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).map(|_| body)
        });

        assert!(source.wait_ready(Duration::from_secs(2)));
        source.append(b"abc").expect("append");
        source.append(b"def").expect("append");
        source.finish();

        let body = handle.join().expect("reader thread").expect("read");
        assert_eq!(body, b"abcdef");
    }

    #[test]
    fn test_wait_ready_times_out_without_consumer() {
        let source = AppendableSource::new();
        assert!(!source.wait_ready(Duration::from_millis(20)));
        assert!(!source.is_ready());
    }

    #[test]
    fn test_append_after_finish_or_over_limit_is_rejected() {
        let limited = AppendableSource::with_limit(Some(4));
        limited.append(b"1234").expect("fits");
        assert!(limited.append(b"5").expect_err("over limit").is_decode());

        let closed = AppendableSource::new();
        closed.finish();
        assert!(closed.append(b"x").is_err());
    }

    #[test]
    fn test_failed_source_errors_readers() {
        let source = AppendableSource::new();
        source.fail("origin dropped");
        let mut reader = source.reader();
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_seek_end_requires_finished_source() {
        let source = AppendableSource::new();
        source.append(b"0123456789").expect("append");
        let mut reader = source.reader();
        assert!(reader.seek(SeekFrom::End(0)).is_err());
        assert_eq!(reader.byte_len(), None);

        source.finish();
        assert_eq!(reader.seek(SeekFrom::End(-2)).expect("seek"), 8);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).expect("read");
        assert_eq!(tail, b"89");
        assert_eq!(reader.byte_len(), Some(10));
    }
}
