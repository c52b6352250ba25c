//! Audio origin abstractions and concrete implementations.

use std::io::Read;

use crate::error::PlaybackError;
use crate::protocol::AudioQuality;

pub mod http_origin;

/// Open response body from the origin, read incrementally by the caller.
pub struct OriginStream {
    pub reader: Box<dyn Read + Send>,
    /// Announced body length, when the origin sends one.
    pub total_bytes: Option<u64>,
}

/// Interface implemented by the places encoded track audio is fetched from.
pub trait AudioOrigin: Send + Sync {
    /// Downloads the complete encoded body of a track.
    fn fetch(&self, track_id: &str, quality: AudioQuality) -> Result<Vec<u8>, PlaybackError>;

    /// Opens the body for chunked reading.
    fn open_stream(
        &self,
        track_id: &str,
        quality: AudioQuality,
    ) -> Result<OriginStream, PlaybackError>;
}

#[cfg(test)]
pub mod test_support {
    //! In-memory origin used by resolution and streaming tests.

    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::{AudioOrigin, OriginStream};
    use crate::error::PlaybackError;
    use crate::protocol::AudioQuality;

    #[derive(Default)]
    pub struct MemoryOrigin {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        pub fetch_calls: AtomicUsize,
        pub stream_calls: AtomicUsize,
    }

    impl MemoryOrigin {
        pub fn with_body(self, track_id: &str, body: Vec<u8>) -> Self {
            if let Ok(mut bodies) = self.bodies.lock() {
                bodies.insert(track_id.to_string(), body);
            }
            self
        }

        fn body(&self, track_id: &str) -> Result<Vec<u8>, PlaybackError> {
            self.bodies
                .lock()
                .ok()
                .and_then(|bodies| bodies.get(track_id).cloned())
                .ok_or_else(|| PlaybackError::Network(format!("404 for {track_id}")))
        }

        pub fn fetches(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    impl AudioOrigin for MemoryOrigin {
        fn fetch(&self, track_id: &str, _quality: AudioQuality) -> Result<Vec<u8>, PlaybackError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.body(track_id)
        }

        fn open_stream(
            &self,
            track_id: &str,
            _quality: AudioQuality,
        ) -> Result<OriginStream, PlaybackError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            let body = self.body(track_id)?;
            Ok(OriginStream {
                total_bytes: Some(body.len() as u64),
                reader: Box::new(Cursor::new(body)),
            })
        }
    }
}
