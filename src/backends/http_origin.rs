//! HTTP audio origin backed by `ureq`.

use std::io::Read;
use std::time::Duration;

use log::debug;

use crate::backends::{AudioOrigin, OriginStream};
use crate::config::OriginConfig;
use crate::error::PlaybackError;
use crate::protocol::AudioQuality;

/// Upper bound on the buffer reserved up front from a `Content-Length` header.
const MAX_PREALLOCATED_BODY: usize = 16 << 20;

/// Fetches `GET {base_url}/{track_id}?quality={quality}`.
pub struct HttpAudioOrigin {
    http_client: ureq::Agent,
    base_url: String,
}

impl HttpAudioOrigin {
    pub fn new(config: &OriginConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(u64::from(config.connect_timeout_ms)))
            .timeout_read(Duration::from_millis(u64::from(config.read_timeout_ms)))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self {
            http_client,
            base_url: Self::endpoint_base(&config.base_url),
        }
    }

    fn endpoint_base(endpoint: &str) -> String {
        endpoint.trim().trim_end_matches('/').to_string()
    }

    fn track_url(&self, track_id: &str, quality: AudioQuality) -> String {
        format!(
            "{}/{}?quality={}",
            self.base_url,
            urlencoding::encode(track_id),
            quality.as_query_value()
        )
    }

    fn request(&self, track_id: &str, quality: AudioQuality) -> Result<ureq::Response, PlaybackError> {
        let url = self.track_url(track_id, quality);
        debug!("HttpAudioOrigin: GET {}", url);
        self.http_client.get(&url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                PlaybackError::Network(format!("origin returned HTTP {code} for {track_id}"))
            }
            ureq::Error::Transport(transport) => {
                PlaybackError::Network(format!("origin request failed for {track_id}: {transport}"))
            }
        })
    }

    fn content_length(response: &ureq::Response) -> Option<u64> {
        response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    /// Initial body capacity. The header is server-controlled, so it only
    /// ever serves as a bounded hint.
    fn capacity_hint(content_length: Option<u64>) -> usize {
        content_length
            .map(|length| usize::try_from(length).unwrap_or(usize::MAX))
            .unwrap_or(0)
            .min(MAX_PREALLOCATED_BODY)
    }
}

impl AudioOrigin for HttpAudioOrigin {
    fn fetch(&self, track_id: &str, quality: AudioQuality) -> Result<Vec<u8>, PlaybackError> {
        let response = self.request(track_id, quality)?;
        let mut body = Vec::with_capacity(Self::capacity_hint(Self::content_length(&response)));
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|err| PlaybackError::Network(format!("origin body read failed: {err}")))?;
        Ok(body)
    }

    fn open_stream(
        &self,
        track_id: &str,
        quality: AudioQuality,
    ) -> Result<OriginStream, PlaybackError> {
        let response = self.request(track_id, quality)?;
        let total_bytes = Self::content_length(&response);
        Ok(OriginStream {
            reader: Box::new(response.into_reader()),
            total_bytes,
        })
    }
}
