//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

/// Root configuration persisted to `cadence.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Audio origin endpoint.
    pub origin: OriginConfig,
    #[serde(default)]
    /// Resolution and playback policy.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Blob cache eviction limits.
    pub cache: CacheConfig,
    #[serde(default)]
    /// Progressive download tuning.
    pub streaming: StreamingConfig,
    #[serde(default)]
    /// OS media controls integration.
    pub media_controls: MediaControlsConfig,
}

/// Audio origin endpoint and HTTP timeouts.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct OriginConfig {
    #[serde(default = "default_origin_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u32,
}

/// Resolution policy knobs.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Use the progressive streaming path on cache misses.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    /// Refetch the remembered track after the app returns from the background.
    #[serde(default = "default_true")]
    pub refresh_after_background: bool,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u32,
}

/// Blob cache eviction limits. Zero disables a limit.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "default_cache_max_size_mb")]
    pub max_size_mb: u32,
}

/// Progressive download tuning.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u32,
    #[serde(default = "default_release_grace_ms")]
    pub release_grace_ms: u32,
    /// Largest body a progressive stream may buffer. 0 means unbounded.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
}

/// OS media controls preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MediaControlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_seek_offset_secs")]
    pub seek_offset_secs: u32,
    #[serde(default = "default_position_publish_interval_ms")]
    pub position_publish_interval_ms: u32,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: default_origin_base_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            streaming_enabled: true,
            refresh_after_background: true,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_cache_max_age_days(),
            max_size_mb: default_cache_max_size_mb(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            segment_bytes: default_segment_bytes(),
            open_timeout_ms: default_open_timeout_ms(),
            release_grace_ms: default_release_grace_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

impl Default for MediaControlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seek_offset_secs: default_seek_offset_secs(),
            position_publish_interval_ms: default_position_publish_interval_ms(),
        }
    }
}

impl StreamingConfig {
    pub fn buffer_limit(&self) -> Option<usize> {
        (self.max_buffer_bytes > 0)
            .then(|| usize::try_from(self.max_buffer_bytes).unwrap_or(usize::MAX))
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_days > 0)
            .then(|| Duration::from_secs(u64::from(self.max_age_days) * 24 * 60 * 60))
    }

    pub fn max_total_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| u64::from(self.max_size_mb) * 1024 * 1024)
    }
}

fn default_true() -> bool {
    true
}

fn default_origin_base_url() -> String {
    "http://127.0.0.1:8080/audio".to_string()
}

fn default_connect_timeout_ms() -> u32 {
    5_000
}

fn default_read_timeout_ms() -> u32 {
    15_000
}

fn default_progress_interval_ms() -> u32 {
    250
}

fn default_cache_max_age_days() -> u32 {
    60
}

fn default_cache_max_size_mb() -> u32 {
    1_024
}

fn default_segment_bytes() -> u32 {
    64 * 1024
}

fn default_open_timeout_ms() -> u32 {
    3_000
}

fn default_release_grace_ms() -> u32 {
    1_000
}

fn default_max_buffer_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_seek_offset_secs() -> u32 {
    10
}

fn default_position_publish_interval_ms() -> u32 {
    250
}

/// Clamps user-edited values into workable ranges.
pub fn sanitize_config(config: Config) -> Config {
    let base_url = config.origin.base_url.trim().trim_end_matches('/').to_string();
    Config {
        origin: OriginConfig {
            base_url: if base_url.is_empty() {
                default_origin_base_url()
            } else {
                base_url
            },
            connect_timeout_ms: config.origin.connect_timeout_ms.clamp(500, 60_000),
            read_timeout_ms: config.origin.read_timeout_ms.clamp(1_000, 300_000),
        },
        playback: PlaybackConfig {
            progress_interval_ms: config.playback.progress_interval_ms.clamp(50, 2_000),
            ..config.playback
        },
        cache: config.cache,
        streaming: StreamingConfig {
            segment_bytes: config.streaming.segment_bytes.clamp(4 * 1024, 4 * 1024 * 1024),
            open_timeout_ms: config.streaming.open_timeout_ms.clamp(250, 30_000),
            release_grace_ms: config.streaming.release_grace_ms.min(30_000),
            max_buffer_bytes: config.streaming.max_buffer_bytes,
        },
        media_controls: MediaControlsConfig {
            seek_offset_secs: config.media_controls.seek_offset_secs.clamp(1, 120),
            position_publish_interval_ms: config
                .media_controls
                .position_publish_interval_ms
                .clamp(50, 5_000),
            ..config.media_controls
        },
    }
}

/// Default location of `cadence.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cadence").join("cadence.toml"))
}

/// Loads the config file, creating it with defaults when missing.
///
/// Unreadable or malformed files fall back to defaults with a warning.
pub fn load_or_create(config_file: &Path) -> Config {
    if !config_file.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        if let Some(parent) = config_file.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("Failed to create config directory {}: {}", parent.display(), err);
            }
        }
        match toml::to_string(&Config::default()) {
            Ok(serialized) => {
                if let Err(err) = std::fs::write(config_file, serialized) {
                    warn!("Failed to write default config: {}", err);
                }
            }
            Err(err) => warn!("Failed to serialize default config: {}", err),
        }
        return Config::default();
    }

    let parsed = std::fs::read_to_string(config_file)
        .map_err(|err| err.to_string())
        .and_then(|content| toml::from_str::<Config>(&content).map_err(|err| err.to_string()));
    match parsed {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!(
                "Failed to load config {}: {}. Using defaults",
                config_file.display(),
                err
            );
            Config::default()
        }
    }
}
