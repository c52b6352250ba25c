//! Typed access to the scalar settings kept in the store.

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::db_manager::DbManager;
use crate::protocol::{AudioQuality, RepeatMode};
use crate::track::Track;

/// Keys of the `settings` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Volume,
    RepeatMode,
    AudioQuality,
    ShuffleOn,
    PreviousTracks,
    CurrentTrack,
    RecommendedTracks,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::Volume => "volume",
            SettingKey::RepeatMode => "repeatMode",
            SettingKey::AudioQuality => "audioQuality",
            SettingKey::ShuffleOn => "shuffleOn",
            SettingKey::PreviousTracks => "previousTracks",
            SettingKey::CurrentTrack => "currentTrack",
            SettingKey::RecommendedTracks => "recommendedTracks",
        }
    }
}

/// Reads a JSON-encoded setting. Missing or unreadable values yield `None`.
pub fn load_json<T: DeserializeOwned>(db: &DbManager, key: SettingKey) -> Option<T> {
    let raw = match db.get_setting(key.as_str()) {
        Ok(raw) => raw?,
        Err(err) => {
            warn!("Settings: failed to read {}: {}", key.as_str(), err);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Settings: ignoring malformed {}: {}", key.as_str(), err);
            None
        }
    }
}

/// Writes a JSON-encoded setting, logging failures.
pub fn store_json<T: Serialize>(db: &DbManager, key: SettingKey, value: &T) {
    let encoded = match serde_json::to_string(value) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!("Settings: failed to encode {}: {}", key.as_str(), err);
            return;
        }
    };
    if let Err(err) = db.put_setting(key.as_str(), &encoded) {
        warn!("Settings: failed to persist {}: {}", key.as_str(), err);
    }
}

pub fn load_volume(db: &DbManager) -> Option<f32> {
    load_json::<f32>(db, SettingKey::Volume)
        .filter(|volume| volume.is_finite())
        .map(|volume| volume.clamp(0.0, 1.0))
}

pub fn load_repeat_mode(db: &DbManager) -> RepeatMode {
    load_json(db, SettingKey::RepeatMode).unwrap_or_default()
}

pub fn load_audio_quality(db: &DbManager) -> AudioQuality {
    load_json(db, SettingKey::AudioQuality).unwrap_or_default()
}

pub fn load_shuffle(db: &DbManager) -> bool {
    load_json(db, SettingKey::ShuffleOn).unwrap_or(false)
}

pub fn load_tracks(db: &DbManager, key: SettingKey) -> Vec<Track> {
    load_json(db, key).unwrap_or_default()
}

pub fn load_current_track(db: &DbManager) -> Option<Track> {
    load_json::<Option<Track>>(db, SettingKey::CurrentTrack).flatten()
}
