//! Track and playlist value types plus catalog sanitizing.
//!
//! Catalog payloads are untrusted: every track entering the engine goes
//! through [`sanitize_track`], which substitutes fallbacks for anything
//! missing so downstream code always has renderable data.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
/// Artwork placeholder used when the catalog offers no cover at all.
pub const PLACEHOLDER_COVER: &str = "";

/// Track artist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
}

/// Album with four artwork sizes, smallest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub title: String,
    pub cover_small: String,
    pub cover_medium: String,
    pub cover_big: String,
    pub cover_xl: String,
}

impl Album {
    /// Largest non-empty artwork URL.
    pub fn largest_cover(&self) -> Option<&str> {
        [
            &self.cover_xl,
            &self.cover_big,
            &self.cover_medium,
            &self.cover_small,
        ]
        .into_iter()
        .map(String::as_str)
        .find(|url| !url.is_empty())
    }
}

/// Immutable track value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: Artist,
    pub album: Album,
}

impl Track {
    /// Sanitizes one catalog JSON object into a track.
    pub fn from_catalog_json(value: &Value) -> Track {
        let sanitized = sanitize_track(value);
        if !sanitized.is_complete() {
            debug!(
                "Track: sanitized catalog entry {} with fallbacks {:?}",
                sanitized.track.id, sanitized.fallbacks
            );
        }
        sanitized.track
    }

    /// Sanitizes a JSON array of catalog objects, skipping non-array input.
    pub fn list_from_catalog_json(value: &Value) -> Vec<Track> {
        match value {
            Value::Array(items) => items.iter().map(Track::from_catalog_json).collect(),
            Value::Object(_) => vec![Track::from_catalog_json(value)],
            _ => Vec::new(),
        }
    }
}

/// Catalog fields that had to be synthesized during sanitizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFallback {
    Id,
    Title,
    Artist,
    Album,
    Cover,
}

/// Sanitized track plus the list of synthesized fields.
#[derive(Debug, Clone)]
pub struct SanitizedTrack {
    pub track: Track,
    pub fallbacks: Vec<TrackFallback>,
}

impl SanitizedTrack {
    pub fn is_complete(&self) -> bool {
        self.fallbacks.is_empty()
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Converts an untrusted catalog object into a [`Track`], never failing.
pub fn sanitize_track(value: &Value) -> SanitizedTrack {
    let mut fallbacks = Vec::new();

    let id = non_empty_string(value.get("id")).unwrap_or_else(|| {
        fallbacks.push(TrackFallback::Id);
        format!("unknown-{}", Uuid::new_v4())
    });
    let title = non_empty_string(value.get("title")).unwrap_or_else(|| {
        fallbacks.push(TrackFallback::Title);
        UNKNOWN_TITLE.to_string()
    });
    // Some catalog endpoints flatten the artist to a plain string.
    let artist_name = non_empty_string(value.get("artist").and_then(|artist| artist.get("name")))
        .or_else(|| non_empty_string(value.get("artist")))
        .unwrap_or_else(|| {
            fallbacks.push(TrackFallback::Artist);
            UNKNOWN_ARTIST.to_string()
        });

    let album_value = value.get("album");
    let album_title = non_empty_string(album_value.and_then(|album| album.get("title")))
        .unwrap_or_else(|| {
            fallbacks.push(TrackFallback::Album);
            UNKNOWN_ALBUM.to_string()
        });
    let covers: [Option<String>; 4] = ["cover_small", "cover_medium", "cover_big", "cover_xl"]
        .map(|key| non_empty_string(album_value.and_then(|album| album.get(key))));
    if covers.iter().any(Option::is_none) {
        fallbacks.push(TrackFallback::Cover);
    }
    let [cover_small, cover_medium, cover_big, cover_xl] = fill_cover_sizes(covers);

    SanitizedTrack {
        track: Track {
            id,
            title,
            artist: Artist { name: artist_name },
            album: Album {
                title: album_title,
                cover_small,
                cover_medium,
                cover_big,
                cover_xl,
            },
        },
        fallbacks,
    }
}

/// Fills each missing size with the nearest available one, preferring larger.
fn fill_cover_sizes(covers: [Option<String>; 4]) -> [String; 4] {
    let mut filled: [String; 4] = Default::default();
    for (index, slot) in filled.iter_mut().enumerate() {
        if let Some(url) = covers[index].as_ref() {
            *slot = url.clone();
            continue;
        }
        let nearest = (1..covers.len()).find_map(|distance| {
            let larger = covers.get(index + distance).and_then(Option::as_ref);
            let smaller = index
                .checked_sub(distance)
                .and_then(|lower| covers[lower].as_ref());
            larger.or(smaller)
        });
        *slot = nearest
            .cloned()
            .unwrap_or_else(|| PLACEHOLDER_COVER.to_string());
    }
    filled
}

/// Named, ordered track collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub downloaded: bool,
}

impl Playlist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tracks: Vec::new(),
            pinned: false,
            downloaded: false,
        }
    }
}
