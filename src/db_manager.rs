use crate::config::CacheConfig;
use crate::track::{Playlist, Track};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Limits applied by [`DbManager::evict_blobs`]. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionPolicy {
    pub max_age: Option<Duration>,
    pub max_total_bytes: Option<u64>,
}

impl From<&CacheConfig> for EvictionPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_total_bytes: config.max_total_bytes(),
        }
    }
}

pub struct DbManager {
    conn: Connection,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

fn track_from_json(json: &str) -> Option<Track> {
    match serde_json::from_str::<Track>(json) {
        Ok(track) => Some(track),
        Err(err) => {
            warn!("DbManager: skipping unreadable stored track: {}", err);
            None
        }
    }
}

fn to_sql_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}

impl DbManager {
    /// Default database location under the user's data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("cadence").join("cadence.db"))
    }

    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(data_dir) = db_path.parent() {
            if !data_dir.exists() {
                std::fs::create_dir_all(data_dir)
                    .map_err(|_| rusqlite::Error::InvalidPath(data_dir.to_path_buf()))?;
            }
        }
        let conn = Connection::open(db_path)?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let db_manager = Self {
            conn: Connection::open_in_memory()?,
        };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playlists (
                name TEXT PRIMARY KEY,
                tracks_json TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS queue_snapshot (
                position INTEGER PRIMARY KEY,
                track_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recently_played (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id TEXT NOT NULL,
                track_json TEXT NOT NULL,
                played_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recently_played_track
                ON recently_played(track_id);
            CREATE TABLE IF NOT EXISTS listen_counts (
                track_id TEXT PRIMARY KEY,
                count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audio_blobs (
                track_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn put_blob(&self, track_id: &str, bytes: &[u8]) -> Result<(), rusqlite::Error> {
        self.put_blob_at(track_id, bytes, now_millis())
    }

    fn put_blob_at(
        &self,
        track_id: &str,
        bytes: &[u8],
        stored_at_ms: i64,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO audio_blobs (track_id, data, stored_at, size_bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![track_id, bytes, stored_at_ms, bytes.len() as i64],
        )?;
        Ok(())
    }

    pub fn get_blob(&self, track_id: &str) -> Result<Option<Vec<u8>>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT data FROM audio_blobs WHERE track_id = ?1",
                params![track_id],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn cached_blob_bytes(&self) -> Result<u64, rusqlite::Error> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM audio_blobs",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// Drops expired blobs, then the oldest ones until the cache fits the size
    /// limit. `keep_id` survives both passes. Returns the number of deleted blobs.
    pub fn evict_blobs(
        &self,
        policy: &EvictionPolicy,
        keep_id: Option<&str>,
    ) -> Result<usize, rusqlite::Error> {
        self.evict_blobs_at(policy, keep_id, now_millis())
    }

    fn evict_blobs_at(
        &self,
        policy: &EvictionPolicy,
        keep_id: Option<&str>,
        now_ms: i64,
    ) -> Result<usize, rusqlite::Error> {
        let keep_id = keep_id.unwrap_or("");
        let mut deleted = 0;

        if let Some(max_age) = policy.max_age {
            let cutoff = now_ms - max_age.as_millis() as i64;
            deleted += self.conn.execute(
                "DELETE FROM audio_blobs WHERE stored_at < ?1 AND track_id != ?2",
                params![cutoff, keep_id],
            )?;
        }

        if let Some(max_total_bytes) = policy.max_total_bytes {
            let mut total = self.cached_blob_bytes()?;
            if total > max_total_bytes {
                let mut stmt = self.conn.prepare(
                    "SELECT track_id, size_bytes FROM audio_blobs
                     WHERE track_id != ?1 ORDER BY stored_at ASC",
                )?;
                let candidates = stmt
                    .query_map(params![keep_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (track_id, size_bytes) in candidates {
                    if total <= max_total_bytes {
                        break;
                    }
                    self.conn.execute(
                        "DELETE FROM audio_blobs WHERE track_id = ?1",
                        params![track_id],
                    )?;
                    total = total.saturating_sub(size_bytes.max(0) as u64);
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            debug!("DbManager: evicted {} cached audio blob(s)", deleted);
        }
        Ok(deleted)
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn put_playlist(&self, playlist: &Playlist) -> Result<(), rusqlite::Error> {
        let tracks_json = serde_json::to_string(&playlist.tracks).map_err(to_sql_error)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO playlists (name, tracks_json, pinned, downloaded)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                playlist.name,
                tracks_json,
                playlist.pinned,
                playlist.downloaded
            ],
        )?;
        Ok(())
    }

    /// Pinned playlists first, then by name.
    pub fn get_all_playlists(&self) -> Result<Vec<Playlist>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, tracks_json, pinned, downloaded FROM playlists
             ORDER BY pinned DESC, name ASC",
        )?;
        let playlist_iter = stmt.query_map([], |row| {
            let tracks_json: String = row.get(1)?;
            Ok(Playlist {
                name: row.get(0)?,
                tracks: serde_json::from_str(&tracks_json).unwrap_or_else(|err| {
                    warn!("DbManager: playlist tracks unreadable: {}", err);
                    Vec::new()
                }),
                pinned: row.get(2)?,
                downloaded: row.get(3)?,
            })
        })?;

        let mut playlists = Vec::new();
        for playlist in playlist_iter {
            playlists.push(playlist?);
        }
        Ok(playlists)
    }

    /// Deletes by name and returns the playlists that remain.
    pub fn delete_playlist(&self, name: &str) -> Result<Vec<Playlist>, rusqlite::Error> {
        self.conn
            .execute("DELETE FROM playlists WHERE name = ?1", params![name])?;
        self.get_all_playlists()
    }

    /// Playlists are keyed by name, so renaming recreates the row.
    /// Returns `false` when `old_name` does not exist.
    pub fn rename_playlist(&self, old_name: &str, new_name: &str) -> Result<bool, rusqlite::Error> {
        let Some(mut playlist) = self
            .get_all_playlists()?
            .into_iter()
            .find(|playlist| playlist.name == old_name)
        else {
            return Ok(false);
        };
        self.conn
            .execute("DELETE FROM playlists WHERE name = ?1", params![old_name])?;
        playlist.name = new_name.to_string();
        self.put_playlist(&playlist)?;
        Ok(true)
    }

    /// Rewrites the whole snapshot inside one transaction.
    pub fn put_queue_snapshot(&self, tracks: &[Track]) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM queue_snapshot", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO queue_snapshot (position, track_json) VALUES (?1, ?2)")?;
            for (position, track) in tracks.iter().enumerate() {
                let track_json = serde_json::to_string(track).map_err(to_sql_error)?;
                stmt.execute(params![position as i64, track_json])?;
            }
        }
        tx.commit()
    }

    pub fn get_queue_snapshot(&self) -> Result<Vec<Track>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT track_json FROM queue_snapshot ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tracks = Vec::new();
        for json in rows {
            if let Some(track) = track_from_json(&json?) {
                tracks.push(track);
            }
        }
        Ok(tracks)
    }

    pub fn clear_queue_snapshot(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute("DELETE FROM queue_snapshot", [])?;
        Ok(())
    }

    pub fn append_recently_played(&self, track: &Track) -> Result<(), rusqlite::Error> {
        let track_json = serde_json::to_string(track).map_err(to_sql_error)?;
        self.conn.execute(
            "INSERT INTO recently_played (track_id, track_json, played_at) VALUES (?1, ?2, ?3)",
            params![track.id, track_json, now_millis()],
        )?;
        Ok(())
    }

    /// Most recent first, one entry per track id.
    pub fn get_recently_played(&self, limit: usize) -> Result<Vec<Track>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT r.track_json FROM recently_played r
             WHERE r.seq = (
                SELECT MAX(seq) FROM recently_played WHERE track_id = r.track_id
             )
             ORDER BY r.seq DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut tracks = Vec::new();
        for json in rows {
            if let Some(track) = track_from_json(&json?) {
                tracks.push(track);
            }
        }
        Ok(tracks)
    }

    pub fn put_listen_count(&self, track_id: &str, count: u64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO listen_counts (track_id, count) VALUES (?1, ?2)",
            params![track_id, count as i64],
        )?;
        Ok(())
    }

    pub fn get_all_listen_counts(&self) -> Result<HashMap<String, u64>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT track_id, count FROM listen_counts")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (track_id, count) = row?;
            counts.insert(track_id, count.max(0) as u64);
        }
        Ok(counts)
    }
}
