mod app_bootstrap {
    pub mod services;
}
mod backends;
mod config;
mod db_manager;
mod error;
mod media_controls_manager;
mod playback;
mod protocol;
mod queue;
mod queue_manager;
mod settings;
mod streaming;
mod track;

use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::app_bootstrap::services::{spawn_background_services, BackgroundServicesConfig};
use crate::config::{config_file_path, load_or_create, Config};
use crate::db_manager::DbManager;
use crate::protocol::{AudioQuality, Message, PlaybackMessage, QueueMessage, QueueSnapshot, RepeatMode};
use crate::track::Track;

const HELP_TEXT: &str = "commands: play | pause | next | prev | seek <secs> | volume <0..1> | \
     playlist <json> [index] | add <json> | remove <index> | click <index> | queue | \
     repeat off|all|one | shuffle on|off | quality low|standard|high|lossless | \
     recommend <json> | hide | show | clear | quit";

#[derive(Debug, Clone)]
enum DriverCommand {
    Send(Message),
    ShowQueue,
    Help,
    Quit,
}

/// Parses a snake_case keyword into one of the serde-tagged protocol enums.
fn keyword<T: DeserializeOwned>(name: &str, argument: Option<&str>) -> Result<T, String> {
    let word = argument.ok_or_else(|| format!("{name} needs a value"))?;
    serde_json::from_value(serde_json::Value::String(word.to_lowercase()))
        .map_err(|_| format!("{name}: unknown value '{word}'"))
}

fn switch(name: &str, argument: Option<&str>) -> Result<bool, String> {
    match argument {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err(format!("{name} needs on or off")),
    }
}

fn tracks_from(name: &str, argument: Option<&str>) -> Result<Vec<Track>, String> {
    let path = argument.ok_or_else(|| format!("{name} needs a JSON file"))?;
    let tracks = load_seed_tracks(Path::new(path)).map_err(|err| format!("{name}: {err}"))?;
    if tracks.is_empty() {
        return Err(format!("{name}: {path} contains no tracks"));
    }
    Ok(tracks)
}

/// Maps one driver line onto a bus message. `snapshot` is the latest queue
/// state, used to resolve `click <index>` to a track.
fn parse_command(line: &str, snapshot: &QueueSnapshot) -> Result<DriverCommand, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err("empty command".to_string());
    };
    let argument = words.next();
    let number = |name: &str| -> Result<f64, String> {
        argument
            .ok_or_else(|| format!("{name} needs a value"))?
            .parse::<f64>()
            .map_err(|err| format!("{name}: {err}"))
    };
    let index = |name: &str, value: Option<&str>| -> Result<usize, String> {
        value
            .ok_or_else(|| format!("{name} needs an index"))?
            .parse::<usize>()
            .map_err(|err| format!("{name}: {err}"))
    };
    let playback = |message: PlaybackMessage| -> Result<DriverCommand, String> {
        Ok(DriverCommand::Send(Message::Playback(message)))
    };
    let queue = |message: QueueMessage| -> Result<DriverCommand, String> {
        Ok(DriverCommand::Send(Message::Queue(message)))
    };
    match command {
        "play" | "resume" => playback(PlaybackMessage::Resume),
        "pause" => playback(PlaybackMessage::Pause),
        "next" | "skip" => queue(QueueMessage::Skip),
        "prev" | "previous" => queue(QueueMessage::Previous),
        "seek" => playback(PlaybackMessage::Seek(number("seek")?)),
        "volume" => playback(PlaybackMessage::SetVolume(number("volume")? as f32)),
        "playlist" => {
            let tracks = tracks_from("playlist", argument)?;
            let start = match words.next() {
                Some(value) => index("playlist", Some(value))?,
                None => 0,
            };
            let track = tracks
                .get(start)
                .cloned()
                .ok_or_else(|| format!("playlist: no track at index {start}"))?;
            queue(QueueMessage::PlayTrack {
                track,
                autoplay: true,
                context: Some(tracks),
            })
        }
        "add" => queue(QueueMessage::AddToQueue(tracks_from("add", argument)?)),
        "remove" => queue(QueueMessage::RemoveFromQueue(index("remove", argument)?)),
        "click" => {
            let position = index("click", argument)?;
            let track = snapshot
                .queue
                .get(position)
                .cloned()
                .ok_or_else(|| format!("click: queue has no entry {position}"))?;
            queue(QueueMessage::QueueItemClicked {
                track,
                index: position,
            })
        }
        "repeat" => queue(QueueMessage::SetRepeatMode(keyword::<RepeatMode>(
            "repeat", argument,
        )?)),
        "shuffle" => queue(QueueMessage::SetShuffle(switch("shuffle", argument)?)),
        "quality" => playback(PlaybackMessage::SetAudioQuality(keyword::<AudioQuality>(
            "quality", argument,
        )?)),
        "recommend" => queue(QueueMessage::SetRecommendations(tracks_from(
            "recommend",
            argument,
        )?)),
        "queue" => Ok(DriverCommand::ShowQueue),
        "hide" => playback(PlaybackMessage::VisibilityChanged { visible: false }),
        "show" => playback(PlaybackMessage::VisibilityChanged { visible: true }),
        "clear" => queue(QueueMessage::ClearQueue),
        "help" => Ok(DriverCommand::Help),
        "quit" | "exit" => Ok(DriverCommand::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn load_seed_tracks(path: &Path) -> Result<Vec<Track>, error::PlaybackError> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    Ok(Track::list_from_catalog_json(&value))
}

fn print_queue(snapshot: &QueueSnapshot) {
    match &snapshot.current {
        Some(track) => info!("Now: {} - {}", track.artist.name, track.title),
        None => info!("Now: nothing"),
    }
    for (position, track) in snapshot.queue.iter().enumerate() {
        info!("  [{}] {} - {}", position, track.artist.name, track.title);
    }
    info!(
        "{} in history, repeat {:?}, shuffle {}",
        snapshot.history.len(),
        snapshot.repeat_mode,
        if snapshot.shuffle { "on" } else { "off" }
    );
}

fn log_bus_events(
    mut bus_receiver: broadcast::Receiver<Message>,
    latest_snapshot: Arc<Mutex<QueueSnapshot>>,
) {
    loop {
        match bus_receiver.blocking_recv() {
            Ok(Message::Notice(notice)) => warn!("{}", notice.message),
            Ok(Message::Playback(PlaybackMessage::Started { track, resumed })) => info!(
                "{} {} - {}",
                if resumed { "Resumed" } else { "Playing" },
                track.artist.name,
                track.title
            ),
            Ok(Message::Playback(PlaybackMessage::PlaybackFailed { track_id, error })) => {
                warn!("Playback of {} failed: {}", track_id, error)
            }
            Ok(Message::Playback(PlaybackMessage::StatusChanged(status))) => {
                debug!("Status: {:?}", status)
            }
            Ok(Message::Queue(QueueMessage::QueueChanged(snapshot))) => {
                debug!(
                    "Queue: {} upcoming, {} in history",
                    snapshot.queue.len(),
                    snapshot.history.len()
                );
                *latest_snapshot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
            }
            Ok(Message::Queue(QueueMessage::NoNextTrack)) => info!("End of queue"),
            Ok(Message::Queue(QueueMessage::NoPreviousTrack)) => info!("History is empty"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.parse_default_env();
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config = match config_file_path() {
        Some(config_file) => load_or_create(&config_file),
        None => {
            warn!("No config directory available, using defaults");
            Config::default()
        }
    };
    let db_path = DbManager::default_path().ok_or("no data directory for the database")?;
    info!("Using database at {}", db_path.display());

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);

    let latest_snapshot = Arc::new(Mutex::new(QueueSnapshot::default()));
    let event_log_receiver = bus_sender.subscribe();
    let event_log_snapshot = Arc::clone(&latest_snapshot);
    std::thread::spawn(move || log_bus_events(event_log_receiver, event_log_snapshot));

    spawn_background_services(BackgroundServicesConfig {
        bus_sender: bus_sender.clone(),
        config,
        db_path,
    })?;

    if let Some(seed_path) = std::env::args().nth(1) {
        match load_seed_tracks(Path::new(&seed_path)) {
            Ok(tracks) if !tracks.is_empty() => {
                info!("Seeding queue with {} tracks from {}", tracks.len(), seed_path);
                let _ = bus_sender.send(Message::Queue(QueueMessage::PlayTrack {
                    track: tracks[0].clone(),
                    autoplay: false,
                    context: Some(tracks),
                }));
            }
            Ok(_) => warn!("{} contains no tracks", seed_path),
            Err(err) => error!("Failed to load tracks from {}: {}", seed_path, err),
        }
    }

    info!("{}", HELP_TEXT);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let snapshot = latest_snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match parse_command(&line, &snapshot) {
            Ok(DriverCommand::Send(message)) => {
                let _ = bus_sender.send(message);
            }
            Ok(DriverCommand::ShowQueue) => print_queue(&snapshot),
            Ok(DriverCommand::Help) => info!("{}", HELP_TEXT),
            Ok(DriverCommand::Quit) => break,
            Err(err) => warn!("{} ({})", err, HELP_TEXT),
        }
    }

    info!("Shutting down");
    Ok(())
}
