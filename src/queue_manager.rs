use std::collections::HashMap;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::{
    db_manager::DbManager,
    protocol::{self, PlayRequest, PlaybackMessage, QueueMessage},
    queue::{EndAction, PlayQueue},
    settings::{self, SettingKey},
    track::Track,
};

// Owns the queue and history and drives playback through the bus
pub struct QueueManager {
    queue: PlayQueue,
    recommended: Vec<Track>,
    listen_counts: HashMap<String, u64>,
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
    db_manager: DbManager,
}

impl QueueManager {
    /// Restores queue, history, modes and recommendations from the store.
    pub fn new(
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
        db_manager: DbManager,
    ) -> Self {
        let snapshot = db_manager.get_queue_snapshot().unwrap_or_else(|err| {
            error!("QueueManager: failed to read queue snapshot: {}", err);
            Vec::new()
        });
        let queue = PlayQueue::restore(
            settings::load_current_track(&db_manager),
            snapshot,
            settings::load_tracks(&db_manager, SettingKey::PreviousTracks),
            settings::load_repeat_mode(&db_manager),
            settings::load_shuffle(&db_manager),
        );
        let recommended = settings::load_tracks(&db_manager, SettingKey::RecommendedTracks);
        let listen_counts = db_manager.get_all_listen_counts().unwrap_or_else(|err| {
            error!("QueueManager: failed to read listen counts: {}", err);
            HashMap::new()
        });
        info!(
            "QueueManager: restored {} queued, {} in history, current {:?}",
            queue.queue().len(),
            queue.history().len(),
            queue.current().map(|track| track.id.as_str())
        );
        Self {
            queue,
            recommended,
            listen_counts,
            bus_consumer,
            bus_producer,
            db_manager,
        }
    }

    pub fn queue(&self) -> &PlayQueue {
        &self.queue
    }

    pub fn listen_count(&self, track_id: &str) -> u64 {
        self.listen_counts.get(track_id).copied().unwrap_or(0)
    }

    pub fn run(&mut self) {
        self.broadcast_queue_changed();
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("QueueManager: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("QueueManager: bus closed");
                    break;
                }
            }
        }
    }

    pub fn handle_message(&mut self, message: protocol::Message) {
        match message {
            protocol::Message::Queue(QueueMessage::PlayTrack {
                track,
                autoplay,
                context,
            }) => {
                let track = self.queue.play_track(track, context);
                self.request_play(track, autoplay);
                self.persist_queue();
            }
            protocol::Message::Queue(QueueMessage::Skip) => match self.queue.skip() {
                Some(track) => {
                    self.request_play(track, true);
                    self.persist_queue();
                }
                None => {
                    debug!("QueueManager: nothing after the current track");
                    self.send(QueueMessage::NoNextTrack);
                }
            },
            protocol::Message::Queue(QueueMessage::Previous) => match self.queue.previous() {
                Some(track) => {
                    self.request_play(track, true);
                    self.persist_queue();
                }
                None => {
                    debug!("QueueManager: history is empty");
                    self.send(QueueMessage::NoPreviousTrack);
                }
            },
            protocol::Message::Queue(QueueMessage::AddToQueue(tracks)) => {
                let added = self.queue.add_to_queue(tracks);
                debug!("QueueManager: added {} tracks", added);
                self.persist_queue();
            }
            protocol::Message::Queue(QueueMessage::RemoveFromQueue(index)) => {
                if self.queue.remove_from_queue(index).is_some() {
                    self.persist_queue();
                } else {
                    debug!("QueueManager: remove index {} out of range", index);
                }
            }
            protocol::Message::Queue(QueueMessage::QueueItemClicked { track, index }) => {
                let track = self.queue.on_queue_item_click(track, index);
                self.request_play(track, true);
                self.persist_queue();
            }
            protocol::Message::Queue(QueueMessage::ClearQueue) => {
                self.queue.clear_queue();
                if let Err(err) = self.db_manager.clear_queue_snapshot() {
                    warn!("QueueManager: failed to clear queue snapshot: {}", err);
                }
                self.broadcast_queue_changed();
            }
            protocol::Message::Queue(QueueMessage::SetRepeatMode(repeat_mode)) => {
                self.queue.set_repeat_mode(repeat_mode);
                settings::store_json(&self.db_manager, SettingKey::RepeatMode, &repeat_mode);
                self.broadcast_queue_changed();
            }
            protocol::Message::Queue(QueueMessage::SetShuffle(shuffle)) => {
                self.queue.set_shuffle(shuffle);
                settings::store_json(&self.db_manager, SettingKey::ShuffleOn, &shuffle);
                self.persist_queue();
            }
            protocol::Message::Queue(QueueMessage::SetRecommendations(tracks)) => {
                settings::store_json(&self.db_manager, SettingKey::RecommendedTracks, &tracks);
                self.recommended = tracks;
            }
            protocol::Message::Playback(PlaybackMessage::Started {
                track,
                resumed: false,
            }) => self.record_listen(&track),
            protocol::Message::Playback(PlaybackMessage::Ended { track_id }) => {
                self.on_track_ended(&track_id)
            }
            _ => trace!("QueueManager: ignoring unsupported message"),
        }
    }

    fn on_track_ended(&mut self, track_id: &str) {
        if self.queue.current().map(|track| track.id.as_str()) != Some(track_id) {
            debug!("QueueManager: ignoring end of non-current track {}", track_id);
            return;
        }
        match self.queue.on_track_ended(&self.recommended) {
            EndAction::Play(track) => {
                self.request_play(track, true);
                self.persist_queue();
            }
            EndAction::Stop => {
                info!("QueueManager: queue finished");
                self.send(QueueMessage::NoNextTrack);
            }
        }
    }

    fn request_play(&self, track: Track, autoplay: bool) {
        let request = PlayRequest {
            autoplay,
            ..PlayRequest::new(track)
        };
        let _ = self
            .bus_producer
            .send(protocol::Message::Playback(PlaybackMessage::Play(request)));
    }

    fn record_listen(&mut self, track: &Track) {
        if let Err(err) = self.db_manager.append_recently_played(track) {
            warn!("QueueManager: failed to record recently played: {}", err);
        }
        let count = self.listen_counts.entry(track.id.clone()).or_insert(0);
        *count += 1;
        if let Err(err) = self.db_manager.put_listen_count(&track.id, *count) {
            warn!("QueueManager: failed to persist listen count: {}", err);
        }
    }

    fn persist_queue(&mut self) {
        if let Err(err) = self.db_manager.put_queue_snapshot(self.queue.queue()) {
            warn!("QueueManager: failed to persist queue snapshot: {}", err);
        }
        settings::store_json(
            &self.db_manager,
            SettingKey::PreviousTracks,
            &self.queue.history(),
        );
        settings::store_json(
            &self.db_manager,
            SettingKey::CurrentTrack,
            &self.queue.current(),
        );
        self.broadcast_queue_changed();
    }

    fn broadcast_queue_changed(&self) {
        self.send(QueueMessage::QueueChanged(self.queue.snapshot()));
    }

    fn send(&self, message: QueueMessage) {
        let _ = self.bus_producer.send(protocol::Message::Queue(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RepeatMode;
    use serde_json::json;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    fn track(id: &str) -> Track {
        Track::from_catalog_json(&json!({ "id": id, "title": format!("Title {id}") }))
    }

    fn ids(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|track| track.id.as_str()).collect()
    }

    fn queue_message(message: QueueMessage) -> protocol::Message {
        protocol::Message::Queue(message)
    }

    fn drain(receiver: &mut Receiver<protocol::Message>) -> Vec<protocol::Message> {
        let mut messages = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        messages
    }

    fn played_ids(messages: &[protocol::Message]) -> Vec<(String, bool)> {
        messages
            .iter()
            .filter_map(|message| match message {
                protocol::Message::Playback(PlaybackMessage::Play(request)) => {
                    Some((request.track.id.clone(), request.autoplay))
                }
                _ => None,
            })
            .collect()
    }

    struct QueueFixture {
        manager: QueueManager,
        receiver: Receiver<protocol::Message>,
    }

    impl QueueFixture {
        fn with_db(db_manager: DbManager) -> Self {
            let (bus_sender, manager_receiver) = broadcast::channel(256);
            let receiver = bus_sender.subscribe();
            Self {
                manager: QueueManager::new(manager_receiver, bus_sender, db_manager),
                receiver,
            }
        }

        fn new() -> Self {
            Self::with_db(DbManager::new_in_memory().expect("failed to create in-memory db"))
        }

        fn handle(&mut self, message: QueueMessage) -> Vec<protocol::Message> {
            self.manager.handle_message(queue_message(message));
            drain(&mut self.receiver)
        }

        fn start_context(&mut self) {
            self.handle(QueueMessage::PlayTrack {
                track: track("A"),
                autoplay: true,
                context: Some(vec![track("A"), track("B"), track("C")]),
            });
        }
    }

    #[test]
    fn test_play_track_requests_playback_and_persists_snapshot() {
        let mut fixture = QueueFixture::new();
        let messages = fixture.handle(QueueMessage::PlayTrack {
            track: track("A"),
            autoplay: false,
            context: Some(vec![track("A"), track("B"), track("C")]),
        });

        assert_eq!(played_ids(&messages), vec![("A".to_string(), false)]);
        assert!(messages.iter().any(|message| matches!(
            message,
            protocol::Message::Queue(QueueMessage::QueueChanged(snapshot))
                if snapshot.current.as_ref().map(|t| t.id.as_str()) == Some("A")
        )));

        let db = &fixture.manager.db_manager;
        let snapshot = db.get_queue_snapshot().expect("snapshot");
        assert_eq!(ids(&snapshot), vec!["A", "B", "C"]);
        assert_eq!(
            settings::load_current_track(db).map(|t| t.id),
            Some("A".to_string())
        );
    }

    #[test]
    fn test_skip_and_previous_report_edges() {
        let mut fixture = QueueFixture::new();
        let messages = fixture.handle(QueueMessage::Previous);
        assert!(messages
            .iter()
            .any(|m| matches!(m, protocol::Message::Queue(QueueMessage::NoPreviousTrack))));

        fixture.start_context();
        let messages = fixture.handle(QueueMessage::Skip);
        assert_eq!(played_ids(&messages), vec![("B".to_string(), true)]);
        let db = &fixture.manager.db_manager;
        assert_eq!(
            ids(&settings::load_tracks(db, SettingKey::PreviousTracks)),
            vec!["A"]
        );

        fixture.handle(QueueMessage::Skip);
        let messages = fixture.handle(QueueMessage::Skip);
        assert!(played_ids(&messages).is_empty());
        assert!(messages
            .iter()
            .any(|m| matches!(m, protocol::Message::Queue(QueueMessage::NoNextTrack))));

        let messages = fixture.handle(QueueMessage::Previous);
        assert_eq!(played_ids(&messages), vec![("B".to_string(), true)]);
    }

    #[test]
    fn test_clear_queue_empties_snapshot() {
        let mut fixture = QueueFixture::new();
        fixture.start_context();
        fixture.handle(QueueMessage::ClearQueue);
        assert!(fixture.manager.queue().queue().is_empty());
        assert!(fixture
            .manager
            .db_manager
            .get_queue_snapshot()
            .expect("snapshot")
            .is_empty());
    }

    #[test]
    fn test_fresh_start_records_listen_but_resume_does_not() {
        let mut fixture = QueueFixture::new();
        let started = |resumed| {
            protocol::Message::Playback(PlaybackMessage::Started {
                track: track("A"),
                resumed,
            })
        };
        fixture.manager.handle_message(started(false));
        fixture.manager.handle_message(started(true));
        fixture.manager.handle_message(started(false));

        assert_eq!(fixture.manager.listen_count("A"), 2);
        let db = &fixture.manager.db_manager;
        assert_eq!(db.get_all_listen_counts().expect("counts").get("A"), Some(&2));
        assert_eq!(ids(&db.get_recently_played(10).expect("recent")), vec!["A"]);
    }

    #[test]
    fn test_end_of_current_track_advances_and_stale_end_is_ignored() {
        let mut fixture = QueueFixture::new();
        fixture.start_context();

        fixture
            .manager
            .handle_message(protocol::Message::Playback(PlaybackMessage::Ended {
                track_id: "C".to_string(),
            }));
        assert!(played_ids(&drain(&mut fixture.receiver)).is_empty());

        fixture
            .manager
            .handle_message(protocol::Message::Playback(PlaybackMessage::Ended {
                track_id: "A".to_string(),
            }));
        assert_eq!(
            played_ids(&drain(&mut fixture.receiver)),
            vec![("B".to_string(), true)]
        );
    }

    #[test]
    fn test_recommendations_extend_finished_queue() {
        let mut fixture = QueueFixture::new();
        fixture.handle(QueueMessage::SetRecommendations(vec![track("R")]));
        fixture.handle(QueueMessage::PlayTrack {
            track: track("A"),
            autoplay: true,
            context: Some(vec![track("A")]),
        });
        fixture
            .manager
            .handle_message(protocol::Message::Playback(PlaybackMessage::Ended {
                track_id: "A".to_string(),
            }));
        assert_eq!(
            played_ids(&drain(&mut fixture.receiver)),
            vec![("R".to_string(), true)]
        );
        assert_eq!(
            ids(&settings::load_tracks(
                &fixture.manager.db_manager,
                SettingKey::RecommendedTracks
            )),
            vec!["R"]
        );
    }

    #[test]
    fn test_state_is_restored_from_store() {
        let db = DbManager::new_in_memory().expect("failed to create in-memory db");
        db.put_queue_snapshot(&[track("B"), track("C")]).expect("snapshot");
        settings::store_json(&db, SettingKey::PreviousTracks, &vec![track("A")]);
        settings::store_json(&db, SettingKey::CurrentTrack, &Some(track("B")));
        settings::store_json(&db, SettingKey::RepeatMode, &RepeatMode::All);
        settings::store_json(&db, SettingKey::ShuffleOn, &true);

        let fixture = QueueFixture::with_db(db);
        let queue = fixture.manager.queue();
        assert_eq!(queue.current().map(|t| t.id.as_str()), Some("B"));
        assert_eq!(ids(queue.queue()), vec!["B", "C"]);
        assert_eq!(ids(queue.history()), vec!["A"]);
        assert_eq!(queue.repeat_mode(), RepeatMode::All);
        assert!(queue.shuffle());
    }

    #[test]
    fn test_run_loop_publishes_restored_state_and_handles_commands() {
        let (bus_sender, _) = broadcast::channel(256);
        let manager_receiver = bus_sender.subscribe();
        let manager_sender = bus_sender.clone();
        let mut receiver = bus_sender.subscribe();
        thread::spawn(move || {
            let db = DbManager::new_in_memory().expect("failed to create in-memory db");
            QueueManager::new(manager_receiver, manager_sender, db).run();
        });

        bus_sender
            .send(queue_message(QueueMessage::AddToQueue(vec![track("A"), track("B")])))
            .expect("send");
        bus_sender
            .send(queue_message(QueueMessage::QueueItemClicked {
                track: track("B"),
                index: 1,
            }))
            .expect("send");

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for play request");
            match receiver.try_recv() {
                Ok(protocol::Message::Playback(PlaybackMessage::Play(request))) => {
                    assert_eq!(request.track.id, "B");
                    break;
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed while waiting for message"),
            }
        }
    }
}
