use std::{
    any::Any,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use log::{error, info, warn};
use tokio::sync::broadcast;

use crate::{
    backends::{http_origin::HttpAudioOrigin, AudioOrigin},
    config::Config,
    db_manager::{DbManager, EvictionPolicy},
    error::PlaybackError,
    media_controls_manager::MediaControlsManager,
    playback::{
        cpal_output::CpalOutput, resource_manager::PlaybackResourceManager,
        source_registry::SourceRegistry,
    },
    protocol::{AudioMessage, Message},
    queue_manager::QueueManager,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub config: Config,
    pub db_path: PathBuf,
}

pub fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn spawn_service<F>(name: &'static str, service: F)
where
    F: FnOnce() + Send + 'static,
{
    let spawn_result = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(service));
            if let Err(payload) = run_result {
                error!(
                    "{} thread terminated due to panic: {}",
                    name,
                    panic_payload_to_string(payload.as_ref())
                );
            }
        });
    if let Err(err) = spawn_result {
        error!("Failed to spawn {} thread: {}", name, err);
    }
}

/// Opens the store, trims the blob cache and starts every manager thread.
pub fn spawn_background_services(config: BackgroundServicesConfig) -> Result<(), PlaybackError> {
    let BackgroundServicesConfig {
        bus_sender,
        config,
        db_path,
    } = config;

    let store = DbManager::open(&db_path)?;
    match store.evict_blobs(&EvictionPolicy::from(&config.cache), None) {
        Ok(0) => {}
        Ok(evicted) => info!("Evicted {} cached audio blobs at startup", evicted),
        Err(err) => warn!("Startup cache eviction failed: {}", err),
    }
    let store = Arc::new(Mutex::new(store));
    let queue_db = DbManager::open(&db_path)?;

    let queue_manager_bus_receiver = bus_sender.subscribe();
    let queue_manager_bus_sender = bus_sender.clone();
    spawn_service("QueueManager", move || {
        let mut queue_manager =
            QueueManager::new(queue_manager_bus_receiver, queue_manager_bus_sender, queue_db);
        queue_manager.run();
    });

    if config.media_controls.enabled {
        let media_controls_bus_receiver = bus_sender.subscribe();
        let media_controls_bus_sender = bus_sender.clone();
        let media_controls_config = config.media_controls.clone();
        spawn_service("MediaControlsManager", move || {
            let mut media_controls_manager = MediaControlsManager::new(
                media_controls_bus_receiver,
                media_controls_bus_sender,
                &media_controls_config,
            );
            media_controls_manager.run();
        });
    }

    let origin: Arc<dyn AudioOrigin> = Arc::new(HttpAudioOrigin::new(&config.origin));
    let resource_manager_bus_receiver = bus_sender.subscribe();
    let resource_manager_bus_sender = bus_sender.clone();
    let resource_manager_config = config.clone();
    spawn_service("PlaybackResourceManager", move || {
        let registry = SourceRegistry::new();
        // The cpal stream is not Send, so the output is built on its owning thread.
        let output = CpalOutput::new(registry.clone());
        let mut resource_manager = PlaybackResourceManager::new(
            resource_manager_bus_receiver,
            resource_manager_bus_sender,
            output,
            registry,
            store,
            origin,
            resource_manager_config,
        );
        resource_manager.run();
    });

    let ticker_bus_sender = bus_sender.clone();
    let tick_interval = Duration::from_millis(u64::from(config.playback.progress_interval_ms));
    spawn_service("ProgressTicker", move || loop {
        thread::sleep(tick_interval);
        if ticker_bus_sender
            .send(Message::Audio(AudioMessage::ProgressTick))
            .is_err()
        {
            info!("ProgressTicker: bus has no receivers, stopping");
            break;
        }
    });

    Ok(())
}
