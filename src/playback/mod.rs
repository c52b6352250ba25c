//! Playback subsystem: output abstraction, source handles and the resource manager.

pub mod cpal_output;
pub mod output;
pub mod resource_manager;
pub mod source_registry;
pub mod state;
