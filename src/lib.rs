pub mod analysis;
pub mod commands;
pub mod config;
pub mod download;
pub mod engine;
pub mod events;
pub mod files;
pub mod flash;
pub mod manifest;
pub mod serial;
pub mod tool;

pub use engine::{Engine, EngineBuilder};
pub use events::{BroadcastSink, CoreEvent, EventSink};

/// Install the process logger. `RUST_LOG` overrides `level`; calling this
/// again is a no-op.
pub fn init_logging(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
