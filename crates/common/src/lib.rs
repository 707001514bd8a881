//! Building blocks shared by the dome and shutter controllers: the unit
//! lock, relay/input boards, persistence, the event log and config helpers.

pub mod board;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod store;

use tracing_subscriber::EnvFilter;

pub use error::{ControlError, Reply};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
