pub mod config;
pub mod error;
pub mod event_bus;
pub mod identity;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{PopupError, PopupResult};
