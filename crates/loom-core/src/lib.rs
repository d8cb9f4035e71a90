pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod security;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{LoomError, Result};
pub use event::{EventBus, RuntimeEvent};
pub use types::*;
