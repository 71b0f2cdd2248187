pub mod config;
pub mod error;
pub mod event;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{NodeflowError, Result};
pub use event::EventBus;
pub use template::{AuthValue, InputField, NodeTemplate};
pub use types::*;
