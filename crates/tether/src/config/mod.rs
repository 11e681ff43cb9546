mod settings;
mod validation;

pub use settings::{Config, ConnectionConfig, HubConfig, MAX_PONG_WAIT_MS, RetryPolicy};
pub use validation::warn_unknown_fields;
