pub mod config_loader;
pub mod logger;

pub use config_loader::init_config;
pub use logger::{Logger, OperationStatus, init_logger};
