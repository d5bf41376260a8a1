pub mod bus;
pub mod config;
pub mod events;
pub mod logging;
pub mod paths;

pub use bus::EventBus;
pub use config::{
    Config, ConfigError, EventsConfig, LogLevel, LoggingConfig, PlayerConfig, ValidationError,
};
pub use events::{BusMessage, Event, EventPublisher};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "webradio";
pub const APP_AUTHOR: &str = "Webradio";
pub const APP_QUALIFIER: &str = "org";
