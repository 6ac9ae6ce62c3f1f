//! Configuration, paths, time and logging utilities shared by the Djombi auth crates.

mod clock;
mod config;
mod error;
mod logging;
mod paths;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, OAuthProviderConfig, DEFAULT_BACKEND_URL, DEFAULT_LOG_LEVEL,
    DEFAULT_ORGANIZATION_CACHE_TTL_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
