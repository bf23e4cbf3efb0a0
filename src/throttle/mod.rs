//! Sliding-window throttling across processes.

mod configuration;
mod limiter;
mod state;

pub use configuration::{per_day, per_hour, per_minute, per_second, ThrottleConfiguration, TimeUnit};
pub use limiter::Throttle;
pub use state::ThrottleState;
