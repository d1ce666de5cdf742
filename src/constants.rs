//! Shared constants for the embedstream gateway
//!
//! Centralizes defaults and limits so the config layer, the session engine
//! and the tests agree on the same values.

/// Defaults applied when configuration leaves a value unset
pub mod defaults {
    /// Listen host
    pub const HOST: &str = "0.0.0.0";

    /// Listen port
    pub const PORT: u16 = 1301;

    /// Concurrent in-flight requests allowed per stream session
    pub const MAX_IN_FLIGHT: usize = 16;

    /// Per-model dispatcher queue bound
    pub const QUEUE_CAPACITY: usize = 64;

    /// Outbound responses buffered per session before the write loop waits
    pub const RESPONSE_BUFFER: usize = 32;

    /// Seconds sessions get to drain in-flight work on shutdown
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;

    /// After cancellation, how long a session keeps collecting `Cancelled`
    /// completions before it stops writing
    pub const CANCEL_DRAIN_MILLIS: u64 = 250;

    /// TensorFlow Serving REST endpoint
    pub const BACKEND_URL: &str = "http://localhost:8501/v1";

    /// Backend HTTP request timeout
    pub const BACKEND_TIMEOUT_SECS: u64 = 30;

    /// Metrics reporter period
    pub const METRICS_INTERVAL_SECS: u64 = 60;
}

/// Environment variables understood outside the `EMBEDSTREAM_` prefix
pub mod env {
    /// Listen address override in `ip:port` form
    pub const ADDR: &str = "ADDR";

    /// Presence enables file logging
    pub const LOG_OUTPUT: &str = "LOG_OUTPUT";

    /// Directory for rolling log files
    pub const LOG_DIR: &str = "LOG_DIR";

    /// Prefix for layered configuration
    pub const CONFIG_PREFIX: &str = "EMBEDSTREAM";
}

/// Log file name used by the rolling appender
pub const LOG_FILE_NAME: &str = "embedstream.log";
