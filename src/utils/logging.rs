//! Logging setup built on `tracing`.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Logging configuration options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level.
    pub level: Level,
    /// Whether to include timestamps.
    pub timestamps: bool,
    /// Whether to include source code locations.
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            source_location: false,
        }
    }
}

/// Initialize the global subscriber. Safe to call more than once; only the
/// first call takes effect. `RUST_LOG` directives override `config.level`.
pub fn setup_logging(config: LogConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env().add_directive(config.level.into());

        let builder = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location);

        // A subscriber installed by the embedding application wins.
        if config.timestamps {
            let _ = builder.try_init();
        } else {
            let _ = builder.without_time().try_init();
        }
    });
}
