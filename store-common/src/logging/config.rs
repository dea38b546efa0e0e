use std::env;
use std::str::FromStr;

use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use super::json_layer::JsonLines;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// No target or source location
    Compact,
    /// One JSON object per line, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    #[default]
    Local,
    Utc,
    None,
}

impl FromStr for TimestampFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "" => Ok(TimestampFormat::Local),
            "utc" => Ok(TimestampFormat::Utc),
            "none" | "off" => Ok(TimestampFormat::None),
            other => Err(format!("unknown timestamp format '{}'", other)),
        }
    }
}

/// Subscriber settings, normally read from `LOG_*` variables
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub timestamps: TimestampFormat,
    /// Used when `RUST_LOG` is unset
    pub default_level: String,
    pub location: bool,
    pub service: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            timestamps: TimestampFormat::Local,
            default_level: "info".to_string(),
            location: false,
            service: None,
        }
    }
}

impl LogConfig {
    /// Unparseable values fall back to the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            format: lookup("LOG_FORMAT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            timestamps: lookup("LOG_TIMESTAMPS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timestamps),
            default_level: lookup("LOG_LEVEL").unwrap_or(defaults.default_level),
            location: lookup("LOG_LOCATION")
                .map(|s| matches!(s.as_str(), "1" | "true"))
                .unwrap_or(defaults.location),
            service: None,
        }
    }

    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    fn layer(&self) -> BoxedLayer {
        if self.format == LogFormat::Json {
            return Box::new(JsonLines::new(
                self.service.clone(),
                self.location,
                self.timestamps == TimestampFormat::Utc,
            ));
        }

        let location = self.location && self.format == LogFormat::Pretty;
        let base = fmt::layer()
            .with_target(self.format == LogFormat::Pretty)
            .with_file(location)
            .with_line_number(location)
            .with_ansi(atty::is(atty::Stream::Stdout));
        match self.timestamps {
            TimestampFormat::Local => Box::new(
                base.with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())),
            ),
            TimestampFormat::Utc => Box::new(
                base.with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string())),
            ),
            TimestampFormat::None => Box::new(base.without_time()),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_level))?;
    tracing_subscriber::registry()
        .with(config.layer())
        .with(filter)
        .try_init()?;
    Ok(())
}
