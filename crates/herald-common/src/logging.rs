//! Tracing setup for binaries and harnesses that embed the engines.
//!
//! The engines only emit `tracing` events; nothing in the library installs
//! a subscriber on its own. Hosts that want the stock wiring call
//! [`init_logging`] once at startup:
//!
//! - `HERALD_LOG_FORMAT=json` switches to machine-readable output, anything
//!   else stays compact text.
//! - `RUST_LOG` filters verbosity as usual (`RUST_LOG=herald_outbox=trace`),
//!   falling back to the options' default directive.
//!
//! Repeated initialization is a no-op so test binaries sharing a process
//! can all call it.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output encoding for the stock subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line text.
    Text,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl LogFormat {
    /// Read `HERALD_LOG_FORMAT`; unknown or missing values mean text.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("HERALD_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Subscriber options.
pub struct LogOptions {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: &'static str,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::from_env(),
            default_directive: "info",
        }
    }
}

impl LogOptions {
    /// Install the global subscriber. Later calls in the same process keep
    /// the first subscriber.
    pub fn init(self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive));
        let output = match self.format {
            LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
            LogFormat::Text => fmt::layer().compact().with_target(true).boxed(),
        };
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(output)
            .try_init();
    }
}

/// Install the stock subscriber: format from the environment, `info`
/// verbosity unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    LogOptions::default().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_defaults_to_text() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Text);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn repeated_init_keeps_the_first_subscriber() {
        LogOptions {
            format: LogFormat::Text,
            default_directive: "warn",
        }
        .init();
        // A second install must not panic or error the process.
        init_logging();
    }
}
