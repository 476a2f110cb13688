use std::str::{FromStr, ParseBoolError};

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

/// Logging format to use
#[derive(Debug, Default)]
pub enum LoggingFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
#[error("unknown logging format: {0}")]
pub struct UnknownLoggingFormat(String);

impl FromStr for LoggingFormat {
    type Err = UnknownLoggingFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(LoggingFormat::Text),
            "json" => Ok(LoggingFormat::Json),
            value => Err(UnknownLoggingFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingConfig {
    pub format: LoggingFormat,
    pub allow_noisy: bool,
}

#[derive(Debug, Error)]
pub enum LoggingConfigError {
    #[error(transparent)]
    LoggingFormat(#[from] UnknownLoggingFormat),
    #[error("failed to parse PINFETCH_LOGGING_ALLOW_NOISY")]
    InvalidAllowNoisy(ParseBoolError),
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, LoggingConfigError> {
        let format = match std::env::var("PINFETCH_LOGGING_FORMAT") {
            Ok(value) => value.parse()?,
            Err(_) => LoggingFormat::default(),
        };

        let allow_noisy = std::env::var("PINFETCH_LOGGING_ALLOW_NOISY")
            .ok()
            .map(|value| value.parse::<bool>())
            .transpose()
            .map_err(LoggingConfigError::InvalidAllowNoisy)?
            .unwrap_or_default();

        Ok(Self {
            format,
            allow_noisy,
        })
    }
}

pub fn init_logging(config: LoggingConfig) {
    tracing_subscriber::registry()
        .with(fmt_layer(config.format))
        .with(filter_layer(config.allow_noisy))
        .init();
}

/// Create a formatting layer for the provided format
fn fmt_layer<S>(format: LoggingFormat) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LoggingFormat::Text => fmt::layer()
            // Logs go to stderr, stdout is for command output
            .with_writer(std::io::stderr)
            // Display source code file paths
            .with_file(true)
            // Display source code line numbers
            .with_line_number(true)
            // Don't display the event's target (module path)
            .with_target(false)
            .boxed(),
        LoggingFormat::Json => fmt::layer()
            .json()
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .boxed(),
    }
}

fn filter_layer(allow_noisy: bool) -> EnvFilter {
    if allow_noisy {
        return EnvFilter::from_default_env();
    }

    EnvFilter::from_default_env()
        // Increase logging requirements for noisy dependencies
        .add_directive("hyper_util=info".parse().expect("directive was invalid"))
        .add_directive("h2=info".parse().expect("directive was invalid"))
        .add_directive("reqwest=info".parse().expect("directive was invalid"))
        .add_directive("rustls=info".parse().expect("directive was invalid"))
}
