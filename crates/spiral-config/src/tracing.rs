use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Knobs for [`init_tracing_with`].
#[derive(Clone, Debug)]
pub struct TracingOptions {
    /// Directive used when `RUST_LOG` is absent or malformed.
    pub default_filter: String,
    /// Optional Chrome trace output. Defaults to `SPIRAL_TRACE_CHROME`.
    pub chrome_path: Option<PathBuf>,
    pub with_target: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            chrome_path: None,
            with_target: true,
        }
    }
}

impl TracingOptions {
    pub fn with_default_filter(mut self, directive: impl Into<String>) -> Self {
        self.default_filter = directive.into();
        self
    }

    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }
}

/// Configures the global tracing subscriber from the environment.
pub fn init_tracing() -> Result<(), InitError> {
    let options = TracingOptions {
        chrome_path: chrome_trace_path()?,
        ..TracingOptions::default()
    };
    init_tracing_with(options)
}

/// Configures the global tracing subscriber with explicit options.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter.as_str()));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(options.with_target)
        .with_ansi(ansi);

    match options.chrome_path {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
            if let Ok(mut slot) = cell.lock() {
                *slot = Some(guard);
            }
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(chrome_layer)
                .try_init()
                .map_err(|err| InitError::Subscriber(err.to_string()))?;
        }
        None => {
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| InitError::Subscriber(err.to_string()))?;
        }
    }

    Ok(())
}

fn chrome_trace_path() -> Result<Option<PathBuf>, InitError> {
    match std::env::var("SPIRAL_TRACE_CHROME") {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(PathBuf::from(raw))),
        Ok(_) => Ok(None),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(InitError::Env(err)),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read SPIRAL_TRACE_CHROME: {0}")]
    Env(std::env::VarError),
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_reported() {
        let first = init_tracing_with(TracingOptions::default().with_default_filter("warn"));
        assert!(first.is_ok() || matches!(first, Err(InitError::Subscriber(_))));
        let second = init_tracing_with(TracingOptions::default());
        assert!(matches!(second, Err(InitError::AlreadyInitialised)));
    }
}
