use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

static INIT: Once = Once::new();

/// Verbosity ladder. Each level enables everything the previous one does.
///
/// Command output is logged under `dynamake::stdout` / `dynamake::stderr`,
/// engine file operations (touch, remove) under `dynamake::file`, and
/// skip/run decisions under `dynamake::why`, so the ladder is realized as an
/// `EnvFilter` over those sub-targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[clap(rename_all = "UPPER")]
pub enum LogLevel {
    #[default]
    Warn,
    Stderr,
    Stdout,
    Info,
    File,
    Why,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn directives(self) -> &'static str {
        match self {
            LogLevel::Warn => "dynamake=warn",
            LogLevel::Stderr => "dynamake=warn,dynamake::stderr=info",
            LogLevel::Stdout => "dynamake=warn,dynamake::stderr=info,dynamake::stdout=info",
            LogLevel::Info => "dynamake=info",
            LogLevel::File => "dynamake=info,dynamake::file=debug",
            LogLevel::Why => "dynamake=info,dynamake::file=debug,dynamake::why=debug",
            LogLevel::Debug => "dynamake=debug",
            LogLevel::Trace => "trace",
        }
    }
}

pub(crate) fn init(level: LogLevel) {
    INIT.call_once(|| {
        let _ = tracing_log::LogTracer::init();
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(level.directives()))
            .with(layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
