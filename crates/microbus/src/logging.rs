use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Crates whose spans and events `--log-level` governs. Everything else
/// (dependencies) stays at `warn` unless `RUST_LOG` says otherwise.
const BUS_CRATES: &[&str] = &[
    "microbus",
    "microbus_envelope",
    "microbus_session",
    "microbus_message",
    "microbus_transport",
];

fn bus_directives(level: LogLevel) -> String {
    let level = level.as_directive();
    let mut directives = String::from("warn");
    for target in BUS_CRATES {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, overrides the flag-derived filter entirely. Logs go
/// to stderr so command output on stdout stays parseable.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(bus_directives(level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
