use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Events go to stderr so stdout carries only command output.
pub fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("noshow_predictor=info,warn"));

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true);
            Registry::default().with(env_filter).with(fmt_layer).init();
        }
        LogFormat::Text => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false);
            Registry::default().with(env_filter).with(fmt_layer).init();
        }
    }
}
