use anyhow::Result;
use clap::Parser;

use dayson_train::cli::{Cli, Commands};
use dayson_train::train;

fn main() -> Result<()> {
    // File logging alongside the console, like any long training run needs.
    let file_appender = tracing_appender::rolling::daily("logs", "dayson.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "unknown panic"
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "crash at {}: {}", location, msg);
        eprintln!("crash at {}: {}", location, msg);
    }));

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train::run(args),
        Commands::Shard(args) => train::run_shard(args),
        Commands::Sanity(args) => train::run_sanity(args),
    }
}
