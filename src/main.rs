use std::path::PathBuf;

use stratus::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("stratus starting");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path))?,
        None => Config::default(),
    };

    stratus::agent::run(config)
        .await
        .inspect_err(|e| tracing::error!("fatal: {e}"))?;

    tracing::info!("stratus shutting down");
    Ok(())
}
