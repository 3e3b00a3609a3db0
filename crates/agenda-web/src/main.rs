use agenda_web::{AppState, WebConfig, serve};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "agenda scheduling server")]
struct Args {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// SQLite database path, overriding the config file.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agenda_web=info,libagenda=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = WebConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(db) = args.db {
        config.db_path = Some(db);
    }

    let listen = config.listen;
    let state = AppState::build(config).await?;
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind listener on {listen}"))?;

    tracing::info!("agenda-web listening on http://{listen}");
    serve(listener, state, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
}
