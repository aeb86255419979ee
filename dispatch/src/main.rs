use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use taxi_dispatch::{
    auth::SeedUser,
    cli::{Cli, Command, ServeArgs},
    rides::DispatchConfig,
    session::{AppState, Server},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = DispatchConfig {
        mark_taxi_busy_on_assign: args.busy_on_assign,
        taxi_radius_km: args.taxi_radius_km,
        shared_ride_radius_m: args.shared_ride_radius_m,
    };
    let state = AppState::new(config);

    if let Some(path) = &args.seed {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        let entries: Vec<SeedUser> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse seed file {}", path.display()))?;
        state.apply_seed(&entries).await?;
        info!(accounts = entries.len(), "seed applied");
    }

    let listener = TcpListener::bind(args.listen).await?;
    let server = Server::new(listener, state);
    let addr = server.local_addr()?;
    info!("dispatch server listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("dispatch server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
