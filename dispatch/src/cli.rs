use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the dispatch server, accepting local TCP connections.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7450")]
    pub listen: SocketAddr,

    /// Mark a taxi unavailable while it is bound to a ride and release it
    /// on completion or cancellation.
    #[arg(long)]
    pub busy_on_assign: bool,

    /// Default radius for taxi proximity queries, in kilometres.
    #[arg(long, default_value_t = 1.0)]
    pub taxi_radius_km: f64,

    /// Default radius for shared-ride queries, in metres.
    #[arg(long, default_value_t = 500.0)]
    pub shared_ride_radius_m: f64,

    /// JSON file of accounts (and their taxis) to register at startup.
    #[arg(long)]
    pub seed: Option<PathBuf>,
}
