//! Spectrec server binary

use std::path::Path;
use std::process;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spectrec::config::Config;
use spectrec::server::Server;

#[tokio::main]
async fn main() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_location = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = match Config::from_file(Path::new(&config_location)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("spectrec: {e}");
            eprintln!();
            eprintln!("Usage: spectrec [config.json]");
            process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_location,
        "starting spectrec"
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        process::exit(1);
    }
}
