//! Chat server entry point.
//!
//! Run several instances against the same Redis to scale out:
//! ```text
//! PORT=3000 parley-server
//! PORT=3001 parley-server
//! ```

mod args;
mod logging;

use clap::Parser;
use log::{error, info};
use parley_chat::server::ChatServer;

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.debug);

    let config = args.into_config();
    info!("Starting parley-server on {}", config.bind_addr);

    let server = match ChatServer::connect(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to connect to shared store: {e}");
            return Err(e.into());
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("parley-server stopped");
    Ok(())
}
