//! Plaza relay — signaling and document sync server for shared spaces.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PLAZA_BIND_ADDR` | `127.0.0.1:9090` |
//! | `PLAZA_BROADCAST_CAPACITY` | `256` |
//! | `PLAZA_ACTIVITY_INTERVAL_SECS` | `30` |
//!
//! `RUST_LOG` controls verbosity.

use log::info;
use plaza_collab::{RelayError, RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Plaza relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
