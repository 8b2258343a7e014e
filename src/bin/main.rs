use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use archivist::{routes, Archiver, ArchiverConfig};
use archivist_crypto::{CryptoFacade, Ed25519Crypto};
use archivist_data::TcpPushConnector;
use archivist_p2p::HttpTransport;
use archivist_state::MemoryStore;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

const MAX_BOOTSTRAP_BACKOFF: Duration = Duration::from_secs(60);
const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "archivist")]
#[command(about = "Archive node for a cycle-based consensus network", long_about = None)]
struct Cli {
    /// Config file layered under ARCHIVER_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured ingress port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let mut config = ArchiverConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let keys = config.key_pair()?;
    let crypto: Arc<dyn CryptoFacade> = Arc::new(Ed25519Crypto::new(keys, config.hash_key_bytes()?));
    if config
        .bootstrap_archivers
        .iter()
        .all(|a| a.public_key == crypto.public_key())
    {
        bail!("no bootstrap archivers other than this node are configured");
    }
    info!("archiver public key {}", crypto.public_key());

    let port = config.port;
    let (mut archiver, handle) = Archiver::new(
        config,
        crypto.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(HttpTransport::new()),
        Arc::new(TcpPushConnector::new(PUSH_CONNECT_TIMEOUT)),
    );

    let mut backoff = Duration::from_secs(1);
    loop {
        match archiver.bootstrap().await {
            Ok(()) => break,
            Err(e) if e.is_fatal() => {
                error!("bootstrap failed: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn!("bootstrap attempt failed, retrying in {:?}: {}", backoff, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BOOTSTRAP_BACKOFF);
            }
        }
    }

    let api = routes(handle.clone(), crypto);
    tokio::spawn(warp::serve(api).run(([0, 0, 0, 0], port)));
    info!("serving peer archivers on port {}", port);

    let mut reactor = tokio::spawn(archiver.run());
    tokio::select! {
        _ = &mut reactor => warn!("archiver stopped on its own"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            let _ = handle.shutdown().await;
            let _ = reactor.await;
        }
    }
    Ok(())
}
