use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use rustls_pemfile::{certs, private_key};

use midnight_coop::clock::SystemClock;
use midnight_coop::routes::routes;
use midnight_coop::session::MemorySessionRegistry;
use midnight_coop::store::{JsonFileRoomStore, MemoryRoomStore, RoomStore};
use midnight_coop::{Server, ServerConfig};

/// Checks that the certificate and key parse before handing the paths to warp,
/// so a broken pair falls back to plain HTTP instead of failing at bind time.
fn tls_files_usable(cert_path: &Path, key_path: &Path) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open certificate file {}: {}", cert_path.display(), e);
            return false;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open private key file {}: {}", key_path.display(), e);
            return false;
        }
    };

    let certs: Vec<_> = match certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>() {
        Ok(certs) => certs,
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return false;
        }
    };
    if certs.is_empty() {
        warn!("No certificate found in {}", cert_path.display());
        return false;
    }

    match private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!("No private key found in {}", key_path.display());
            false
        }
        Err(e) => {
            warn!("Failed to parse private key: {}", e);
            false
        }
    }
}

async fn open_store(config: &ServerConfig) -> Arc<dyn RoomStore> {
    if let Some(path) = &config.store_path {
        match JsonFileRoomStore::open(path).await {
            Ok(store) => {
                info!("Persisting rooms to {}", path.display());
                return Arc::new(store);
            }
            Err(e) => error!(
                "Could not open room store {}: {}, keeping rooms in memory",
                path.display(),
                e
            ),
        }
    }
    Arc::new(MemoryRoomStore::new())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let store = open_store(&config).await;
    let server = Server::new(
        config.clone(),
        store,
        Arc::new(MemorySessionRegistry::new()),
        Arc::new(SystemClock),
    );
    if let Err(e) = server.init().await {
        error!("Failed to initialise room store: {}", e);
        std::process::exit(1);
    }
    let _sweeper = server.spawn_sweeper();

    let routes = routes(server);

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) if tls_files_usable(cert, key) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.bind);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind)
                .await;
        }
        (Some(_), Some(_)) => {
            warn!(
                "TLS files unusable, falling back to HTTP/WS on {}",
                config.bind
            );
            warp::serve(routes).run(config.bind).await;
        }
        _ => {
            info!("Starting server (HTTP/WS) on {}", config.bind);
            warp::serve(routes).run(config.bind).await;
        }
    }
}
