//! Server assembly and lifecycle
//!
//! Loads existing recordings, serves the replay surface, and shuts down
//! gracefully by quiescing every recording before the process exits.

use std::convert::Infallible;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::monitor::Monitor;
use crate::record::UpstreamClient;
use crate::registry::RecordingRegistry;
use crate::replay::ReplayRouter;
use crate::{Result, SpectrecError};

/// Interval between sweeps of the new-client bucket store
const DETECTOR_GC_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled replay server.
pub struct Server {
    config: Config,
    registry: Arc<RecordingRegistry>,
    router: Arc<ReplayRouter<UpstreamClient>>,
    monitor: Monitor<UpstreamClient>,
}

impl Server {
    /// Build a server from a configuration: ensures the recordings
    /// directory exists and loads the recordings already in it.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(RecordingRegistry::new(config.keep_num_recordings));

        match fs::metadata(&config.recordings_directory) {
            Ok(_) => {
                let loaded = registry.load_directory(&config.recordings_directory)?;
                info!("loaded {} existing recordings", loaded);
            }
            Err(_) => {
                fs::create_dir_all(&config.recordings_directory)?;
            }
        }

        let api = Arc::new(UpstreamClient::new());
        let router = Arc::new(ReplayRouter::new(Arc::clone(&registry), Arc::clone(&api)));
        let monitor = Monitor::new(
            Arc::clone(&registry),
            api,
            config.recordings_directory.clone(),
        );

        Ok(Self {
            config,
            registry,
            router,
            monitor,
        })
    }

    /// The recording supervisor, for wiring up a game poller.
    pub fn monitor(&self) -> Monitor<UpstreamClient> {
        self.monitor.clone()
    }

    /// The recording registry.
    pub fn registry(&self) -> Arc<RecordingRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve the replay surface until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|e| SpectrecError::Config(format!("invalid bind address: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", addr);

        // Keep the new-client bucket store from growing without bound.
        let gc_router = Arc::clone(&self.router);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(DETECTOR_GC_INTERVAL).await;
                gc_router.detector().gc();
            }
        });

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = Arc::clone(&self.router);
                            let client_ip = peer_addr.ip();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let router = Arc::clone(&router);
                                    async move {
                                        Ok::<_, Infallible>(router.handle(req, client_ip).await)
                                    }
                                });

                                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                () = &mut shutdown => {
                    info!("stopping gracefully");
                    self.registry.close_all().await;
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_creates_recordings_directory() {
        let dir = TempDir::new().unwrap();
        let recordings_dir = dir.path().join("recordings");

        let config = Config {
            recordings_directory: recordings_dir.clone(),
            ..Default::default()
        };

        let server = Server::new(config).unwrap();
        assert!(recordings_dir.is_dir());
        assert!(server.registry().is_empty());
    }
}
