//! TCP accept loop for observers.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::registry::SourceRegistry;
use crate::session::{SessionOptions, run_session};

/// Accepts observer connections and runs one session per connection
pub struct ComoServer {
    listener: TcpListener,
    registry: SourceRegistry,
    options: SessionOptions,
}

impl ComoServer {
    /// Validate `config` and bind its listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the address cannot be
    /// bound.
    pub async fn bind(config: &ServerConfig, registry: SourceRegistry) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry,
            options: SessionOptions::from(config),
        })
    }

    /// Address the server is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Serve until the task is dropped.
    pub async fn serve(self) {
        self.serve_with_shutdown(std::future::pending()).await;
    }

    /// Serve until `shutdown` completes, then close every session.
    pub async fn serve_with_shutdown(self, shutdown: impl Future<Output = ()>) {
        let token = CancellationToken::new();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        info!("Ready to accept connections");
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping server");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        sessions.spawn(run_session(
                            stream,
                            self.registry.clone(),
                            self.options,
                            token.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
            }

            while sessions.try_join_next().is_some() {}
        }

        token.cancel();
        while sessions.join_next().await.is_some() {}
        debug!("All sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig {
            outbound_buffer: 0,
            ..loopback_config()
        };
        assert!(ComoServer::bind(&config, SourceRegistry::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = ComoServer::bind(&loopback_config(), SourceRegistry::new())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_closes_sessions() {
        let registry = SourceRegistry::new();
        let server = ComoServer::bind(&loopback_config(), registry.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = stop_rx.await;
        }));

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.session_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never attached");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert_eq!(registry.session_count(), 0);
    }
}
