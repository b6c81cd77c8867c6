// Relay lifecycle: owns both listeners and the connection registry
use crate::config::{ProxyConfig, RelayOptions};
use crate::error::{RelayError, Result};
use crate::listener::{self, RelayContext};
use crate::registry::{ConnectionRegistry, Protocol};
use crate::upstream::UpstreamConnector;
use crate::{http, socks};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const MSG_STARTED: &str = "servers started";
pub const MSG_STOPPED: &str = "servers stopped";

/// Receives every running/stopped transition.
pub trait StatusObserver: Send + Sync {
    fn on_status_changed(&self, running: bool, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub running: bool,
    pub message: String,
    pub active_connections: usize,
    pub http_addr: Option<SocketAddr>,
    pub socks_addr: Option<SocketAddr>,
}

struct RelayRun {
    config: ProxyConfig,
    http_addr: SocketAddr,
    socks_addr: SocketAddr,
    http_task: JoinHandle<()>,
    socks_task: JoinHandle<()>,
}

pub struct RelayController {
    options: RelayOptions,
    registry: Arc<ConnectionRegistry>,
    observer: Option<Arc<dyn StatusObserver>>,
    run: Option<RelayRun>,
    message: String,
}

impl RelayController {
    pub fn new(options: RelayOptions) -> Self {
        RelayController {
            options,
            registry: Arc::new(ConnectionRegistry::new()),
            observer: None,
            run: None,
            message: MSG_STOPPED.to_string(),
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn StatusObserver>) {
        self.observer = Some(observer);
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Configuration of the current run, if any.
    pub fn config(&self) -> Option<&ProxyConfig> {
        self.run.as_ref().map(|run| &run.config)
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            running: self.is_running(),
            message: self.message.clone(),
            active_connections: self.registry.count(),
            http_addr: self.run.as_ref().map(|run| run.http_addr),
            socks_addr: self.run.as_ref().map(|run| run.socks_addr),
        }
    }

    /// Starts both listeners with `config`. A previous run is fully stopped
    /// first, so its ports are free again before binding.
    pub async fn start(&mut self, config: ProxyConfig) -> Result<()> {
        if self.run.is_some() {
            self.stop().await;
        }

        tracing::info!(
            "Starting relay towards {} (http {}, socks {})",
            config.host,
            config.http_port,
            config.socks_port
        );

        let (http_listener, http_addr, socks_listener, socks_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!("Relay start failed: {}", e);
                self.emit(false, format!("failed to start: {}", e));
                return Err(e);
            }
        };

        let ctx = Arc::new(RelayContext {
            connector: UpstreamConnector::new(config.clone(), self.options.connect_timeout),
            registry: Arc::clone(&self.registry),
            relay_timeout: self.options.relay_timeout,
        });

        let http_task = tokio::spawn(listener::accept_loop(
            http_listener,
            Protocol::Http,
            Arc::clone(&ctx),
            http::handle,
        ));
        let socks_task = tokio::spawn(listener::accept_loop(
            socks_listener,
            Protocol::Socks5,
            ctx,
            socks::handle,
        ));

        self.run = Some(RelayRun {
            config,
            http_addr,
            socks_addr,
            http_task,
            socks_task,
        });

        tracing::info!("HTTP proxy on {}, SOCKS5 proxy on {}", http_addr, socks_addr);
        self.emit(true, MSG_STARTED.to_string());
        Ok(())
    }

    /// Closes every tracked connection and both listeners. Safe to call when
    /// already stopped.
    pub async fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.http_task.abort();
            run.socks_task.abort();
            // Joining guarantees the listeners are dropped and their ports released.
            let _ = run.http_task.await;
            let _ = run.socks_task.await;
            tracing::info!("Relay listeners closed");
        }

        // Listeners are gone first so nothing new gets tracked after this.
        // Every connection socket is closed once close_all returns.
        let closed = self.registry.close_all().await;
        if closed > 0 {
            tracing::info!("{} active connections closed", closed);
        }

        self.emit(false, MSG_STOPPED.to_string());
    }

    /// Binds both listeners and resolves the addresses they ended up on.
    async fn bind(&self) -> Result<(TcpListener, SocketAddr, TcpListener, SocketAddr)> {
        let http = bind_local(self.options.http_port).await?;
        let http_addr = http.local_addr()?;
        let socks = bind_local(self.options.socks_port).await?;
        let socks_addr = socks.local_addr()?;
        Ok((http, http_addr, socks, socks_addr))
    }

    fn emit(&mut self, running: bool, message: String) {
        if let Some(observer) = &self.observer {
            observer.on_status_changed(running, &message);
        }
        self.message = message;
    }
}

async fn bind_local(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::BindFailure { addr, source })
}
