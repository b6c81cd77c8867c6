// Accept loop shared by the HTTP and SOCKS5 listeners
use crate::registry::{ConnectionRegistry, Protocol};
use crate::upstream::UpstreamConnector;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Everything a connection handler needs for one relay run.
#[derive(Debug)]
pub struct RelayContext {
    pub connector: UpstreamConnector,
    pub registry: Arc<ConnectionRegistry>,
    pub relay_timeout: Option<Duration>,
}

/// Accepts until the listener fails hard or the owning task is aborted.
/// Every accepted socket is handed to `handler` on its own tracked task.
pub async fn accept_loop<H, Fut>(
    listener: TcpListener,
    protocol: Protocol,
    ctx: Arc<RelayContext>,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr, Arc<RelayContext>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let id = ctx.registry.spawn_tracked(
                    peer,
                    protocol,
                    handler(stream, peer, Arc::clone(&ctx)),
                );
                tracing::debug!("New {} connection #{} from {}", protocol, id, peer);
            }
            Err(e) if is_transient(&e) => {
                tracing::warn!("{} accept error, retrying: {}", protocol, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                tracing::error!("{} accept error: {}", protocol, e);
                break;
            }
        }
    }

    tracing::info!("{} accept loop finished", protocol);
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}
