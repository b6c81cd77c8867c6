// SOCKS5 listener: authenticates upstream, then tunnels the client's own
// SOCKS5 exchange through untouched
use crate::listener::RelayContext;
use crate::tunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

pub(crate) async fn handle(client: TcpStream, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let upstream = match ctx.connector.connect_socks().await {
        Ok(upstream) => upstream,
        Err(e) => {
            // No SOCKS reply: the client simply sees the connection close.
            tracing::warn!(kind = e.kind(), "SOCKS5 upstream for {} failed: {}", peer, e);
            return;
        }
    };

    tracing::debug!("SOCKS5 session open for {}", peer);
    let stats = tunnel::relay(client, upstream, ctx.relay_timeout).await;
    tracing::debug!(
        "SOCKS5 session for {} closed ({} bytes up, {} bytes down)",
        peer,
        stats.a_to_b,
        stats.b_to_a
    );
}
