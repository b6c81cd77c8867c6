// HTTP proxy listener: CONNECT tunnels and plain request forwarding
use crate::error::{RelayError, Result};
use crate::listener::RelayContext;
use crate::tunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const DEFAULT_CONNECT_PORT: u16 = 443;
const MAX_LINE: u64 = 16 * 1024;
const FIRST_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: Option<String>,
}

impl RequestLine {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(method), Some(target)) => Ok(RequestLine {
                method: method.to_string(),
                target: target.to_string(),
                version: parts.next().map(str::to_string),
            }),
            _ => Err(RelayError::MalformedRequest(format!(
                "request line has fewer than 2 tokens: {:?}",
                line
            ))),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let mut client = BufReader::new(stream);

    let line = match read_line(&mut client).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            tracing::debug!("Connection closed immediately by {}", peer);
            return;
        }
        Err(e) => {
            tracing::debug!("Unreadable request line from {}: {}", peer, e);
            return;
        }
    };

    let request = match RequestLine::parse(&line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Abandoning connection from {}: {}", peer, e);
            return;
        }
    };

    if request.is_connect() {
        handle_connect(client, &request.target, peer, &ctx).await;
    } else {
        handle_forward(client, &line, &request, peer, &ctx).await;
    }
}

async fn handle_connect(
    mut client: BufReader<TcpStream>,
    target: &str,
    peer: SocketAddr,
    ctx: &RelayContext,
) {
    let authority = connect_authority(target);
    tracing::debug!("CONNECT {} from {}", authority, peer);

    let upstream = match open_tunnel(&mut client, &authority, ctx).await {
        Ok(Some(upstream)) => upstream,
        Ok(None) => {
            let _ = client.get_mut().write_all(BAD_GATEWAY).await;
            return;
        }
        Err(e) => {
            tracing::warn!(kind = e.kind(), "CONNECT {} failed: {}", authority, e);
            let _ = client.get_mut().write_all(BAD_GATEWAY).await;
            return;
        }
    };

    if let Err(e) = client.get_mut().write_all(CONNECT_ESTABLISHED).await {
        tracing::debug!("Client {} left before tunnel start: {}", peer, e);
        return;
    }

    tracing::info!("Tunnel established to {} for {}", authority, peer);
    let stats = tunnel::relay(client, upstream, ctx.relay_timeout).await;
    tracing::debug!(
        "Tunnel to {} closed ({} bytes up, {} bytes down)",
        authority,
        stats.a_to_b,
        stats.b_to_a
    );
}

/// Sends CONNECT upstream. `Ok(None)` means the upstream answered with
/// something other than 200.
async fn open_tunnel(
    client: &mut BufReader<TcpStream>,
    authority: &str,
    ctx: &RelayContext,
) -> Result<Option<BufReader<TcpStream>>> {
    // Only the request line matters; the client's own headers are dropped.
    skip_headers(client).await?;

    let mut upstream = BufReader::new(ctx.connector.connect_http().await?);
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Authorization: {}\r\nConnection: Keep-Alive\r\n\r\n",
        ctx.connector.proxy_authorization()
    );
    upstream.get_mut().write_all(request.as_bytes()).await?;
    upstream.get_mut().flush().await?;

    let status = read_line(&mut upstream)
        .await?
        .ok_or_else(|| RelayError::RelayIo("upstream closed before answering CONNECT".to_string()))?;

    if !is_success_status(&status) {
        tracing::warn!("Upstream refused CONNECT {}: {}", authority, status);
        return Ok(None);
    }

    skip_headers(&mut upstream).await?;
    Ok(Some(upstream))
}

async fn handle_forward(
    mut client: BufReader<TcpStream>,
    line: &str,
    request: &RequestLine,
    peer: SocketAddr,
    ctx: &RelayContext,
) {
    tracing::debug!("HTTP request from {}: {} {}", peer, request.method, request.target);

    let mut responded = false;
    match forward(&mut client, line, ctx, &mut responded).await {
        Ok(bytes) => tracing::debug!("Response for {} relayed ({} bytes)", request.target, bytes),
        Err(e) => {
            tracing::warn!(kind = e.kind(), "Forwarding {} failed: {}", request.target, e);
            if !responded {
                let _ = client.get_mut().write_all(BAD_GATEWAY).await;
            }
        }
    }
}

/// Writes the request head upstream with credentials injected, then streams
/// the upstream response back untouched. Returns response bytes relayed.
async fn forward(
    client: &mut BufReader<TcpStream>,
    line: &str,
    ctx: &RelayContext,
    responded: &mut bool,
) -> Result<u64> {
    let mut head = String::with_capacity(512);
    head.push_str(line);
    head.push_str("\r\n");
    head.push_str("Proxy-Authorization: ");
    head.push_str(&ctx.connector.proxy_authorization());
    head.push_str("\r\n");

    let mut content_length = None;
    while let Some(header) = read_line(client).await? {
        if header.is_empty() {
            break;
        }
        if let Some(len) = content_length_of(&header) {
            content_length = Some(len);
        }
        head.push_str(&header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let upstream = ctx.connector.connect_http().await?;
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    upstream_write.write_all(head.as_bytes()).await?;
    if let Some(len) = content_length {
        tokio::io::copy(&mut (&mut *client).take(len), &mut upstream_write).await?;
    }
    upstream_write.flush().await?;

    // The first chunk decides whether a 502 can still be sent on failure.
    let mut first = vec![0u8; FIRST_CHUNK];
    let n = upstream_read.read(&mut first).await?;
    if n == 0 {
        return Ok(0);
    }
    *responded = true;
    client.get_mut().write_all(&first[..n]).await?;

    let rest = tokio::io::copy(&mut upstream_read, client.get_mut()).await?;
    client.get_mut().flush().await?;

    Ok(n as u64 + rest)
}

/// `host:port` for a CONNECT target, adding the HTTPS port when absent.
pub fn connect_authority(target: &str) -> String {
    let has_port = match target.strip_prefix('[') {
        Some(rest) => rest
            .split_once(']')
            .is_some_and(|(_, tail)| tail.starts_with(':')),
        None => target
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok()),
    };

    if has_port {
        target.to_string()
    } else {
        format!("{}:{}", target, DEFAULT_CONNECT_PORT)
    }
}

/// True for an `HTTP/1.x 200 ...` status line.
pub fn is_success_status(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/1.")
    )
}

fn content_length_of(header: &str) -> Option<u64> {
    let (name, value) = header.split_once(':')?;
    if name.trim().eq_ignore_ascii_case("content-length") {
        value.trim().parse().ok()
    } else {
        None
    }
}

/// Reads one line without its terminator. `Ok(None)` at EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(MAX_LINE).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n as u64 >= MAX_LINE {
            return Err(RelayError::MalformedRequest("line too long".to_string()));
        }
        return Err(RelayError::RelayIo("connection closed mid-line".to_string()));
    }

    let trimmed = line.trim_end_matches(&['\r', '\n'][..]).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

async fn skip_headers<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            return Ok(());
        }
    }
    Err(RelayError::RelayIo("connection closed inside header block".to_string()))
}
