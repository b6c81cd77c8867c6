// Connections to the upstream proxy
use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_SUBNEGOTIATION: u8 = 0x01;
const SOCKS5_AUTH_SUCCESS: u8 = 0x00;

/// Opens authenticated upstream sessions. One connector per relay run, shared
/// read-only by every handler.
#[derive(Debug)]
pub struct UpstreamConnector {
    config: ProxyConfig,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(config: ProxyConfig, connect_timeout: Duration) -> Self {
        UpstreamConnector {
            config,
            connect_timeout,
        }
    }

    /// Plain TCP connection to the upstream HTTP port. Credentials travel in
    /// the `Proxy-Authorization` header written by the caller.
    pub async fn connect_http(&self) -> Result<TcpStream> {
        self.connect(self.config.http_port).await
    }

    /// TCP connection to the upstream SOCKS port, already past the
    /// username/password negotiation.
    pub async fn connect_socks(&self) -> Result<TcpStream> {
        let mut stream = self.connect(self.config.socks_port).await?;

        match tokio::time::timeout(
            self.connect_timeout,
            socks5_authenticate(&mut stream, &self.config.username, &self.config.password),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(RelayError::UpstreamUnreachable {
                    host: self.config.host.clone(),
                    port: self.config.socks_port,
                    reason: format!(
                        "SOCKS5 negotiation timed out after {}s",
                        self.connect_timeout.as_secs()
                    ),
                })
            }
        }

        tracing::debug!(
            "SOCKS5 session authenticated with {}:{}",
            self.config.host,
            self.config.socks_port
        );
        Ok(stream)
    }

    /// Value of the `Proxy-Authorization` header for the configured account.
    pub fn proxy_authorization(&self) -> String {
        basic_auth_value(&self.config.username, &self.config.password)
    }

    async fn connect(&self, port: u16) -> Result<TcpStream> {
        let host = self.config.host.as_str();
        let unreachable = |reason: String| RelayError::UpstreamUnreachable {
            host: host.to_string(),
            port,
            reason,
        };

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "connect timed out after {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

pub fn basic_auth_value(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", token)
}

/// Client side of the SOCKS5 greeting plus RFC 1929 username/password
/// sub-negotiation. Leaves the stream positioned right after the server's
/// status reply.
pub async fn socks5_authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
        return Err(RelayError::UpstreamAuth(
            "username or password longer than 255 bytes".to_string(),
        ));
    }

    stream
        .write_all(&[SOCKS5_VERSION, 0x01, SOCKS5_AUTH_PASSWORD])
        .await?;
    stream.flush().await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS5_VERSION {
        return Err(RelayError::UpstreamAuth(format!(
            "unexpected SOCKS version {:#04x}",
            method[0]
        )));
    }
    if method[1] != SOCKS5_AUTH_PASSWORD {
        return Err(RelayError::UpstreamAuth(format!(
            "server selected method {:#04x} instead of username/password",
            method[1]
        )));
    }

    let mut auth = Vec::with_capacity(3 + username.len() + password.len());
    auth.push(SOCKS5_AUTH_SUBNEGOTIATION);
    auth.push(username.len() as u8);
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != SOCKS5_AUTH_SUCCESS {
        return Err(RelayError::UpstreamAuth(format!(
            "credentials rejected (status {:#04x})",
            status[1]
        )));
    }

    Ok(())
}
