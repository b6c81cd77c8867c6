// Connection test through the local HTTP listener
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// Fetches `url` with the relay's HTTP listener as proxy and returns the
/// status code the upstream produced.
pub async fn check_through_proxy(proxy_addr: SocketAddr, url: &str, timeout: Duration) -> Result<u16> {
    let proxy_url = format!("http://{}", proxy_addr);
    tracing::debug!("Testing {} through {}", url, proxy_url);

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(&proxy_url).map_err(|e| anyhow::anyhow!("Proxy error: {}", e))?)
        .timeout(timeout)
        .build()?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Request through {} failed: {}", proxy_url, e))?;

    Ok(response.status().as_u16())
}
