use carrier_relay::controller::MSG_STARTED;
use carrier_relay::http::{BAD_GATEWAY, CONNECT_ESTABLISHED};
use carrier_relay::{selftest, ProxyConfig, RelayController, RelayOptions};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Reads a request head (through the blank line) from `sock`.
async fn read_head(sock: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if sock.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    head
}

/// Upstream HTTP proxy that accepts CONNECT with `status_line` and then
/// echoes tunneled bytes back.
async fn connect_upstream(status_line: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let head = read_head(&mut sock).await;
        sock.get_mut()
            .write_all(format!("{status_line}\r\nProxy-Agent: test\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        loop {
            let n = sock.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            sock.get_mut().write_all(&buf[..n]).await.unwrap();
        }
        head
    });
    (port, task)
}

async fn started(upstream_http: u16, upstream_socks: u16) -> RelayController {
    let mut controller = RelayController::new(RelayOptions {
        http_port: 0,
        socks_port: 0,
        connect_timeout: Duration::from_secs(2),
        relay_timeout: None,
    });
    controller
        .start(ProxyConfig::new("127.0.0.1", upstream_http, upstream_socks, "u", "p"))
        .await
        .unwrap();
    controller
}

fn http_addr(controller: &RelayController) -> SocketAddr {
    controller.status().http_addr.unwrap()
}

async fn wait_for_connections(controller: &RelayController, expected: usize) {
    for _ in 0..400 {
        if controller.status().active_connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "active connections stuck at {}, expected {}",
        controller.status().active_connections,
        expected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_tunnel_relays_both_ways() {
    let (port, upstream) = connect_upstream("HTTP/1.1 200 Connection established").await;
    let mut controller = started(port, 1).await;

    let mut client = TcpStream::connect(http_addr(&controller)).await.unwrap();
    client
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
        .await
        .unwrap();

    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECT_ESTABLISHED);

    client.write_all(b"\x16\x03\x01opaque").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"\x16\x03\x01opaque");
    wait_for_connections(&controller, 1).await;

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    wait_for_connections(&controller, 0).await;

    let head = upstream.await.unwrap();
    assert!(head.starts_with("CONNECT example.org:443 HTTP/1.1\r\n"));
    assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_rejected_by_upstream_gets_502() {
    let (port, _upstream) = connect_upstream("HTTP/1.1 403 Forbidden").await;
    let mut controller = started(port, 1).await;

    let mut client = TcpStream::connect(http_addr(&controller)).await.unwrap();
    client
        .write_all(b"CONNECT blocked.example:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, BAD_GATEWAY);
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_request_round_trips_through_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
    let upstream = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let head = read_head(&mut sock).await;
        sock.get_mut().write_all(body).await.unwrap();
        head
    });

    let mut controller = started(port, 1).await;
    let mut client = TcpStream::connect(http_addr(&controller)).await.unwrap();
    client
        .write_all(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, body);

    assert_eq!(
        upstream.await.unwrap(),
        "GET http://example.org/ HTTP/1.1\r\nProxy-Authorization: Basic dTpw\r\nHost: example.org\r\n\r\n"
    );
    wait_for_connections(&controller, 0).await;
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_body_is_forwarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let upstream = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let _head = read_head(&mut sock).await;
        let mut body = [0u8; 7];
        sock.read_exact(&mut body).await.unwrap();
        sock.get_mut()
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        body
    });

    let mut controller = started(port, 1).await;
    let mut client = TcpStream::connect(http_addr(&controller)).await.unwrap();
    client
        .write_all(b"POST http://example.org/form HTTP/1.1\r\nHost: example.org\r\nContent-Length: 7\r\n\r\na=1&b=2")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 201 Created\r\n"));
    assert_eq!(&upstream.await.unwrap(), b"a=1&b=2");
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks_listener_authenticates_then_tunnels() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        sock.read_exact(&mut greeting).await.unwrap();
        sock.write_all(&[0x05, 0x02]).await.unwrap();
        let mut auth = [0u8; 5];
        sock.read_exact(&mut auth).await.unwrap();
        sock.write_all(&[0x01, 0x00]).await.unwrap();

        // The client's own greeting arrives tunneled; accept "no auth".
        let mut client_greeting = [0u8; 3];
        sock.read_exact(&mut client_greeting).await.unwrap();
        assert_eq!(client_greeting, [0x05, 0x01, 0x00]);
        sock.write_all(&[0x05, 0x00]).await.unwrap();
    });

    let mut controller = started(1, port).await;
    let socks_addr = controller.status().socks_addr.unwrap();
    let mut client = TcpStream::connect(socks_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_on_same_ports_tears_down_first_run() {
    // Reserve two distinct free ports, then release them for the relay.
    let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (http_port, socks_port) = (a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
    drop((a, b));
    let options = RelayOptions {
        http_port,
        socks_port,
        connect_timeout: Duration::from_secs(2),
        relay_timeout: None,
    };

    let mut controller = RelayController::new(options);
    let config = ProxyConfig::new("127.0.0.1", 1, 1, "u", "p");
    controller.start(config.clone()).await.unwrap();
    let first_addr = http_addr(&controller);

    let mut lingering = TcpStream::connect(first_addr).await.unwrap();
    lingering.write_all(b"GET http://slow").await.unwrap();
    wait_for_connections(&controller, 1).await;

    let second = ProxyConfig::new("127.0.0.2", 2, 2, "v", "q");
    controller.start(second.clone()).await.unwrap();
    let status = controller.status();
    assert!(status.running);
    assert_eq!(status.message, MSG_STARTED);
    assert_eq!(status.active_connections, 0);
    assert_eq!(status.http_addr, Some(first_addr));
    assert_eq!(controller.config(), Some(&second));

    let mut buf = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), lingering.read_to_end(&mut buf)).await;
    assert!(closed.is_ok(), "connection from the first run survived the restart");
    controller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_test_reports_upstream_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let upstream = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let head = read_head(&mut sock).await;
        sock.get_mut()
            .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        head
    });

    let mut controller = started(port, 1).await;
    let status = selftest::check_through_proxy(
        http_addr(&controller),
        "http://health.example/health",
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(status, 204);

    let head = upstream.await.unwrap();
    assert!(head.starts_with("GET http://health.example/health HTTP/1.1\r\n"));
    assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    controller.stop().await;
}
