//! Layer-4 tunnel: forwards a TLS byte stream verbatim.
//!
//! The tunnel accepts loopback TCP, opens a TLS connection to the
//! upstream realtime service and pipes bytes in both directions. The
//! only payload modification it ever makes is rewriting the HTTP `Host`
//! header once, in the first client buffer, so the WebSocket upgrade
//! addresses the real upstream. A forwarding gate lets fault code
//! black-hole traffic while keeping sockets open.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::proxy::{ProxyError, ProxySettings, RealtimeProxy};
use crate::tls::UpstreamTls;

/// Forwarding buffer size. The gate is consulted once per buffer, so
/// this also bounds how much data may slip through around a flag flip.
const BUFFER_SIZE: usize = 4096;

struct Listening {
    acceptor: JoinHandle<()>,
}

/// Raw TCP proxy with a forwarding gate.
pub struct TcpTunnel {
    settings: ProxySettings,
    forwarding: Arc<AtomicBool>,
    connector: Option<TlsConnector>,
    // Remembered after the first bind so a stop/start cycle reuses the
    // same port even when configured with port 0.
    bound_port: AtomicU16,
    inner: Mutex<Option<Listening>>,
    connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl TcpTunnel {
    pub fn new(settings: ProxySettings) -> Result<Self, ProxyError> {
        let connector = if settings.target_tls {
            Some(UpstreamTls::new()?.connector())
        } else {
            None
        };

        Ok(Self {
            settings,
            forwarding: Arc::new(AtomicBool::new(true)),
            connector,
            bound_port: AtomicU16::new(0),
            inner: Mutex::new(None),
            connections: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    /// The forwarding gate. While false, bytes read in either direction
    /// are dropped; flipping it back resumes from the next buffer.
    pub fn set_forwarding(&self, forwarding: bool) {
        self.forwarding.store(forwarding, Ordering::Relaxed);
        debug!(forwarding, "tunnel forwarding gate flipped");
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Relaxed)
    }

    async fn handle_connection(
        client: TcpStream,
        settings: ProxySettings,
        connector: Option<TlsConnector>,
        forwarding: Arc<AtomicBool>,
    ) {
        let upstream_addr = settings.target_addr();
        let upstream = match TcpStream::connect(&upstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(upstream_addr = %upstream_addr, error = %e, "upstream connect failed");
                return;
            }
        };

        match connector {
            Some(connector) => {
                let server_name = match UpstreamTls::server_name(&settings.target_host) {
                    Ok(name) => name,
                    Err(e) => {
                        debug!(target_host = %settings.target_host, error = %e, "invalid SNI name");
                        return;
                    }
                };
                let tls = match connector.connect(server_name, upstream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(upstream_addr = %upstream_addr, error = %e, "upstream TLS handshake failed");
                        return;
                    }
                };
                let (upstream_read, upstream_write) = tokio::io::split(tls);
                Self::run_pumps(client, upstream_read, upstream_write, settings, forwarding).await;
            }
            None => {
                let (upstream_read, upstream_write) = upstream.into_split();
                Self::run_pumps(client, upstream_read, upstream_write, settings, forwarding).await;
            }
        }
    }

    async fn run_pumps<R, W>(
        client: TcpStream,
        upstream_read: R,
        upstream_write: W,
        settings: ProxySettings,
        forwarding: Arc<AtomicBool>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (client_read, client_write) = client.into_split();

        let client_to_server = pump(
            client_read,
            upstream_write,
            Arc::clone(&forwarding),
            Some(settings.target_host.clone()),
        );
        let server_to_client = pump(upstream_read, client_write, forwarding, None);

        // Either side ending drops the other pump, closing both sockets.
        tokio::select! {
            _ = client_to_server => {}
            _ = server_to_client => {}
        }
        debug!("tunnel connection closed");
    }
}

#[async_trait]
impl RealtimeProxy for TcpTunnel {
    async fn start(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let port = match self.bound_port.load(Ordering::Relaxed) {
            0 => self.settings.listen_port,
            port => port,
        };
        let addr = self.settings.listen_addr(port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_port = listener.local_addr()?.port();
        self.bound_port.store(local_port, Ordering::Relaxed);

        info!(
            listen_addr = %addr,
            listen_port = local_port,
            target_addr = %self.settings.target_addr(),
            "TCP tunnel listening"
        );

        let settings = self.settings.clone();
        let connector = self.connector.clone();
        let forwarding = Arc::clone(&self.forwarding);
        let connections = Arc::clone(&self.connections);

        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((client, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "tunnel accepted connection");
                        let handle = tokio::spawn(Self::handle_connection(
                            client,
                            settings.clone(),
                            connector.clone(),
                            Arc::clone(&forwarding),
                        ));
                        let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                        connections.retain(|handle| !handle.is_finished());
                        connections.push(handle);
                    }
                    Err(e) => {
                        debug!(error = %e, "tunnel accept failed");
                    }
                }
            }
        });

        *inner = Some(Listening { acceptor });
        Ok(())
    }

    async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(listening) = inner.take() {
            // Aborting the acceptor drops the listener; awaiting it
            // guarantees connects are refused once stop returns.
            listening.acceptor.abort();
            let _ = listening.acceptor.await;
        }
        let handles: Vec<_> = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.drain(..).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        debug!(closed = handles.len(), "TCP tunnel stopped");
    }

    fn listen_host(&self) -> &str {
        &self.settings.listen_host
    }

    fn listen_port(&self) -> u16 {
        match self.bound_port.load(Ordering::Relaxed) {
            0 => self.settings.listen_port,
            port => port,
        }
    }
}

/// Pump bytes from `src` to `dst` one buffer at a time.
///
/// `rewrite` carries the target host until the first forwarded buffer of
/// the client->server direction has had its `Host` header patched.
async fn pump<R, W>(mut src: R, mut dst: W, forwarding: Arc<AtomicBool>, mut rewrite: Option<String>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "tunnel read failed");
                break;
            }
        };

        // Black-holed: the read still advanced the source.
        if !forwarding.load(Ordering::Relaxed) {
            continue;
        }

        let write_result = match rewrite.take() {
            Some(host) => match rewrite_host_header(&buf[..n], &host) {
                Some(patched) => dst.write_all(&patched).await,
                None => dst.write_all(&buf[..n]).await,
            },
            None => dst.write_all(&buf[..n]).await,
        };

        if let Err(e) = write_result {
            debug!(error = %e, "tunnel write failed");
            break;
        }
    }
}

/// Replace the first `Host: ...\r\n` header line with the target host.
///
/// Returns `None` when no complete header line is present, in which case
/// the buffer is forwarded untouched.
fn rewrite_host_header(buf: &[u8], target_host: &str) -> Option<Vec<u8>> {
    const NEEDLE: &[u8] = b"Host: ";

    let mut i = 0;
    while i + NEEDLE.len() <= buf.len() {
        let at_line_start = i == 0 || (i >= 2 && &buf[i - 2..i] == b"\r\n");
        if at_line_start && buf[i..].starts_with(NEEDLE) {
            let line_end = find_subslice(&buf[i..], b"\r\n")?;
            let mut patched = Vec::with_capacity(buf.len() + target_host.len());
            patched.extend_from_slice(&buf[..i]);
            patched.extend_from_slice(NEEDLE);
            patched.extend_from_slice(target_host.as_bytes());
            patched.extend_from_slice(b"\r\n");
            patched.extend_from_slice(&buf[i + line_end + 2..]);
            return Some(patched);
        }
        i += 1;
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /?v=3 HTTP/1.1\r\nHost: 127.0.0.1:13579\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

    #[test]
    fn test_host_rewrite_replaces_exactly_one_header() {
        let patched = rewrite_host_header(UPGRADE, "realtime.ably.io").expect("should rewrite");
        let text = String::from_utf8(patched).unwrap();

        assert_eq!(text.matches("Host: ").count(), 1);
        assert!(text.contains("Host: realtime.ably.io\r\n"));
        assert!(!text.contains("13579"));
    }

    #[test]
    fn test_host_rewrite_leaves_other_bytes_alone() {
        let patched = rewrite_host_header(UPGRADE, "realtime.ably.io").expect("should rewrite");
        let text = String::from_utf8(patched).unwrap();

        assert!(text.starts_with("GET /?v=3 HTTP/1.1\r\n"));
        assert!(text.ends_with("Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n"));
    }

    #[test]
    fn test_host_rewrite_requires_line_start() {
        // "Host: " appearing inside another header value is not a match.
        let request = b"GET / HTTP/1.1\r\nX-Note: Host: fake\r\n\r\n";
        assert!(rewrite_host_header(request, "example.com").is_none());
    }

    #[test]
    fn test_host_rewrite_without_host_header() {
        let request = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        assert!(rewrite_host_header(request, "example.com").is_none());
    }

    #[test]
    fn test_host_rewrite_non_http_bytes() {
        assert!(rewrite_host_header(&[0x16, 0x03, 0x01, 0x00], "example.com").is_none());
    }

    #[test]
    fn test_host_header_first_line() {
        // Degenerate but valid per the matcher: header at offset zero.
        let patched = rewrite_host_header(b"Host: a\r\n\r\n", "b").expect("should rewrite");
        assert_eq!(patched, b"Host: b\r\n\r\n");
    }
}
