//! Layer-7 proxy: terminates the WebSocket on both sides.
//!
//! Every client upgrade is answered locally; a second WebSocket is
//! opened to the upstream service and frames are shuttled through the
//! installed [`Interceptor`] in both directions. Fault code can swap the
//! interceptor at any time, reject new upgrades, or close all client
//! sessions without stopping the listener.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async};
use tracing::{debug, info};

use crate::proxy::interceptor::{Direction, Interceptor, PassThroughInterceptor};
use crate::proxy::params::ConnectionParams;
use crate::proxy::{ProxyError, ProxySettings, RealtimeProxy};

type InterceptorSlot = Arc<StdRwLock<Arc<dyn Interceptor>>>;

struct Listening {
    acceptor: JoinHandle<()>,
}

/// WebSocket terminating proxy with a pluggable interceptor.
pub struct WebSocketTerminator {
    settings: ProxySettings,
    interceptor: InterceptorSlot,
    reject_connections: Arc<AtomicBool>,
    close_all: broadcast::Sender<()>,
    bound_port: AtomicU16,
    inner: Mutex<Option<Listening>>,
    connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl WebSocketTerminator {
    pub fn new(settings: ProxySettings) -> Self {
        let (close_all, _) = broadcast::channel(4);
        Self {
            settings,
            interceptor: Arc::new(StdRwLock::new(Arc::new(PassThroughInterceptor))),
            reject_connections: Arc::new(AtomicBool::new(false)),
            close_all,
            bound_port: AtomicU16::new(0),
            inner: Mutex::new(None),
            connections: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Swap the interceptor. Frames already in flight keep the
    /// interceptor they were dispatched with; the next frame sees the
    /// new one.
    pub fn set_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        let mut slot = self.interceptor.write().unwrap_or_else(|e| e.into_inner());
        *slot = interceptor;
    }

    /// While set, new client connections are dropped before the
    /// WebSocket handshake.
    pub fn set_reject_connections(&self, reject: bool) {
        self.reject_connections.store(reject, Ordering::Relaxed);
        debug!(reject, "terminator upgrade gate flipped");
    }

    pub fn is_rejecting_connections(&self) -> bool {
        self.reject_connections.load(Ordering::Relaxed)
    }

    /// Gracefully close the client side of every open session. The
    /// listener keeps running.
    pub fn close_client_sessions(&self) {
        let receivers = self.close_all.send(()).unwrap_or(0);
        debug!(sessions = receivers, "closing client sessions");
    }

    async fn handle_session(
        stream: TcpStream,
        settings: ProxySettings,
        interceptor: InterceptorSlot,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let mut request_uri: Option<Uri> = None;
        let callback = |req: &UpgradeRequest, resp: UpgradeResponse| {
            request_uri = Some(req.uri().clone());
            Ok(resp)
        };

        let client_ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(error = %e, "client WebSocket handshake failed");
                return;
            }
        };

        let (path, query) = match &request_uri {
            Some(uri) => (uri.path().to_string(), uri.query().unwrap_or("").to_string()),
            None => ("/".to_string(), String::new()),
        };

        let params = ConnectionParams::from_query(&query);
        let current = current_interceptor(&interceptor);
        let params = current.intercept_connection(params).await;

        let scheme = if settings.target_tls { "wss" } else { "ws" };
        let rewritten = params.to_query();
        let upstream_url = if rewritten.is_empty() {
            format!(
                "{}://{}:{}{}",
                scheme, settings.target_host, settings.target_port, path
            )
        } else {
            format!(
                "{}://{}:{}{}?{}",
                scheme, settings.target_host, settings.target_port, path, rewritten
            )
        };

        let (upstream_ws, _response) = match connect_async(&upstream_url).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(upstream_url = %upstream_url, error = %e, "upstream WebSocket connect failed");
                return;
            }
        };

        debug!(upstream_url = %upstream_url, "session established");

        let (client_sink, client_stream) = client_ws.split();
        let (server_sink, server_stream) = upstream_ws.split();
        let client_sink = Arc::new(Mutex::new(client_sink));
        let server_sink = Arc::new(Mutex::new(server_sink));

        let client_to_server = pump_frames(
            Direction::ClientToServer,
            client_stream,
            Arc::clone(&client_sink),
            Arc::clone(&server_sink),
            Arc::clone(&interceptor),
        );
        let server_to_client = pump_frames(
            Direction::ServerToClient,
            server_stream,
            Arc::clone(&client_sink),
            Arc::clone(&server_sink),
            Arc::clone(&interceptor),
        );

        // Either direction ending (or a close-all signal) tears the
        // whole session down; dropping the pumps closes the sockets.
        tokio::select! {
            _ = client_to_server => {}
            _ = server_to_client => {}
            _ = close_rx.recv() => {
                debug!("closing client session on fault signal");
                // A pump paused mid-send may still hold the sink; fall
                // back to the plain socket teardown below if so.
                if let Ok(mut client) = client_sink.try_lock() {
                    let _ = client.send(Message::Close(None)).await;
                }
            }
        }
        debug!("session closed");
    }
}

#[async_trait]
impl RealtimeProxy for WebSocketTerminator {
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
            "WebSocket terminator listening"
        );

        let settings = self.settings.clone();
        let interceptor = Arc::clone(&self.interceptor);
        let reject = Arc::clone(&self.reject_connections);
        let close_all = self.close_all.clone();
        let connections = Arc::clone(&self.connections);

        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if reject.load(Ordering::Relaxed) {
                            debug!(peer_addr = %peer_addr, "dropping connection during reject window");
                            drop(stream);
                            continue;
                        }
                        debug!(peer_addr = %peer_addr, "terminator accepted connection");
                        let handle = tokio::spawn(Self::handle_session(
                            stream,
                            settings.clone(),
                            Arc::clone(&interceptor),
                            close_all.subscribe(),
                        ));
                        let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                        connections.retain(|handle| !handle.is_finished());
                        connections.push(handle);
                    }
                    Err(e) => {
                        debug!(error = %e, "terminator accept failed");
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
        debug!(closed = handles.len(), "WebSocket terminator stopped");
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

fn current_interceptor(slot: &InterceptorSlot) -> Arc<dyn Interceptor> {
    let guard = slot.read().unwrap_or_else(|e| e.into_inner());
    Arc::clone(&guard)
}

/// Forward frames from `source` through the interceptor, emitting each
/// returned action on the session its direction denotes.
async fn pump_frames<Src, CSink, SSink>(
    direction: Direction,
    mut source: Src,
    client_sink: Arc<Mutex<CSink>>,
    server_sink: Arc<Mutex<SSink>>,
    interceptor: InterceptorSlot,
) where
    Src: Stream<Item = Result<Message, WsError>> + Unpin,
    CSink: Sink<Message, Error = WsError> + Unpin,
    SSink: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(next) = source.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%direction, error = %e, "session read failed");
                break;
            }
        };

        let current = current_interceptor(&interceptor);
        let actions = current.intercept_frame(direction, frame).await;

        for action in actions {
            let result = match action.direction {
                Direction::ClientToServer => {
                    let mut sink = server_sink.lock().await;
                    emit(&mut *sink, action.frame, action.send_and_close).await
                }
                Direction::ServerToClient => {
                    let mut sink = client_sink.lock().await;
                    emit(&mut *sink, action.frame, action.send_and_close).await
                }
            };
            if let Err(e) = result {
                debug!(%direction, error = %e, "session write failed");
                return;
            }
        }
    }
}

async fn emit<S>(sink: &mut S, frame: Message, close_after: bool) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(frame).await?;
    if close_after {
        // Graceful close right after the frame; a close error here just
        // means the peer beat us to it.
        if let Err(e) = sink.close().await {
            debug!(error = %e, "session close after send failed");
        }
    }
    Ok(())
}
