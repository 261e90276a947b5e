//! Integration tests for the layer-7 terminator and the WebSocket
//! fault catalog.
//!
//! Each test stands up a WebSocket upstream fixture on an ephemeral
//! port, instantiates a fault from the catalog against it and drives a
//! real client through the proxy.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async};

use faultline::fault::{catalog, FaultSimulation};
use faultline::protocol::{decode_message, MessageAction};
use faultline::{ProxySettings, RealtimeProxy};

/// WebSocket upstream fixture: records every data frame, optionally
/// greets new sessions with a frame, echoes when asked to.
struct WsUpstream {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
    request_uris: Arc<Mutex<Vec<String>>>,
}

impl WsUpstream {
    async fn start(echo: bool, greeting: Option<Message>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ws upstream");
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let request_uris = Arc::new(Mutex::new(Vec::new()));

        let received_sink = Arc::clone(&received);
        let uri_sink = Arc::clone(&request_uris);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let received = Arc::clone(&received_sink);
                let uris = Arc::clone(&uri_sink);
                let greeting = greeting.clone();
                tokio::spawn(async move {
                    let callback = |req: &UpgradeRequest, resp: UpgradeResponse| {
                        uris.lock().unwrap().push(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();

                    if let Some(frame) = greeting {
                        if write.send(frame).await.is_err() {
                            return;
                        }
                    }

                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                received.lock().unwrap().push(msg.clone());
                                if echo && write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Message::Ping(data) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Message::Close(_) => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            request_uris,
        }
    }

    fn received_actions(&self) -> Vec<MessageAction> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| decode_message(msg).ok())
            .map(|decoded| decoded.action)
            .collect()
    }
}

fn simulate(name: &str, upstream: SocketAddr) -> Arc<dyn FaultSimulation> {
    let faults = catalog();
    let fault = faults
        .iter()
        .find(|fault| fault.name == name)
        .unwrap_or_else(|| panic!("{} not in catalog", name));
    fault
        .simulate(
            format!("test-{}", name),
            ProxySettings {
                listen_host: "127.0.0.1".to_string(),
                listen_port: 0,
                target_host: "127.0.0.1".to_string(),
                target_port: upstream.port(),
                target_tls: false,
            },
        )
        .expect("simulate")
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn attach_frame() -> Message {
    Message::Text(r#"{"action":10,"channel":"room"}"#.to_string())
}

fn heartbeat_frame() -> Message {
    Message::Text(r#"{"action":0}"#.to_string())
}

fn enter_frame() -> Message {
    Message::Text(
        r#"{"action":14,"channel":"room","msgSerial":1,"presence":[{"action":2}]}"#.to_string(),
    )
}

#[tokio::test]
async fn test_null_application_layer_is_transparent() {
    let upstream = WsUpstream::start(true, None).await;
    let sim = simulate("NullApplicationLayerFault", upstream.addr);
    sim.proxy().start().await.unwrap();
    sim.enable().await.unwrap();

    let url = format!(
        "ws://127.0.0.1:{}/?clientId=c1&v=3",
        sim.proxy().listen_port()
    );
    let (mut client, _) = connect_async(&url).await.expect("connect through proxy");

    // Frames pass through in order and come back from the echo.
    for i in 0..5 {
        let frame = Message::Text(format!(r#"{{"action":0,"id":"{}"}}"#, i));
        client.send(frame).await.unwrap();
    }
    for i in 0..5 {
        let echoed = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("echo should arrive")
            .expect("stream open")
            .expect("frame ok");
        let text = echoed.into_text().unwrap();
        assert!(
            text.contains(&format!("\"id\":\"{}\"", i)),
            "frames must stay in order: got {} at position {}",
            text,
            i
        );
    }

    // The handshake query reached the upstream unchanged.
    wait_until(
        || !upstream.request_uris.lock().unwrap().is_empty(),
        "upstream handshake",
    )
    .await;
    let uri = upstream.request_uris.lock().unwrap()[0].clone();
    assert!(uri.contains("clientId=c1&v=3"), "query order preserved: {uri}");

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_attach_unresponsive_swallows_attach_only() {
    let upstream = WsUpstream::start(false, None).await;
    let sim = simulate("AttachUnresponsive", upstream.addr);
    sim.proxy().start().await.unwrap();
    sim.enable().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/", sim.proxy().listen_port());
    let (mut client, _) = connect_async(&url).await.unwrap();

    client.send(attach_frame()).await.unwrap();
    client.send(heartbeat_frame()).await.unwrap();

    wait_until(
        || !upstream.received.lock().unwrap().is_empty(),
        "heartbeat to reach upstream",
    )
    .await;

    let actions = upstream.received_actions();
    assert_eq!(
        actions,
        vec![MessageAction::Heartbeat],
        "upstream sees the heartbeat but never the ATTACH"
    );

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_attach_unresponsive_resolve_restores_forwarding() {
    let upstream = WsUpstream::start(false, None).await;
    let sim = simulate("AttachUnresponsive", upstream.addr);
    sim.proxy().start().await.unwrap();
    sim.enable().await.unwrap();
    sim.resolve().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/", sim.proxy().listen_port());
    let (mut client, _) = connect_async(&url).await.unwrap();

    client.send(attach_frame()).await.unwrap();
    wait_until(
        || !upstream.received.lock().unwrap().is_empty(),
        "attach to reach upstream after resolve",
    )
    .await;
    assert_eq!(upstream.received_actions(), vec![MessageAction::Attach]);

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_enter_failed_nack_answers_client_and_hides_enter() {
    let upstream = WsUpstream::start(true, None).await;
    let sim = simulate("EnterFailedWithNonfatalNack", upstream.addr);
    sim.proxy().start().await.unwrap();
    sim.enable().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/", sim.proxy().listen_port());
    let (mut client, _) = connect_async(&url).await.unwrap();

    client.send(enter_frame()).await.unwrap();

    let nack = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("NACK should arrive")
        .expect("stream open")
        .expect("frame ok");
    let decoded = decode_message(&nack).expect("NACK decodes");
    assert_eq!(decoded.action, MessageAction::Nack);
    assert_eq!(decoded.msg_serial, Some(1), "NACK answers the ENTER serial");

    let text = nack.into_text().unwrap();
    assert!(
        text.contains("\"code\":40000"),
        "error code is in the non-fatal band: {text}"
    );

    // A follow-up heartbeat is echoed back, so exactly one NACK was
    // fabricated and the session is still healthy.
    client.send(heartbeat_frame()).await.unwrap();
    let next = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("echo should arrive")
        .expect("stream open")
        .expect("frame ok");
    assert_eq!(
        decode_message(&next).unwrap().action,
        MessageAction::Heartbeat
    );

    // The upstream never observed the ENTER.
    assert_eq!(upstream.received_actions(), vec![MessageAction::Heartbeat]);

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_and_suspend_closes_and_rejects() {
    let upstream = WsUpstream::start(true, None).await;
    let sim = simulate("DisconnectAndSuspend", upstream.addr);
    sim.proxy().start().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/", sim.proxy().listen_port());
    let (mut client, _) = connect_async(&url).await.expect("connect before enable");

    sim.enable().await.unwrap();

    // The client-side WebSocket is closed.
    let observed_close = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(observed_close.is_ok(), "client session must be closed");

    // New upgrades are rejected for the suspension window.
    assert!(
        connect_async(&url).await.is_err(),
        "upgrades must be rejected while suspended"
    );

    // Resolve allows connects again.
    sim.resolve().await.unwrap();
    assert!(
        connect_async(&url).await.is_ok(),
        "upgrades must succeed after resolve"
    );

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_with_failed_resume_strips_resume_on_reconnect() {
    let connected = Message::Text(r#"{"action":4,"connectionId":"c0"}"#.to_string());
    let upstream = WsUpstream::start(true, Some(connected)).await;
    let sim = simulate("DisconnectWithFailedResume", upstream.addr);
    sim.proxy().start().await.unwrap();
    sim.enable().await.unwrap();

    let base = format!("ws://127.0.0.1:{}/", sim.proxy().listen_port());

    // First connect: the greeting CONNECTED is intercepted, the
    // upstream session is closed and the client observes a disconnect.
    let (mut client, _) = connect_async(&base).await.unwrap();
    let disconnected = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(frame)) => {
                    let decoded = decode_message(&frame);
                    assert!(
                        !matches!(decoded.map(|d| d.action), Ok(MessageAction::Connected)),
                        "the CONNECTED that triggered the fault must not reach the client"
                    );
                }
            }
        }
    })
    .await;
    assert!(disconnected.is_ok(), "client must observe the disconnect");

    // Reconnect with a resume token, the way an SDK would.
    let resume_url = format!("{}?clientId=c1&resume=prior-session", base);
    let (mut client, _) = connect_async(&resume_url).await.unwrap();

    // This time the CONNECTED passes through: the session is fresh.
    let frame = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("greeting should arrive")
        .expect("stream open")
        .expect("frame ok");
    assert_eq!(
        decode_message(&frame).unwrap().action,
        MessageAction::Connected
    );

    // The upstream saw the reconnect without the resume parameter.
    let uris = upstream.request_uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2, "two upstream sessions were opened");
    assert!(
        !uris[1].contains("resume"),
        "resume must be stripped from the reconnect: {}",
        uris[1]
    );
    assert!(
        uris[1].contains("clientId=c1"),
        "other parameters are forwarded: {}",
        uris[1]
    );

    sim.clean_up().await.unwrap();
}

#[tokio::test]
async fn test_clean_up_closes_listener_and_sessions() {
    let upstream = WsUpstream::start(true, None).await;
    let sim = simulate("NullApplicationLayerFault", upstream.addr);
    sim.proxy().start().await.unwrap();
    let port = sim.proxy().listen_port();

    let url = format!("ws://127.0.0.1:{}/", port);
    let (mut client, _) = connect_async(&url).await.unwrap();

    sim.clean_up().await.unwrap();
    sim.clean_up().await.unwrap();

    // The open session dies...
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "open sessions must be torn down");

    // ...and the listener is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "listener must be closed after clean_up"
    );
}
