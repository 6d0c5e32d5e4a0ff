//! Shared helpers: real hubs, real workers, raw WebSocket clients.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use quill_sync::{
    bind_shared, Bus, ClientMessage, DocumentStore, HubConfig, HubServer, RemoteBus, RemoteStore,
    ServerMessage, WorkerConfig, WorkerServer,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestHub {
    pub port: u16,
    pub server: Arc<HubServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestHub {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Stop the hub and close every link.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Start a hub over `store` on `port` (0 for any free port).
pub async fn start_hub(store: Arc<dyn DocumentStore>, port: u16) -> TestHub {
    let server = Arc::new(HubServer::new(HubConfig::default(), store));
    start_hub_server(server, port).await
}

pub async fn start_hub_server(server: Arc<HubServer>, port: u16) -> TestHub {
    let listener = bind_shared(&format!("127.0.0.1:{port}")).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel::<()>();

    let hub = server.clone();
    let task = tokio::spawn(async move {
        hub.serve_with_shutdown(listener, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    TestHub {
        port,
        server,
        shutdown: Some(tx),
        task,
    }
}

pub struct TestWorker {
    pub port: u16,
    pub server: Arc<WorkerServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestWorker {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn bus_connected(&self) -> bool {
        self.server.sessions().bus_connected()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Worker talking to the hub at `hub_url`.
pub async fn start_remote_worker(hub_url: &str) -> TestWorker {
    start_remote_worker_on(hub_url, 0).await
}

/// Worker talking to the hub at `hub_url`, listening on `port`.
pub async fn start_remote_worker_on(hub_url: &str, port: u16) -> TestWorker {
    let store = Arc::new(RemoteStore::with_timeout(hub_url, Duration::from_secs(1)));
    let bus = Arc::new(RemoteBus::with_timeout(hub_url, Duration::from_secs(1)));
    start_worker(store, bus, port).await
}

pub async fn start_worker(
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn Bus>,
    port: u16,
) -> TestWorker {
    let server = Arc::new(WorkerServer::new(WorkerConfig::for_testing(), store, bus));
    let listener = bind_shared(&format!("127.0.0.1:{port}")).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel::<()>();

    let worker = server.clone();
    let task = tokio::spawn(async move {
        worker
            .serve_with_shutdown(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestWorker {
        port,
        server,
        shutdown: Some(tx),
        task,
    }
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Connect and consume the initial snapshot.
pub async fn join(url: &str) -> (Ws, String) {
    let mut ws = connect(url).await;
    let text = next_text(&mut ws).await;
    (ws, text)
}

pub async fn send(ws: &mut Ws, msg: ClientMessage) {
    send_raw(ws, &msg.encode().unwrap()).await;
}

pub async fn send_raw(ws: &mut Ws, frame: &str) {
    ws.send(Message::text(frame.to_owned())).await.unwrap();
}

pub async fn next_msg(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a server event")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Next `receive-text`, skipping presence and notices.
pub async fn next_text(ws: &mut Ws) -> String {
    loop {
        if let ServerMessage::ReceiveText { text } = next_msg(ws).await {
            return text;
        }
    }
}

/// Read `receive-text` events until one equals `want`.
pub async fn wait_for_text(ws: &mut Ws, want: &str) {
    while next_text(ws).await != want {}
}

/// Next `error` event, skipping everything else.
pub async fn next_error(ws: &mut Ws) -> String {
    loop {
        if let ServerMessage::Error(msg) = next_msg(ws).await {
            return msg;
        }
    }
}

/// Assert no `receive-text` arrives within `window`.
pub async fn assert_no_text(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(ServerMessage::ReceiveText { text }) = ServerMessage::decode(text.as_str()) {
                    panic!("unexpected receive-text {text:?}");
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

/// Poll `cond` until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Poll an async `cond` until it holds.
pub async fn wait_until_async<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}
