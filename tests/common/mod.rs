//! Common test utilities
//!
//! A small in-process WebSocket RPC server that speaks the client's wire
//! protocol, plus polling helpers.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

enum ServerCommand {
    Send(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<ServerCommand>>>,
    subscriptions: Mutex<HashMap<u64, Vec<Value>>>,
    held: Mutex<Vec<(u64, Value)>>,
    frames: Mutex<Vec<(u64, Value)>>,
    accepted: AtomicU64,
}

impl ServerState {
    fn send(&self, conn: u64, value: Value) {
        if let Some(tx) = self.connections.lock().unwrap().get(&conn) {
            let _ = tx.send(ServerCommand::Send(value.to_string()));
        }
    }

    fn handle(&self, conn: u64, envelope: &Value) {
        let id = envelope["id"].clone();
        let path = envelope["params"]["path"].as_str().unwrap_or_default();
        let input = envelope["params"]["input"].clone();

        match envelope["method"].as_str().unwrap_or_default() {
            "subscription" => {
                self.subscriptions
                    .lock()
                    .unwrap()
                    .entry(conn)
                    .or_default()
                    .push(id.clone());
                self.send(conn, json!({"id": id, "result": {"type": "started"}}));
            }
            "subscription.stop" => {
                if let Some(subs) = self.subscriptions.lock().unwrap().get_mut(&conn) {
                    subs.retain(|sub| sub != &id);
                }
                self.send(conn, json!({"id": id, "result": {"type": "stopped"}}));
            }
            _ => match path {
                "greeting" => {
                    let name = input.as_str().unwrap_or("world").to_string();
                    self.send(
                        conn,
                        json!({"id": id, "result": {"type": "data", "data": format!("hello {}", name)}}),
                    );
                }
                "slow" => self.held.lock().unwrap().push((conn, id)),
                "fail" => self.send(
                    conn,
                    json!({"id": id, "error": {"message": "procedure failed", "code": -32603}}),
                ),
                _ => self.send(conn, json!({"id": id, "result": {"type": "data", "data": input}})),
            },
        }
    }
}

/// WebSocket server on an ephemeral loopback port.
///
/// Routes: `greeting` answers "hello {input}", `slow` is held until
/// [`TestServer::answer_held`], `fail` returns an error, anything else echoes
/// its input. Subscriptions are acknowledged and fed by [`TestServer::emit`].
pub struct TestServer {
    pub url: String,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = accept_state.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve_connection(conn, stream, accept_state.clone()));
            }
        });

        Self {
            url: format!("ws://{}", addr),
            state,
            accept_task,
        }
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    /// Active subscriptions across open connections
    pub fn subscription_count(&self) -> usize {
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Every frame received so far, with the connection it arrived on
    pub fn frames(&self) -> Vec<(u64, Value)> {
        self.state.frames.lock().unwrap().clone()
    }

    /// Envelopes received with `method`, flattened out of batches
    pub fn envelopes(&self, method: &str) -> Vec<(u64, Value)> {
        self.frames()
            .into_iter()
            .flat_map(|(conn, frame)| match frame {
                Value::Array(items) => items.into_iter().map(|e| (conn, e)).collect(),
                single => vec![(conn, single)],
            })
            .filter(|(_, e)| e["method"] == method)
            .collect()
    }

    /// Push a data event to every active subscription
    pub fn emit(&self, data: Value) {
        let subs = self.state.subscriptions.lock().unwrap().clone();
        for (conn, ids) in subs {
            for id in ids {
                self.state.send(
                    conn,
                    json!({"id": id, "result": {"type": "data", "data": data.clone()}}),
                );
            }
        }
    }

    /// Answer every held `slow` request with `data`
    pub fn answer_held(&self, data: Value) {
        let held: Vec<(u64, Value)> = self.state.held.lock().unwrap().drain(..).collect();
        for (conn, id) in held {
            self.state.send(
                conn,
                json!({"id": id, "result": {"type": "data", "data": data.clone()}}),
            );
        }
    }

    /// Ask every connected client to reconnect
    pub fn reconnect_all(&self) {
        let conns: Vec<u64> = self.state.connections.lock().unwrap().keys().copied().collect();
        for conn in conns {
            self.state
                .send(conn, json!({"id": null, "method": "reconnect"}));
        }
    }

    /// Close every open connection from the server side
    pub fn drop_connections(&self) {
        for tx in self.state.connections.lock().unwrap().values() {
            let _ = tx.send(ServerCommand::Close);
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve_connection(conn: u64, stream: TcpStream, state: Arc<ServerState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.connections.lock().unwrap().insert(conn, tx);

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    state.frames.lock().unwrap().push((conn, value.clone()));
                    match &value {
                        Value::Array(items) => items.iter().for_each(|e| state.handle(conn, e)),
                        single => state.handle(conn, single),
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = rx.recv() => match command {
                Some(ServerCommand::Send(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.connections.lock().unwrap().remove(&conn);
    state.subscriptions.lock().unwrap().remove(&conn);
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, failing the test if it takes longer than two seconds
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation did not finish in time")
}
