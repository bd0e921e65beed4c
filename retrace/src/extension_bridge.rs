use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::AutomationError;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:17373";

/// Where the in-page peer connects and how long evaluations may take.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub addr: String,
    pub eval_timeout: Duration,
    /// Capacity of the signal broadcast channel; slow subscribers lag past it.
    pub signal_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_WS_ADDR.to_string(),
            eval_timeout: Duration::from_secs(5),
            signal_buffer: 256,
        }
    }
}

// Reduce type complexity for Clippy
type BridgeResult = Result<Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;

#[derive(Debug, Serialize, Deserialize)]
struct EvalRequest {
    id: String,
    action: String,
    code: String,
    #[serde(default)]
    await_promise: bool,
}

#[derive(Debug, Serialize)]
struct PongReply {
    action: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    EvalResult {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { url: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "bridge_event")]
    BridgeEvent {
        #[serde(rename = "eventType")]
        event_type: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "page_loaded")]
    PageLoaded { url: String },
    #[serde(rename = "console_event")]
    ConsoleEvent {
        level: Option<String>,
        args: Option<Value>,
    },
    #[serde(rename = "exception_event")]
    ExceptionEvent { details: Option<Value> },
}

/// Something the in-page peer told the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    Connected { url: Option<String> },
    /// A `(eventType, payload)` call from the overlay.
    BridgeEvent { event_type: String, payload: Value },
    /// A document finished loading; overlays injected into the previous
    /// document are gone.
    PageLoaded { url: String },
    Disconnected,
}

struct Client {
    id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

/// WebSocket server the browser extension (and the overlay running inside the
/// page) connects to. Evaluation requests go out to the first connected
/// client; everything the page reports comes back as [`PeerSignal`]s.
pub struct ExtensionBridge {
    server_task: JoinHandle<()>,
    clients: Clients,
    pending: Pending,
    signals: broadcast::Sender<PeerSignal>,
    local_addr: Option<SocketAddr>,
}

impl ExtensionBridge {
    /// Bind the listener. A bind failure leaves a non-functional bridge that
    /// reports [`AutomationError::BridgeUnavailable`] on every evaluation.
    pub async fn start(config: &BridgeConfig) -> ExtensionBridge {
        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (signals, _) = broadcast::channel(config.signal_buffer.max(1));
        let addr = config.addr.as_str();

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, ?e, "Port in use, waiting 2 seconds and retrying once...");
                tokio::time::sleep(Duration::from_secs(2)).await;
                match TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e2) => {
                        tracing::error!(
                            %addr,
                            ?e2,
                            "Failed to bind after retry. Page bridge will be non-functional."
                        );
                        return Self::inert(clients, pending, signals);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%addr, ?e, "failed to bind ws");
                return Self::inert(clients, pending, signals);
            }
        };
        let local_addr = listener.local_addr().ok();
        tracing::info!(addr = ?local_addr, "Retrace page bridge listening");

        let clients_clone = clients.clone();
        let pending_clone = pending.clone();
        let signals_clone = signals.clone();
        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("ws accept error: {}", e);
                        continue;
                    }
                };
                let ws_clients = clients_clone.clone();
                let ws_pending = pending_clone.clone();
                let ws_signals = signals_clone.clone();
                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("ws handshake error: {}", e);
                            return;
                        }
                    };
                    let (mut sink, mut stream) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

                    // writer task
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if let Err(e) = sink.send(msg).await {
                                tracing::warn!("ws send error: {}", e);
                                break;
                            }
                        }
                    });

                    let client_id = Uuid::new_v4();
                    ws_clients.lock().await.push(Client {
                        id: client_id,
                        sender: tx.clone(),
                    });

                    // reader loop
                    while let Some(Ok(msg)) = stream.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let txt = msg.into_text().unwrap_or_default();
                        match serde_json::from_str::<BridgeIncoming>(&txt) {
                            Ok(BridgeIncoming::EvalResult {
                                id,
                                ok,
                                result,
                                error,
                            }) => {
                                if ok {
                                    let size =
                                        result.as_ref().map(|r| r.to_string().len()).unwrap_or(0);
                                    tracing::debug!(id = %id, result_size = size, "Bridge received EvalResult");
                                } else {
                                    let head: String = error
                                        .as_deref()
                                        .unwrap_or("unknown error")
                                        .chars()
                                        .take(400)
                                        .collect();
                                    tracing::warn!(id = %id, error = %head, "Bridge received EvalResult error");
                                }
                                if let Some(tx) = ws_pending.lock().await.remove(&id) {
                                    let _ = tx.send(if ok {
                                        Ok(result.unwrap_or(Value::Null))
                                    } else {
                                        Err(error.unwrap_or_else(|| "unknown error".into()))
                                    });
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::BridgeEvent {
                                event_type,
                                payload,
                            })) => {
                                if event_type == "ping" {
                                    if let Ok(reply) =
                                        serde_json::to_string(&PongReply { action: "pong" })
                                    {
                                        let _ = tx.send(Message::Text(reply));
                                    }
                                }
                                tracing::debug!(event_type = %event_type, "Bridge event from page");
                                let _ = ws_signals.send(PeerSignal::BridgeEvent {
                                    event_type,
                                    payload,
                                });
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::PageLoaded { url })) => {
                                tracing::debug!(url = %url, "Page load reported");
                                let _ = ws_signals.send(PeerSignal::PageLoaded { url });
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::ConsoleEvent {
                                level,
                                args,
                            })) => {
                                let args_str =
                                    args.map(|v| v.to_string()).unwrap_or_else(|| "[]".into());
                                match level.as_deref().unwrap_or("log") {
                                    "error" => tracing::error!(args = %args_str, "Console error event"),
                                    "warning" | "warn" => {
                                        tracing::warn!(args = %args_str, "Console warn event")
                                    }
                                    _ => tracing::debug!(args = %args_str, "Console event"),
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::ExceptionEvent {
                                details,
                            })) => {
                                let details_val = details.unwrap_or(Value::Null);
                                tracing::error!(details = %details_val, "Runtime exception event");
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Hello { url })) => {
                                tracing::info!(url = ?url, "Page peer connected");
                                let _ = ws_signals.send(PeerSignal::Connected { url });
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
                            Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
                        }
                    }

                    ws_clients.lock().await.retain(|c| c.id != client_id);
                    let _ = ws_signals.send(PeerSignal::Disconnected);
                    writer.abort();
                });
            }
        });

        ExtensionBridge {
            server_task,
            clients,
            pending,
            signals,
            local_addr,
        }
    }

    fn inert(
        clients: Clients,
        pending: Pending,
        signals: broadcast::Sender<PeerSignal>,
    ) -> ExtensionBridge {
        ExtensionBridge {
            server_task: tokio::spawn(async move {}),
            clients,
            pending,
            signals,
            local_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr.is_some() && !self.server_task.is_finished()
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Receive everything the page reports from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerSignal> {
        self.signals.subscribe()
    }

    pub async fn eval(&self, code: &str, timeout: Duration) -> Result<Value, AutomationError> {
        if self.clients.lock().await.is_empty() {
            return Err(AutomationError::BridgeUnavailable(
                "no page connected to the bridge".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);
        let req = EvalRequest {
            id: id.clone(),
            action: "eval".into(),
            code: code.to_string(),
            await_promise: true,
        };
        let payload = serde_json::to_string(&req)
            .map_err(|e| AutomationError::InvalidArgument(format!("bridge serialize: {e}")))?;

        // send over first client
        let sent = {
            let clients = self.clients.lock().await;
            tracing::trace!(clients = clients.len(), preview = %payload.chars().take(120).collect::<String>(), "Sending eval to page");
            clients
                .first()
                .map(|c| c.sender.send(Message::Text(payload)).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(AutomationError::BridgeUnavailable(
                "failed to send eval to page".into(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(val))) => Ok(val),
            Ok(Ok(Err(err))) => Err(AutomationError::PageError(err)),
            Ok(Err(_canceled)) => Err(AutomationError::BridgeUnavailable(
                "page disconnected before answering".into(),
            )),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(id = %id, "Timed out waiting for EvalResult");
                Err(AutomationError::Timeout(format!(
                    "page evaluation exceeded {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for ExtensionBridge {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
