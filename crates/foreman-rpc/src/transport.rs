use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{parse_call_result, parse_tool_list, ToolDescriptor, PROTOCOL_VERSION};

/// Callback invoked for every server→client notification, on the background
/// reader task.  Handlers must only enqueue work (send on a channel); they
/// must never call back into the session synchronously.
pub type NotificationHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,
    #[error("transport closed: {stderr}")]
    Closed { stderr: String },
    #[error("tool server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(String),
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>;

/// State shared between callers and the background reader.
struct Shared {
    pending: PendingMap,
    closed: AtomicBool,
    stderr_tail: Mutex<String>,
    notify: Option<NotificationHandler>,
}

impl Shared {
    fn fail_all_pending(&self) {
        let stderr = self.stderr_tail.lock().unwrap().clone();
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Closed {
                stderr: stderr.clone(),
            }));
        }
    }
}

/// Serialized writer half: request ids are allocated and lines written while
/// holding this one lock, so ids are strictly monotonic on the wire.
struct Writer {
    stdin: ChildStdin,
    next_id: u64,
}

/// JSON-RPC 2.0 client for one tool-server child process.
///
/// A killed or crashed transport cannot be restarted in place; build a new
/// one.
pub struct ToolTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Mutex<Option<Child>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    shared: Arc<Shared>,
}

impl ToolTransport {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        notify: Option<NotificationHandler>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            child: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                stderr_tail: Mutex::new(String::new()),
                notify,
            }),
        }
    }

    /// Spawn the child and perform the `initialize` handshake, blocking until
    /// the server acknowledges.  Sends `notifications/initialized` afterwards.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(TransportError::NotStarted)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotStarted)?;
        let stderr = child.stderr.take().ok_or(TransportError::NotStarted)?;

        // Background stderr collector: kept for error reports when the child
        // dies mid-call.
        let shared = Arc::clone(&self.shared);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut tail = shared.stderr_tail.lock().unwrap();
                tail.push_str(&line);
                tail.push('\n');
                // Bound the tail so a chatty server cannot grow it unboundedly.
                if tail.len() > 8192 {
                    let cut = tail.len() - 8192;
                    tail.drain(..cut);
                }
            }
        });

        // Background reader: routes replies by id, dispatches notifications.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                            continue; // skip malformed lines
                        };
                        if let Some(id) = msg["id"].as_u64() {
                            let tx = shared.pending.lock().unwrap().remove(&id);
                            if let Some(tx) = tx {
                                let reply = if msg["error"].is_object() {
                                    Err(TransportError::Rpc {
                                        code: msg["error"]["code"].as_i64().unwrap_or(0),
                                        message: msg["error"]["message"]
                                            .as_str()
                                            .unwrap_or("unknown error")
                                            .to_string(),
                                    })
                                } else {
                                    Ok(msg["result"].clone())
                                };
                                let _ = tx.send(reply);
                            }
                        } else if let Some(method) = msg["method"].as_str() {
                            if let Some(handler) = &shared.notify {
                                handler(method, &msg["params"]);
                            }
                        }
                    }
                    // EOF or read failure: the child is gone.
                    _ => break,
                }
            }
            shared.closed.store(true, Ordering::SeqCst);
            // Let the stderr collector drain before failing pending calls, so
            // error reports carry the child's last words.
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), stderr_task).await;
            shared.fail_all_pending();
            debug!("tool transport reader exited");
        });

        *self.child.lock().unwrap() = Some(child);
        *self.writer.lock().await = Some(Writer { stdin, next_id: 0 });

        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "foreman", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await?;
        debug!(server_info = %init["serverInfo"], "tool server initialized");

        self.notification("notifications/initialized", json!({})).await?;
        Ok(())
    }

    /// List the tools the server exposes.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result))
    }

    /// Invoke one tool and return the joined text of its result.
    ///
    /// A result flagged `isError` by the server is still returned as text —
    /// the model reads the error and reacts to it; only transport-level
    /// failures are `Err`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, TransportError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let (text, is_error) = parse_call_result(&result);
        if is_error {
            warn!(tool = name, "tool reported an error result");
        }
        Ok(text)
    }

    /// Terminate the child.  Idempotent; pending calls fail with `Closed`.
    pub async fn stop(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.fail_all_pending();
        *self.writer.lock().await = None;
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed {
                stderr: self.shared.stderr_tail.lock().unwrap().clone(),
            });
        }

        let rx = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::NotStarted)?;
            writer.next_id += 1;
            let id = writer.next_id;

            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().unwrap().insert(id, tx);

            let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
            let mut line = msg.to_string();
            line.push('\n');
            if let Err(e) = writer.stdin.write_all(line.as_bytes()).await {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(e.into());
            }
            if let Err(e) = writer.stdin.flush().await {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(e.into());
            }
            rx
        };

        rx.await.map_err(|_| TransportError::Closed {
            stderr: self.shared.stderr_tail.lock().unwrap().clone(),
        })?
    }

    async fn notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotStarted)?;
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut line = msg.to_string();
        line.push('\n');
        writer.stdin.write_all(line.as_bytes()).await?;
        writer.stdin.flush().await?;
        Ok(())
    }
}
