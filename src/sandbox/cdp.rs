use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Minimal Chrome DevTools Protocol client: one websocket, one outstanding
/// command at a time. Events that arrive while a command is pending are
/// handed to the caller of [`CdpConnection::call_with_events`] and
/// otherwise dropped.
pub struct CdpConnection {
    socket: Mutex<Socket>,
    next_id: AtomicU64,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self, String> {
        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|err| format!("devtools websocket connect failed: {err}"))?;
        Ok(Self {
            socket: Mutex::new(socket),
            next_id: AtomicU64::new(1),
        })
    }

    /// Sends `method` (to `session_id` when given) and waits for its
    /// response.
    pub async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        self.call_with_events(session_id, method, params, timeout, &mut |_: &Value| {})
            .await
    }

    pub async fn call_with_events(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        timeout: Duration,
        on_event: &mut (dyn FnMut(&Value) + Send),
    ) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let (Some(session_id), Value::Object(map)) = (session_id, &mut frame) {
            map.insert("sessionId".to_owned(), Value::String(session_id.to_owned()));
        }

        let mut socket = self.socket.lock().await;
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|err| format!("devtools send failed for {method}: {err}"))?;
        let response = tokio::time::timeout(timeout, read_response(&mut socket, id, on_event))
            .await
            .map_err(|_| format!("devtools call {method} timed out after {}s", timeout.as_secs()))??;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown devtools error");
            return Err(format!("devtools call {method} failed: {message}"));
        }
        debug!(method, id, "devtools call completed");
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn close(&self) {
        let mut socket = self.socket.lock().await;
        let _ = socket.close(None).await;
    }
}

async fn read_response(
    socket: &mut Socket,
    id: u64,
    on_event: &mut (dyn FnMut(&Value) + Send),
) -> Result<Value, String> {
    loop {
        let Some(message) = socket.next().await else {
            return Err("devtools socket closed before response".to_owned());
        };
        let message = message.map_err(|err| format!("devtools websocket read failed: {err}"))?;
        match message {
            Message::Text(text) => {
                let parsed: Value = serde_json::from_str(&text)
                    .map_err(|err| format!("devtools frame JSON parse failed: {err}"))?;
                if parsed.get("id").and_then(Value::as_u64) == Some(id) {
                    return Ok(parsed);
                }
                if parsed.get("method").is_some() {
                    on_event(&parsed);
                }
            }
            Message::Ping(payload) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("devtools websocket pong failed: {err}"))?;
            }
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|value| value.reason.to_string())
                    .unwrap_or_else(|| "close".to_owned());
                return Err(format!("devtools socket closed: {reason}"));
            }
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Extracts the browser websocket endpoint from a `DevTools listening on`
/// line of the browser's stderr.
pub fn parse_devtools_url(line: &str) -> Option<String> {
    let start = line.find("ws://")?;
    let url = line[start..].split_whitespace().next()?;
    Some(url.to_owned())
}

/// Turns a `Runtime.evaluate` result into its value, or the thrown
/// exception's description.
pub fn evaluation_value(result: &Value) -> Result<Value, String> {
    if let Some(details) = result.get("exceptionDetails") {
        let description = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("page script threw");
        return Err(description.to_owned());
    }
    Ok(result
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}
