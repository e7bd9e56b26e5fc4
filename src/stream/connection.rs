use std::collections::BTreeSet;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::ReconnectPolicy;
use crate::event::ConnectionStatus;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw text frame tagged with the generation of the socket that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub generation: u64,
    pub text: String,
}

#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// `{base}?streams=a/b/c` for the combined-stream endpoint.
pub fn combined_stream_url(base: &str, streams: &BTreeSet<String>) -> String {
    let joined = streams.iter().map(String::as_str).collect::<Vec<_>>().join("/");
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}streams={}", base, sep, joined)
}

/// Live SUBSCRIBE / UNSUBSCRIBE request for an open socket.
pub fn control_message(method: &str, streams: &[String], id: u64) -> String {
    serde_json::json!({
        "method": method,
        "params": streams,
        "id": id,
    })
    .to_string()
}

/// Handle to one logical streaming subscription.
///
/// The socket lives in a spawned task that reconnects with backoff until the
/// policy gives up or the handle is closed. Dropping the handle closes it.
pub struct StreamConnection {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Spawn the connection task. Must be called inside a Tokio runtime.
    pub fn open(
        base_url: &str,
        streams: impl IntoIterator<Item = String>,
        generation: u64,
        policy: ReconnectPolicy,
        frames: mpsc::Sender<StreamFrame>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);

        let worker = ConnectionWorker {
            base_url: base_url.to_string(),
            streams: streams.into_iter().collect(),
            generation,
            policy,
            frames,
            commands: command_rx,
            shutdown: shutdown_rx,
            status: status_tx,
            next_request_id: 1,
        };
        let task = tokio::spawn(worker.run());

        Self {
            generation,
            commands: command_tx,
            shutdown: shutdown_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Add streams on the live socket without reconnecting.
    pub fn subscribe(&self, streams: Vec<String>) {
        if self.task.is_some() && !streams.is_empty() {
            let _ = self.commands.send(Command::Subscribe(streams));
        }
    }

    /// Drop streams from the live socket without reconnecting.
    pub fn unsubscribe(&self, streams: Vec<String>) {
        if self.task.is_some() && !streams.is_empty() {
            let _ = self.commands.send(Command::Unsubscribe(streams));
        }
    }

    /// Stop the socket and any pending reconnect. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.task.take().is_none() {
            return;
        }
        tracing::debug!(generation = self.generation, "Closing stream connection");
        let _ = self.shutdown.send(true);
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

enum PumpExit {
    Shutdown,
    Dropped(String),
}

struct ConnectionWorker {
    base_url: String,
    streams: BTreeSet<String>,
    generation: u64,
    policy: ReconnectPolicy,
    frames: mpsc::Sender<StreamFrame>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<ConnectionStatus>,
    next_request_id: u64,
}

impl ConnectionWorker {
    async fn run(mut self) {
        let generation = self.generation;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.status
                .send_replace(ConnectionStatus::Connecting { generation });
            let url = combined_stream_url(&self.base_url, &self.streams);
            tracing::info!(generation, url = %url, "Connecting stream");

            let connected = tokio::select! {
                res = tokio_tungstenite::connect_async(url.as_str()) => res,
                _ = self.shutdown.changed() => break,
            };

            match connected {
                Ok((socket, _resp)) => {
                    self.policy.reset();
                    self.status
                        .send_replace(ConnectionStatus::Open { generation });
                    tracing::info!(generation, streams = self.streams.len(), "Stream connected");
                    match self.pump(socket).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Dropped(reason) => {
                            tracing::warn!(generation, reason = %reason, "Stream dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Stream connect failed");
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                let attempts = self.policy.attempt();
                tracing::error!(generation, attempts, "Giving up on stream after repeated failures");
                self.status
                    .send_replace(ConnectionStatus::Failed { attempts });
                return;
            };
            let attempt = self.policy.attempt();
            tracing::info!(generation, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting stream");
            self.status.send_replace(ConnectionStatus::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            if !self.wait_backoff(delay).await {
                break;
            }
        }
        self.status.send_replace(ConnectionStatus::Closed);
    }

    /// Sleep out the backoff while still tracking stream changes.
    /// Returns `false` if shutdown was requested.
    async fn wait_backoff(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.changed() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        // Offline: the new set is used on the next connect.
                        let _ = self.apply_command(cmd);
                    }
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, socket: Socket) -> PumpExit {
        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = write.send(Message::Close(None)).await;
                        return PumpExit::Shutdown;
                    };
                    if let Some(text) = self.apply_command(cmd) {
                        tracing::debug!(generation = self.generation, request = %text, "Sending stream control message");
                        if let Err(e) = write.send(Message::Text(text)).await {
                            return PumpExit::Dropped(format!("control write failed: {}", e));
                        }
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = StreamFrame { generation: self.generation, text };
                        if self.frames.send(frame).await.is_err() {
                            // Nobody is listening any more.
                            return PumpExit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return PumpExit::Dropped(format!("closed by peer: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                    None => return PumpExit::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    /// Update the tracked stream set. Returns the control message to send
    /// when the command actually changes the set.
    fn apply_command(&mut self, cmd: Command) -> Option<String> {
        let (method, changed) = match cmd {
            Command::Subscribe(streams) => {
                let added: Vec<String> = streams
                    .into_iter()
                    .filter(|s| self.streams.insert(s.clone()))
                    .collect();
                ("SUBSCRIBE", added)
            }
            Command::Unsubscribe(streams) => {
                let removed: Vec<String> = streams
                    .into_iter()
                    .filter(|s| self.streams.remove(s))
                    .collect();
                ("UNSUBSCRIBE", removed)
            }
        };
        if changed.is_empty() {
            return None;
        }
        let id = self.next_request_id;
        self.next_request_id += 1;
        Some(control_message(method, &changed, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_url_joins_streams_in_order() {
        let streams: BTreeSet<String> = ["ethusdt@ticker", "btcusdt@ticker"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            combined_stream_url("wss://stream.binance.com:9443/stream", &streams),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/ethusdt@ticker"
        );
        assert_eq!(
            combined_stream_url("ws://host/stream?x=1", &streams),
            "ws://host/stream?x=1&streams=btcusdt@ticker/ethusdt@ticker"
        );
    }

    #[test]
    fn control_message_shape() {
        let msg = control_message("SUBSCRIBE", &["solusdt@ticker".to_string()], 7);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "solusdt@ticker");
        assert_eq!(v["id"], 7);
    }
}
