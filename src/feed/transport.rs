//! Producer transports.
//!
//! A producer is whatever emits envelope lines: a scraper subprocess writing
//! to stdout, or a WebSocket endpoint pushing the same lines as text frames.
//! The feed loop only sees the `ProducerTransport`/`ProducerConnection` pair;
//! reconnect policy lives above this seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

const WS_PING_INTERVAL: Duration = Duration::from_secs(25);

/// One attach to a producer: yields envelope lines until the stream ends
/// (`Ok(None)`) or fails.
#[async_trait]
pub trait ProducerConnection: Send {
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// How to reach a producer. Every `connect` is a fresh attach; the feed loop
/// decides when to reconnect.
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    fn describe(&self) -> String;
    async fn connect(&self) -> Result<Box<dyn ProducerConnection>>;
}

// ── Subprocess producer ──────────────────────────────────────────────────────

/// Spawns a scraper command and reads newline-delimited JSON off its stdout.
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
}

impl CommandTransport {
    #[allow(dead_code)]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandTransport {
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace-separated command string as configured on the
    /// CLI, e.g. `"python3 scrapers/kalshi_stream.py --league epl"`.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut words = command.split_whitespace();
        let program = words.next().context("empty producer command")?.to_string();
        Ok(CommandTransport {
            program,
            args: words.map(str::to_string).collect(),
        })
    }
}

#[async_trait]
impl ProducerTransport for CommandTransport {
    fn describe(&self) -> String {
        format!("command `{}`", self.program)
    }

    async fn connect(&self) -> Result<Box<dyn ProducerConnection>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // The child dies with its feed; a consumer walking away must not
            // leave scrapers running forever.
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn producer `{}`", self.program))?;
        let stdout = child
            .stdout
            .take()
            .context("producer stdout was not captured")?;
        Ok(Box::new(CommandConnection {
            _child: child,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

struct CommandConnection {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl ProducerConnection for CommandConnection {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

// ── WebSocket producer ───────────────────────────────────────────────────────

/// Connects to a producer that pushes envelope lines as WS text frames.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketTransport { url: url.into() }
    }
}

#[async_trait]
impl ProducerTransport for WebSocketTransport {
    fn describe(&self) -> String {
        format!("websocket {}", self.url)
    }

    async fn connect(&self) -> Result<Box<dyn ProducerConnection>> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("websocket connect to {} failed", self.url))?;
        let (write, read) = ws_stream.split();
        let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
        // First tick fires immediately; skip it so we don't ping on connect.
        ping_interval.reset();
        Ok(Box::new(WsConnection {
            write,
            read,
            ping_interval,
        }))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct WsConnection {
    write: WsSink,
    read: WsSource,
    ping_interval: tokio::time::Interval,
}

#[async_trait]
impl ProducerConnection for WsConnection {
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            tokio::select! {
                msg = self.read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            // Some producers ping in-band with a bare "ping".
                            if text.trim() == "ping" {
                                let _ = self.write.send(Message::Text("pong".to_string())).await;
                                continue;
                            }
                            return Ok(Some(text));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = self.write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(None),
                        Some(Ok(other)) => {
                            debug!("ignoring non-text websocket frame: {:?}", other);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(None),
                    }
                }
                _ = self.ping_interval.tick() => {
                    self.write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }
}
