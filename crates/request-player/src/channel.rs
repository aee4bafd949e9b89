//! Push channel to the player backend.
//!
//! One WebSocket connection carries snapshot frames in and `{cmd, value}`
//! commands out.  The task reconnects forever with a fixed delay plus a
//! little jitter; the core only sees `ChannelUp`, `Frame` and `ChannelDown`.

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use request_proto::protocol::{Command, Frame};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;

/// Resolves track filenames to the backend's file endpoint.  The resulting
/// URL is both what the audio element loads and the loudness cache key.
#[derive(Debug, Clone)]
pub struct FileEndpoint {
    endpoint: Url,
}

impl FileEndpoint {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid file base url {}", base))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("player/file")?;
        Ok(Self { endpoint })
    }

    pub fn url_for(&self, filename: &str) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("path", filename);
        url.to_string()
    }
}

pub struct PushChannel {
    url: String,
    reconnect: Duration,
    events: mpsc::Sender<CoreEvent>,
    outgoing: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

enum SessionEnd {
    Closed,
    Shutdown,
}

impl PushChannel {
    pub fn new(
        url: String,
        reconnect: Duration,
        events: mpsc::Sender<CoreEvent>,
        outgoing: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url,
            reconnect,
            events,
            outgoing,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("channel: connecting to {}", self.url);
        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = tokio_tungstenite::connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws, _)) => {
                    info!("channel: connected");
                    if self.events.send(CoreEvent::ChannelUp).await.is_err() {
                        break;
                    }
                    let end = self.session(ws).await;
                    let _ = self.events.send(CoreEvent::ChannelDown).await;
                    match end {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Closed) => info!("channel: connection closed"),
                        Err(e) => warn!("channel: connection lost: {:#}", e),
                    }
                }
                Err(e) => warn!("channel: connect failed: {}", e),
            }

            if !self.wait_reconnect().await {
                break;
            }
        }
        debug!("channel: task exiting");
    }

    async fn session<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
    ) -> anyhow::Result<SessionEnd>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut tx, mut rx) = ws.split();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                cmd = self.outgoing.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    debug!("channel: send {}", cmd.name());
                    tx.send(Message::Text(cmd.encode()?)).await?;
                }
                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                        Ok(frame) => {
                            if self.events.send(CoreEvent::Frame(frame)).await.is_err() {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Err(e) => warn!("channel: dropping frame: {}", e),
                    },
                    Some(Ok(Message::Close(reason))) => {
                        debug!("channel: close frame {:?}", reason);
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::Closed),
                },
            }
        }
    }

    /// Sleep out the reconnect delay.  Commands issued while offline are
    /// dropped; the next snapshot supersedes them anyway.  Returns false on
    /// shutdown.
    async fn wait_reconnect(&mut self) -> bool {
        let jitter = rand::thread_rng().gen_range(0..500);
        let delay = tokio::time::sleep(self.reconnect + Duration::from_millis(jitter));
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                () = &mut delay => return true,
                cmd = self.outgoing.recv() => match cmd {
                    Some(cmd) => debug!("channel: offline, dropping {}", cmd.name()),
                    None => return false,
                },
            }
        }
    }
}
