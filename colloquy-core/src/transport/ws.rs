//! WebSocket implementation of [`SessionTransport`] on tokio-tungstenite.
//!
//! One writer task drains an unbounded outbound channel into the socket;
//! one reader task decodes inbound frames into the event channel. Outbound
//! media failures are swallowed — a dropped frame must not crash the
//! session. The reader signals `connect()` completion when the remote
//! acknowledges the setup message.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::wire::{self, OutboundAudioFrame, OutboundVideoFrame};
use super::{InboundEvent, SessionTransport, TransportConfig};
use crate::error::{ColloquyError, Result};

/// Inbound event channel depth. Bursts beyond this apply backpressure to
/// the socket reader, never to the remote.
const EVENT_CHANNEL_CAP: usize = 256;

/// How long `connect()` waits for the remote open acknowledgement.
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

/// WebSocket transport to the remote conversational service.
pub struct WsTransport {
    url: String,
    outbound: Mutex<Option<Outbound>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound: Mutex::new(None),
        }
    }

    fn enqueue(&self, text: String, what: &str) {
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(out) => {
                if out.tx.send(Message::Text(text)).is_err() {
                    debug!("dropped outbound {what}: writer gone");
                }
            }
            None => debug!("dropped outbound {what}: not connected"),
        }
    }
}

impl SessionTransport for WsTransport {
    async fn connect(&self, config: TransportConfig) -> Result<mpsc::Receiver<InboundEvent>> {
        let (stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| ColloquyError::Connection(e.to_string()))?;
        info!(url = %self.url, "socket open, sending setup");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (ack_tx, ack_rx) = oneshot::channel();

        // Writer: drain the outbound queue until the channel or socket dies.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    debug!("socket writer stopped: send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: decode frames into events until the socket ends.
        tokio::spawn(async move {
            let mut ack_tx = Some(ack_tx);
            while let Some(frame) = source.next().await {
                let raw = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("dropping non-utf8 binary frame: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue, // ping/pong handled by tungstenite
                    Err(e) => {
                        let _ = event_tx.send(InboundEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                let events = match wire::decode_server_message(&raw) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("dropping undecodable server message: {e}");
                        continue;
                    }
                };
                for event in events {
                    if event == InboundEvent::Opened {
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    if event_tx.send(event).await.is_err() {
                        return; // session gone
                    }
                }
            }
            let _ = event_tx.send(InboundEvent::Closed).await;
        });

        outbound_tx
            .send(Message::Text(wire::setup_message(&config)))
            .map_err(|_| ColloquyError::Connection("socket closed before setup".into()))?;
        *self.outbound.lock() = Some(Outbound { tx: outbound_tx });

        match tokio::time::timeout(OPEN_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(event_rx),
            Ok(Err(_)) => {
                self.close();
                Err(ColloquyError::Connection(
                    "connection ended before open acknowledgement".into(),
                ))
            }
            Err(_) => {
                self.close();
                Err(ColloquyError::Connection(
                    "timed out waiting for open acknowledgement".into(),
                ))
            }
        }
    }

    fn send_audio(&self, frame: OutboundAudioFrame) {
        self.enqueue(wire::realtime_input_message(&frame), "audio frame");
    }

    fn send_video(&self, frame: OutboundVideoFrame) {
        self.enqueue(wire::realtime_input_message(&frame), "video frame");
    }

    fn close(&self) {
        // Dropping the sender ends the writer task, which closes the socket.
        if self.outbound.lock().take().is_some() {
            info!("transport closed");
        }
    }
}
