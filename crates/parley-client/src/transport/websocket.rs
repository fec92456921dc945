use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Connection, Outbox, Outgoing, Transport, TransportEvent};
use crate::error::TransportError;

/// Text-frame WebSocket transport. Each connection runs a reader and a
/// writer task.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str, inbound_buffer: usize) -> Result<Connection, TransportError> {
        let (ws, _response) = connect_async(url).await.map_err(Box::new)?;
        info!(url, "WebSocket connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(inbound_buffer.max(1));

        // Writer
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        debug!("Closing WebSocket");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                    Ok(Message::Close(close)) => {
                        reason = close.map(|c| c.reason.to_string());
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "WebSocket read failed");
                        reason = Some(e.to_string());
                        break;
                    }
                };
                if in_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                    // Session is gone.
                    return;
                }
            }
            info!(reason = ?reason, "WebSocket closed");
            let _ = in_tx.send(TransportEvent::Closed(reason)).await;
        });

        Ok(Connection {
            outbox: Outbox::new(out_tx),
            inbound: in_rx,
        })
    }
}
