use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Something the remote end did on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    /// Transport-level error; closure, if any, is reported separately.
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Something the local side wants written to an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// One open bidirectional channel.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link>;
}

/// [`Connector`] over a WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow!("WebSocket connection failed: {}", e))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            tracing::error!("WebSocket send error: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close => break,
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
            let _ = write.close().await;
            tracing::debug!("WebSocket write task ended");
        });

        tokio::spawn(async move {
            let closed = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if in_tx.send(LinkEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => LinkEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.to_string(),
                            },
                            None => LinkEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                        break LinkEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break LinkEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = in_tx.send(closed);
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
