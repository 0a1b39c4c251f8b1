//! Response sink
//!
//! The adaptor writes the client-facing response through this handle; the
//! HTTP layer consumes the other end as the response head plus a body
//! stream. Once any body byte has gone through, the request is committed
//! to its channel and the orchestrator stops retrying.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::utils::error::{GatewayError, Result};

#[derive(Debug)]
pub enum SinkEvent {
    /// Sent exactly once, before any data
    Head { status: u16, content_type: String },
    Data(Bytes),
}

/// Write half, owned by the relay task.
pub struct ResponseSink {
    tx: mpsc::Sender<SinkEvent>,
    status: u16,
    content_type: String,
    head_sent: bool,
    committed: bool,
}

/// Read half, owned by the HTTP handler.
pub struct SinkReceiver {
    pub rx: mpsc::Receiver<SinkEvent>,
}

impl ResponseSink {
    pub fn channel(capacity: usize) -> (Self, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                status: 200,
                content_type: "application/json".to_string(),
                head_sent: false,
                committed: false,
            },
            SinkReceiver { rx },
        )
    }

    /// Override the response head. Ignored once the head is on the wire.
    pub fn set_head(&mut self, status: u16, content_type: &str) {
        if !self.head_sent {
            self.status = status;
            self.content_type = content_type.to_string();
        }
    }

    /// True once any body byte has been forwarded to the client.
    pub fn committed(&self) -> bool {
        self.committed
    }

    async fn send(&mut self, event: SinkEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| GatewayError::ClientClosed)
    }

    async fn ensure_head(&mut self) -> Result<()> {
        if !self.head_sent {
            let head = SinkEvent::Head {
                status: self.status,
                content_type: self.content_type.clone(),
            };
            self.send(head).await?;
            self.head_sent = true;
        }
        Ok(())
    }

    /// Write raw body bytes, emitting the head first if needed.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        self.ensure_head().await?;
        if !data.is_empty() {
            self.send(SinkEvent::Data(data)).await?;
            self.committed = true;
        }
        Ok(())
    }

    /// Write a whole JSON document as the response body.
    pub async fn write_json(&mut self, value: &serde_json::Value) -> Result<()> {
        self.set_head(self.status, "application/json");
        self.write(Bytes::from(serde_json::to_vec(value)?)).await
    }

    /// Write one SSE data frame carrying JSON.
    pub async fn write_sse_json(&mut self, value: &serde_json::Value) -> Result<()> {
        self.set_head(self.status, "text/event-stream");
        let frame = format!("data: {}\n\n", serde_json::to_string(value)?);
        self.write(Bytes::from(frame)).await
    }

    /// Write one raw SSE frame, already formatted.
    pub async fn write_sse_raw(&mut self, frame: Bytes) -> Result<()> {
        self.set_head(self.status, "text/event-stream");
        self.write(frame).await
    }

    /// Terminate an SSE stream.
    pub async fn write_sse_done(&mut self) -> Result<()> {
        self.write(Bytes::from_static(b"data: [DONE]\n\n")).await
    }
}

impl SinkReceiver {
    /// Drain everything into (head, body) for tests and channel probes.
    pub async fn collect(mut self) -> (Option<(u16, String)>, Bytes) {
        let mut head = None;
        let mut body = Vec::new();
        while let Some(event) = self.rx.recv().await {
            match event {
                SinkEvent::Head {
                    status,
                    content_type,
                } => head = Some((status, content_type)),
                SinkEvent::Data(data) => body.extend_from_slice(&data),
            }
        }
        (head, Bytes::from(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn head_precedes_data_and_commit_tracks_bytes() {
        let (mut sink, receiver) = ResponseSink::channel(8);
        assert!(!sink.committed());

        sink.set_head(201, "text/plain");
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        assert!(sink.committed());
        drop(sink);

        let (head, body) = receiver.collect().await;
        assert_eq!(head, Some((201, "text/plain".to_string())));
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn head_is_frozen_after_first_write() {
        let (mut sink, receiver) = ResponseSink::channel(8);
        sink.write_sse_json(&json!({"x": 1})).await.unwrap();
        // too late: the head is already on the wire
        sink.set_head(500, "application/json");
        sink.write_sse_done().await.unwrap();
        drop(sink);

        let (head, body) = receiver.collect().await;
        assert_eq!(head, Some((200, "text/event-stream".to_string())));
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("data: {\"x\":1}\n\n"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn dropped_receiver_is_client_closed() {
        let (mut sink, receiver) = ResponseSink::channel(1);
        drop(receiver);
        let err = sink.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientClosed));
    }
}
