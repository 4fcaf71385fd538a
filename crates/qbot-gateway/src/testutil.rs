//! Shared fakes for session and supervisor tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use qbot_core::ports::DispatchSink;
use qbot_core::{Error, Result};

use crate::protocol::{opcode, GatewayFrame};
use crate::transport::{GatewayTransport, Inbound};

/// Transport backed by channels: the test scripts inbound items and
/// observes every frame the session sends.
pub(crate) struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<Result<Inbound>>,
    sent: mpsc::UnboundedSender<GatewayFrame>,
}

pub(crate) fn channel_transport() -> (
    ChannelTransport,
    mpsc::UnboundedSender<Result<Inbound>>,
    mpsc::UnboundedReceiver<GatewayFrame>,
) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            incoming: in_rx,
            sent: sent_tx,
        },
        in_tx,
        sent_rx,
    )
}

#[async_trait]
impl GatewayTransport for ChannelTransport {
    async fn send(&mut self, frame: &GatewayFrame) -> Result<()> {
        self.sent
            .send(frame.clone())
            .map_err(|_| Error::Transport("test observer dropped".into()))
    }

    async fn recv(&mut self) -> Result<Inbound> {
        match self.incoming.recv().await {
            Some(item) => item,
            // Script exhausted and the sender dropped: behave like an
            // abnormal socket teardown.
            None => Ok(Inbound::Closed {
                code: 1006,
                reason: "script ended".into(),
            }),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn hello(heartbeat_interval_ms: u64) -> Result<Inbound> {
    Ok(Inbound::Frame(GatewayFrame {
        op: opcode::HELLO,
        d: Some(json!({ "heartbeat_interval": heartbeat_interval_ms })),
        t: None,
    }))
}

pub(crate) fn dispatch(event: &str, data: Value) -> Result<Inbound> {
    Ok(Inbound::Frame(GatewayFrame {
        op: opcode::DISPATCH,
        d: Some(data),
        t: Some(event.to_string()),
    }))
}

pub(crate) fn heartbeat_ack() -> Result<Inbound> {
    Ok(Inbound::Frame(GatewayFrame {
        op: opcode::HEARTBEAT_ACK,
        d: None,
        t: None,
    }))
}

pub(crate) fn closed(code: u16, reason: &str) -> Result<Inbound> {
    Ok(Inbound::Closed {
        code,
        reason: reason.to_string(),
    })
}

/// Sink that forwards every dispatched event to the test over a channel.
pub(crate) struct ChannelSink {
    pub tx: mpsc::UnboundedSender<(String, Value)>,
}

#[async_trait]
impl DispatchSink for ChannelSink {
    async fn on_event(&self, event_type: &str, event_data: Value) {
        let _ = self.tx.send((event_type.to_string(), event_data));
    }
}
