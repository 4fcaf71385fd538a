//! One gateway connection from handshake to close.
//!
//! A [`Session`] owns its transport for the whole connection lifetime and
//! drives the handshake: wait for Hello, identify, heartbeat on the cadence
//! the server announced, and forward dispatches to the sink in receipt
//! order. It never reconnects; when the connection is over, [`Session::run`]
//! returns a [`SessionEnd`] and the supervisor decides what happens next.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use qbot_core::ports::DispatchSink;
use qbot_core::Error;

use crate::protocol::{self, Frame, GatewayFrame};
use crate::transport::{GatewayTransport, Inbound};

/// Connection lifecycle, published through a watch channel so observers
/// never block the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is open, waiting for Hello.
    Connecting,
    /// Identify sent, waiting for the first dispatch.
    Identifying,
    /// At least one dispatch received; the session is live.
    Active,
    /// Shutdown requested, closing the transport.
    Closing,
    /// Terminal. The session task has exited.
    Closed,
}

/// Why a session ended. `Stopped` is the only deliberate outcome; the
/// supervisor reconnects after everything else.
#[derive(Debug)]
pub enum SessionEnd {
    /// The server closed the connection.
    Closed { code: u16, reason: String },
    /// A heartbeat went unacknowledged for a full interval.
    DeadConnection,
    /// The transport failed mid-session.
    Transport(Error),
    /// Cancelled via [`Session::cancel_token`].
    Stopped,
}

pub struct Session {
    transport: Box<dyn GatewayTransport>,
    identify: GatewayFrame,
    sink: Arc<dyn DispatchSink>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

enum Step {
    Cancelled,
    HeartbeatDue,
    Inbound(qbot_core::Result<Inbound>),
}

impl Session {
    pub fn new(
        transport: Box<dyn GatewayTransport>,
        identify: GatewayFrame,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            transport,
            identify,
            sink,
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// State observer. Stays readable after the session ends (terminal
    /// value `Closed`), so holders never need the session itself.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives the connection to completion. Consumes the session; the
    /// transport is dropped (and with it the socket) when this returns.
    pub async fn run(self) -> SessionEnd {
        let Session {
            mut transport,
            identify,
            sink,
            state_tx,
            cancel,
        } = self;

        // No heartbeat until Hello announces the cadence.
        let mut heartbeat: Option<Interval> = None;
        let mut ack_pending = false;

        let end = loop {
            // Arms only pick a step; the transport is exclusively borrowed
            // by recv(), so all sends happen after the select.
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = heartbeat_due(&mut heartbeat) => Step::HeartbeatDue,
                inbound = transport.recv() => Step::Inbound(inbound),
            };

            match step {
                Step::Cancelled => {
                    state_tx.send_replace(SessionState::Closing);
                    if let Err(err) = transport.close().await {
                        debug!(error = %err, "close frame not delivered");
                    }
                    break SessionEnd::Stopped;
                }
                Step::HeartbeatDue => {
                    if ack_pending {
                        warn!("heartbeat unacknowledged for a full interval, dropping connection");
                        if let Err(err) = transport.close().await {
                            debug!(error = %err, "close frame not delivered");
                        }
                        break SessionEnd::DeadConnection;
                    }
                    if let Err(err) = transport.send(&protocol::build_heartbeat()).await {
                        break SessionEnd::Transport(err);
                    }
                    ack_pending = true;
                }
                Step::Inbound(Ok(Inbound::Frame(raw))) => match Frame::classify(raw) {
                    Ok(Frame::Hello {
                        heartbeat_interval_ms,
                    }) => {
                        debug!(heartbeat_interval_ms, "hello received, identifying");
                        let period = Duration::from_millis(heartbeat_interval_ms.max(1));
                        // First beat lands one full interval after Hello.
                        let mut timer = interval_at(Instant::now() + period, period);
                        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        heartbeat = Some(timer);
                        ack_pending = false;
                        state_tx.send_replace(SessionState::Identifying);
                        if let Err(err) = transport.send(&identify).await {
                            break SessionEnd::Transport(err);
                        }
                    }
                    Ok(Frame::Dispatch { event, data }) => {
                        // Copy the state out so the watch read guard drops
                        // before send_replace takes the write lock.
                        let current = *state_tx.borrow();
                        match current {
                            SessionState::Identifying => {
                                info!(event = %event, "first dispatch received, session active");
                                state_tx.send_replace(SessionState::Active);
                            }
                            SessionState::Active => {}
                            // Only the first dispatch after identify
                            // activates the session.
                            state => {
                                warn!(state = ?state, event = %event, "dispatch before identify");
                            }
                        }
                        // Awaited inline: events reach the sink one at a
                        // time, in receipt order.
                        sink.on_event(&event, data).await;
                    }
                    Ok(Frame::HeartbeatAck) => {
                        trace!("heartbeat acknowledged");
                        ack_pending = false;
                    }
                    Ok(Frame::Unknown(op)) => {
                        debug!(op, "unknown opcode, ignoring");
                    }
                    Err(err) => {
                        // Frame decoded as JSON but violated the envelope
                        // shape. Not worth tearing the connection down.
                        warn!(error = %err, "malformed frame ignored");
                    }
                },
                Step::Inbound(Ok(Inbound::Closed { code, reason })) => {
                    info!(code, reason = %reason, "connection closed by server");
                    break SessionEnd::Closed { code, reason };
                }
                Step::Inbound(Err(err)) => {
                    warn!(error = %err, "transport failed");
                    break SessionEnd::Transport(err);
                }
            }
        };

        state_tx.send_replace(SessionState::Closed);
        end
    }
}

/// Resolves on the next heartbeat deadline, or never before Hello.
async fn heartbeat_due(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::{advance, Duration};

    use qbot_core::ports::DispatchSink;

    use super::*;
    use crate::protocol::{close_code, opcode};
    use crate::testutil::{
        channel_transport, closed, dispatch, heartbeat_ack, hello, ChannelSink,
    };

    fn session_with_script() -> (
        Session,
        mpsc::UnboundedSender<qbot_core::Result<Inbound>>,
        mpsc::UnboundedReceiver<GatewayFrame>,
        mpsc::UnboundedReceiver<(String, Value)>,
    ) {
        let (transport, in_tx, sent_rx) = channel_transport();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let identify = crate::protocol::build_identify(
            "tok",
            7,
            [0, 1],
            &json!({ "name": "test" }),
        );
        let session = Session::new(
            Box::new(transport),
            identify,
            Arc::new(ChannelSink { tx: sink_tx }),
        );
        (session, in_tx, sent_rx, sink_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn identifies_after_hello_and_activates_on_first_dispatch() {
        let (session, in_tx, mut sent_rx, mut sink_rx) = session_with_script();
        let mut state = session.state_watch();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        let run = tokio::spawn(session.run());

        in_tx.send(hello(30_000)).unwrap();
        let first = sent_rx.recv().await.unwrap();
        assert_eq!(first.op, opcode::IDENTIFY);
        assert_eq!(first.d.unwrap()["token"], "QQBot tok");
        state
            .wait_for(|s| *s == SessionState::Identifying)
            .await
            .unwrap();

        in_tx.send(dispatch("READY", json!({ "user": {} }))).unwrap();
        state.wait_for(|s| *s == SessionState::Active).await.unwrap();
        let (event, _) = sink_rx.recv().await.unwrap();
        assert_eq!(event, "READY");

        drop(in_tx);
        let end = run.await.unwrap();
        assert!(matches!(end, SessionEnd::Closed { code: 1006, .. }));
        assert_eq!(*state.borrow(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_nothing_before_hello() {
        let (session, in_tx, mut sent_rx, _sink_rx) = session_with_script();
        let run = tokio::spawn(session.run());

        advance(Duration::from_secs(120)).await;
        in_tx.send(closed(1000, "bye")).unwrap();

        let end = run.await.unwrap();
        assert!(matches!(end, SessionEnd::Closed { code: 1000, .. }));
        assert!(sent_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_before_hello_is_forwarded_but_does_not_activate() {
        let (session, in_tx, mut sent_rx, mut sink_rx) = session_with_script();
        let mut state = session.state_watch();
        let run = tokio::spawn(session.run());

        in_tx
            .send(dispatch("GROUP_AT_MESSAGE_CREATE", json!({})))
            .unwrap();
        let (event, _) = sink_rx.recv().await.unwrap();
        assert_eq!(event, "GROUP_AT_MESSAGE_CREATE");
        assert_eq!(*state.borrow(), SessionState::Connecting);

        // The normal handshake still activates afterwards.
        in_tx.send(hello(30_000)).unwrap();
        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::IDENTIFY);
        in_tx.send(dispatch("READY", json!({}))).unwrap();
        state.wait_for(|s| *s == SessionState::Active).await.unwrap();

        session_end(run, in_tx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_on_announced_cadence() {
        let (session, in_tx, mut sent_rx, _sink_rx) = session_with_script();
        let run = tokio::spawn(session.run());

        in_tx.send(hello(5_000)).unwrap();
        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::IDENTIFY);

        let beat = sent_rx.recv().await.unwrap();
        assert_eq!(beat.op, opcode::HEARTBEAT);
        assert_eq!(beat.d, None);
        in_tx.send(heartbeat_ack()).unwrap();

        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::HEARTBEAT);
        in_tx.send(heartbeat_ack()).unwrap();

        session_end(run, in_tx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_ends_session_as_dead() {
        let (session, in_tx, mut sent_rx, _sink_rx) = session_with_script();
        let run = tokio::spawn(session.run());

        in_tx.send(hello(1_000)).unwrap();
        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::IDENTIFY);
        // First beat goes out unanswered; the second deadline detects it.
        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::HEARTBEAT);

        let end = run.await.unwrap();
        assert!(matches!(end, SessionEnd::DeadConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_code_is_surfaced() {
        let (session, in_tx, mut sent_rx, _sink_rx) = session_with_script();
        let run = tokio::spawn(session.run());

        in_tx.send(hello(30_000)).unwrap();
        assert_eq!(sent_rx.recv().await.unwrap().op, opcode::IDENTIFY);
        in_tx
            .send(closed(close_code::BAD_AUTH, "authentication failed"))
            .unwrap();

        let end = run.await.unwrap();
        match end {
            SessionEnd::Closed { code, reason } => {
                assert_eq!(code, close_code::BAD_AUTH);
                assert_eq!(reason, "authentication failed");
            }
            other => panic!("unexpected end: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_session() {
        let (session, _in_tx, _sent_rx, _sink_rx) = session_with_script();
        let cancel = session.cancel_token();
        let run = tokio::spawn(session.run());

        cancel.cancel();
        let end = run.await.unwrap();
        assert!(matches!(end, SessionEnd::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_forwarded_in_order_without_overlap() {
        struct SlowSink {
            busy: AtomicBool,
            tx: mpsc::UnboundedSender<String>,
        }

        #[async_trait]
        impl DispatchSink for SlowSink {
            async fn on_event(&self, event_type: &str, _event_data: Value) {
                assert!(
                    !self.busy.swap(true, Ordering::SeqCst),
                    "sink re-entered while a delivery was in flight"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.busy.store(false, Ordering::SeqCst);
                let _ = self.tx.send(event_type.to_string());
            }
        }

        let (transport, in_tx, _sent_rx) = channel_transport();
        let (tx, mut order_rx) = mpsc::unbounded_channel();
        let identify = crate::protocol::build_identify("tok", 0, [0, 1], &json!({}));
        let session = Session::new(
            Box::new(transport),
            identify,
            Arc::new(SlowSink {
                busy: AtomicBool::new(false),
                tx,
            }),
        );
        let run = tokio::spawn(session.run());

        in_tx.send(hello(60_000)).unwrap();
        for name in ["READY", "GROUP_AT_MESSAGE_CREATE", "C2C_MESSAGE_CREATE"] {
            in_tx.send(dispatch(name, json!({ "id": name }))).unwrap();
        }

        for expected in ["READY", "GROUP_AT_MESSAGE_CREATE", "C2C_MESSAGE_CREATE"] {
            assert_eq!(order_rx.recv().await.unwrap(), expected);
        }
        session_end(run, in_tx).await;
    }

    async fn session_end(
        run: tokio::task::JoinHandle<SessionEnd>,
        in_tx: mpsc::UnboundedSender<qbot_core::Result<Inbound>>,
    ) {
        drop(in_tx);
        run.await.unwrap();
    }
}
