//! Keeps exactly one gateway session alive.
//!
//! The supervisor owns two background tasks: a supervise loop that connects,
//! runs a [`Session`] to completion, and reconnects with exponential backoff;
//! and a periodic health check that refreshes a near-expiry credential and
//! asks the supervise loop to cycle a session stuck outside `Active`.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use qbot_core::config::Config;
use qbot_core::ports::{DispatchSink, LogSink};
use qbot_core::Result;

use crate::api::ApiClient;
use crate::backoff::ReconnectPolicy;
use crate::protocol;
use crate::session::{Session, SessionEnd, SessionState};
use crate::token::TokenManager;
use crate::transport::{Connector, WsConnector};

/// Credential margin at which the health check refreshes proactively.
const HEALTH_TOKEN_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupInner>,
}

struct SupInner {
    cfg: Arc<Config>,
    tokens: TokenManager,
    api: ApiClient,
    sink: Mutex<Arc<dyn DispatchSink>>,
    connector: Mutex<Arc<dyn Connector>>,
    state: Mutex<SupState>,
}

#[derive(Default)]
struct SupState {
    running: bool,
    supervise: Option<TaskHandle>,
    health: Option<TaskHandle>,
    session_cancel: Option<CancellationToken>,
    session_state: Option<watch::Receiver<SessionState>>,
    nudge_tx: Option<mpsc::Sender<()>>,
}

struct TaskHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What the supervise loop should do after a session attempt.
enum Outcome {
    Retry,
    Shutdown,
}

impl Supervisor {
    pub fn new(cfg: Arc<Config>, tokens: TokenManager, api: ApiClient) -> Self {
        Self {
            inner: Arc::new(SupInner {
                cfg,
                tokens,
                api,
                sink: Mutex::new(Arc::new(LogSink)),
                connector: Mutex::new(Arc::new(WsConnector)),
                state: Mutex::new(SupState::default()),
            }),
        }
    }

    /// Replace the dispatch sink. Takes effect for the next session.
    pub fn set_sink(&self, sink: Arc<dyn DispatchSink>) {
        *self.inner.sink.lock().expect("sink lock poisoned") = sink;
    }

    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self.inner.connector.lock().expect("connector lock poisoned") = connector;
    }

    /// Acquires the initial credential, then spawns the supervise and health
    /// loops. A rejected or unreachable credential endpoint fails the start;
    /// there is nothing to retry until the configuration changes.
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock().expect("supervisor state lock poisoned");
            if st.running {
                return Ok(());
            }
            st.running = true;
        }

        if let Err(err) = self.inner.tokens.acquire().await {
            let mut st = self.inner.state.lock().expect("supervisor state lock poisoned");
            st.running = false;
            return Err(err);
        }

        let (nudge_tx, nudge_rx) = mpsc::channel(1);

        let supervise_cancel = CancellationToken::new();
        let sup = self.clone();
        let cancel = supervise_cancel.clone();
        let supervise_handle = tokio::spawn(async move { sup.supervise_loop(cancel, nudge_rx).await });

        let health_cancel = CancellationToken::new();
        let sup = self.clone();
        let cancel = health_cancel.clone();
        let health_handle = tokio::spawn(async move { sup.health_loop(cancel).await });

        let mut st = self.inner.state.lock().expect("supervisor state lock poisoned");
        st.nudge_tx = Some(nudge_tx);
        st.supervise = Some(TaskHandle {
            cancel: supervise_cancel,
            handle: supervise_handle,
        });
        st.health = Some(TaskHandle {
            cancel: health_cancel,
            handle: health_handle,
        });
        info!("supervisor started");
        Ok(())
    }

    /// Stops both loops, cancels the live session, and halts credential
    /// renewal. Idempotent; concurrent callers race for the handles and the
    /// losers return immediately.
    pub async fn stop(&self) {
        let (supervise, health, session_cancel) = {
            let mut st = self.inner.state.lock().expect("supervisor state lock poisoned");
            if !st.running {
                return;
            }
            st.running = false;
            st.nudge_tx = None;
            st.session_state = None;
            (st.supervise.take(), st.health.take(), st.session_cancel.take())
        };

        if let Some(task) = &supervise {
            task.cancel.cancel();
        }
        if let Some(task) = &health {
            task.cancel.cancel();
        }
        if let Some(token) = session_cancel {
            token.cancel();
        }
        self.inner.tokens.stop_renewal();

        if let Some(task) = supervise {
            let _ = task.handle.await;
        }
        if let Some(task) = health {
            let _ = task.handle.await;
        }
        info!("supervisor stopped");
    }

    /// Current session state, `None` before the first connection attempt.
    pub fn session_state(&self) -> Option<SessionState> {
        let st = self.inner.state.lock().expect("supervisor state lock poisoned");
        st.session_state.as_ref().map(|rx| *rx.borrow())
    }

    async fn supervise_loop(self, cancel: CancellationToken, mut nudge_rx: mpsc::Receiver<()>) {
        let mut policy = ReconnectPolicy::new();
        loop {
            match self.run_one_session(&cancel, &mut policy, &mut nudge_rx).await {
                Outcome::Shutdown => break,
                Outcome::Retry => {
                    let delay = policy.next_delay();
                    warn!(
                        attempt = policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        debug!("supervise loop exited");
    }

    async fn run_one_session(
        &self,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
        nudge_rx: &mut mpsc::Receiver<()>,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Shutdown;
        }

        // Identify needs a live token; refresh failures are retried with
        // backoff like any other connection failure.
        if let Err(err) = self.inner.tokens.ensure_fresh().await {
            warn!(error = %err, "credential refresh failed before connect");
            return Outcome::Retry;
        }
        let url = match self.inner.api.gateway_url().await {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "gateway endpoint lookup failed");
                return Outcome::Retry;
            }
        };
        let connector = self
            .inner
            .connector
            .lock()
            .expect("connector lock poisoned")
            .clone();
        let transport = match connector.connect(&url).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(error = %err, url = %url, "gateway connect failed");
                return Outcome::Retry;
            }
        };
        let token = match self.inner.tokens.current_token() {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "credential vanished between refresh and identify");
                return Outcome::Retry;
            }
        };
        let identify = protocol::build_identify(
            &token,
            self.inner.cfg.intents,
            self.inner.cfg.shard,
            &self.inner.cfg.properties,
        );
        let sink = self.inner.sink.lock().expect("sink lock poisoned").clone();

        let session = Session::new(transport, identify, sink);
        let mut state_rx = session.state_watch();
        let session_cancel = session.cancel_token();
        {
            let mut st = self.inner.state.lock().expect("supervisor state lock poisoned");
            st.session_cancel = Some(session_cancel.clone());
            st.session_state = Some(state_rx.clone());
        }
        // Pending nudges refer to the previous session.
        while nudge_rx.try_recv().is_ok() {}

        let mut run = tokio::spawn(session.run());

        enum Picked {
            Shutdown,
            Nudge,
            StateChanged,
            Ended(std::result::Result<SessionEnd, tokio::task::JoinError>),
        }

        loop {
            let picked = tokio::select! {
                biased;
                _ = cancel.cancelled() => Picked::Shutdown,
                Some(()) = nudge_rx.recv() => Picked::Nudge,
                Ok(()) = state_rx.changed() => Picked::StateChanged,
                end = &mut run => Picked::Ended(end),
            };
            match picked {
                Picked::Shutdown => {
                    session_cancel.cancel();
                    let _ = run.await;
                    return Outcome::Shutdown;
                }
                Picked::Nudge => {
                    warn!("health check requested a session cycle");
                    session_cancel.cancel();
                    let _ = run.await;
                    return Outcome::Retry;
                }
                Picked::StateChanged => {
                    if *state_rx.borrow_and_update() == SessionState::Active {
                        // A live session proves the endpoint works again.
                        policy.reset();
                    }
                }
                Picked::Ended(end) => {
                    return match end {
                        Ok(SessionEnd::Stopped) => Outcome::Shutdown,
                        Ok(end) => {
                            warn!(end = ?end, "session ended");
                            Outcome::Retry
                        }
                        Err(err) => {
                            warn!(error = %err, "session task panicked");
                            Outcome::Retry
                        }
                    };
                }
            }
        }
    }

    async fn health_loop(self, cancel: CancellationToken) {
        let period = self.inner.cfg.health_check_interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            if self
                .inner
                .tokens
                .remaining()
                .is_some_and(|left| left < HEALTH_TOKEN_MARGIN)
            {
                debug!("health check: credential near expiry, refreshing");
                if let Err(err) = self.inner.tokens.ensure_fresh().await {
                    warn!(error = %err, "health check credential refresh failed");
                }
            }

            let state = self.session_state();
            if state != Some(SessionState::Active) {
                warn!(state = ?state, "health check: session not active, requesting cycle");
                let nudge = {
                    let st = self.inner.state.lock().expect("supervisor state lock poisoned");
                    st.nudge_tx.clone()
                };
                if let Some(tx) = nudge {
                    // Capacity 1: a queued nudge already covers this.
                    let _ = tx.try_send(());
                }
            } else {
                debug!("health check: session active");
            }
        }
        debug!("health loop exited");
    }
}
