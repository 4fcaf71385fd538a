//! Credential manager: acquires the platform access token and renews it
//! autonomously ahead of expiry.
//!
//! The credential is owned here exclusively. Consumers never see it by
//! reference; they ask [`TokenManager::is_valid`] or take a clone of the
//! current value, and every replacement is atomic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use qbot_core::{config::Config, Error, Result};

/// Lead time before actual expiry at which a credential is treated as
/// already invalid.
const SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Background renewal fires this many seconds before expiry…
const RENEW_LEAD_SECS: u64 = 30;
/// …but never sooner than this after acquisition.
const RENEW_FLOOR_SECS: u64 = 10;
/// A failed scheduled renewal retries once after this long.
const RENEW_RETRY: Duration = Duration::from_secs(10);
/// The platform's documented default when `expires_in` is absent.
const DEFAULT_EXPIRES_IN_SECS: u64 = 600;

/// An access token with its validity window.
#[derive(Clone, Debug)]
struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    fn new(token: String, expires_in: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + expires_in,
        }
    }

    /// Valid iff now is still outside the safety margin.
    fn is_valid(&self) -> bool {
        self.expires_at
            .checked_sub(SAFETY_MARGIN)
            .is_some_and(|edge| Instant::now() < edge)
    }

    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Acquires and renews the access token used by all outbound calls.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    http: reqwest::Client,
    auth_url: String,
    app_id: String,
    app_secret: String,
    credential: Mutex<Option<Credential>>,
    /// Serializes acquisitions so an expiry check never doubles a renewal
    /// already in flight.
    acquire_lock: tokio::sync::Mutex<()>,
    /// Background renewal state; one timer token, one purpose.
    renewal: Mutex<RenewalSlot>,
}

/// The stopped flag lives under the same lock as the timer token so a fetch
/// finishing after `stop_renewal` can never install a new timer.
#[derive(Default)]
struct RenewalSlot {
    stopped: bool,
    timer: Option<CancellationToken>,
}

impl TokenManager {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.call_timeout)
            .build()
            .expect("reqwest client build");
        Self {
            inner: Arc::new(TokenInner {
                http,
                auth_url: cfg.auth_url.clone(),
                app_id: cfg.app_id.clone(),
                app_secret: cfg.app_secret.clone(),
                credential: Mutex::new(None),
                acquire_lock: tokio::sync::Mutex::new(()),
                renewal: Mutex::new(RenewalSlot::default()),
            }),
        }
    }

    /// True iff a credential is held and outside the safety margin.
    pub fn is_valid(&self) -> bool {
        self.inner
            .credential
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .is_some_and(Credential::is_valid)
    }

    /// Current token value, cloned out.
    pub fn current_token(&self) -> Result<String> {
        self.inner
            .credential
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .map(|c| c.token.clone())
            .ok_or(Error::NoCredential)
    }

    /// Remaining lifetime of the held credential, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .credential
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .map(Credential::remaining)
    }

    /// Fetch a fresh token, store it, and (re)schedule background renewal.
    /// Re-arms renewal after a previous [`stop_renewal`](Self::stop_renewal).
    pub async fn acquire(&self) -> Result<()> {
        self.inner
            .renewal
            .lock()
            .expect("renewal lock poisoned")
            .stopped = false;
        self.renew().await
    }

    /// Internal acquisition path: never re-arms a stopped renewal schedule,
    /// so the background timer uses this rather than `acquire`.
    async fn renew(&self) -> Result<()> {
        let _guard = self.inner.acquire_lock.lock().await;
        let expires_in = self.fetch_and_store().await?;
        self.schedule_renewal(expires_in);
        Ok(())
    }

    /// Acquire only if the held credential is inside the safety margin.
    ///
    /// Single-flight: a caller arriving while another renewal is in flight
    /// waits for it and revalidates instead of fetching again.
    pub async fn ensure_fresh(&self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let _guard = self.inner.acquire_lock.lock().await;
        if self.is_valid() {
            return Ok(()); // renewed while we waited
        }
        let expires_in = self.fetch_and_store().await?;
        self.schedule_renewal(expires_in);
        Ok(())
    }

    /// Cancel background renewal, including a renewal already in flight: a
    /// fetch that completes after this call stores its token but does not
    /// schedule another timer. The held credential stays usable until it
    /// actually expires.
    pub fn stop_renewal(&self) {
        let taken = {
            let mut slot = self.inner.renewal.lock().expect("renewal lock poisoned");
            slot.stopped = true;
            slot.timer.take()
        };
        if let Some(tok) = taken {
            tok.cancel();
        }
    }

    /// Whether a background renewal timer is currently armed.
    #[cfg(test)]
    fn renewal_scheduled(&self) -> bool {
        self.inner
            .renewal
            .lock()
            .expect("renewal lock poisoned")
            .timer
            .is_some()
    }

    async fn fetch_and_store(&self) -> Result<Duration> {
        let body = serde_json::json!({
            "appId": self.inner.app_id,
            "clientSecret": self.inner.app_secret,
        });

        let resp = self
            .inner
            .http
            .post(&self.inner.auth_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("token request failed: {e}")))?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("token response unreadable: {e}")))?;

        if let Some(token) = v.get("access_token").and_then(Value::as_str) {
            let expires_in =
                Duration::from_secs(as_seconds(v.get("expires_in")).unwrap_or(DEFAULT_EXPIRES_IN_SECS));
            self.install(token.to_string(), expires_in);
            info!(expires_in_secs = expires_in.as_secs(), "access token acquired");
            Ok(expires_in)
        } else if v.get("code").is_some() {
            Err(Error::Auth {
                code: v.get("code").and_then(Value::as_i64),
                message: v
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            })
        } else {
            Err(Error::Auth {
                code: None,
                message: "unrecognized token response".to_string(),
            })
        }
    }

    /// Replace the held credential. Also the seam tests use to install a
    /// near-expiry credential without a network round trip.
    pub(crate) fn install(&self, token: String, expires_in: Duration) {
        let mut slot = self
            .inner
            .credential
            .lock()
            .expect("credential lock poisoned");
        *slot = Some(Credential::new(token, expires_in));
    }

    /// Delay before the next background renewal for a token valid for
    /// `expires_in`: `max(expires_in − 30s, 10s)`.
    fn renew_delay(expires_in: Duration) -> Duration {
        Duration::from_secs(
            expires_in
                .as_secs()
                .saturating_sub(RENEW_LEAD_SECS)
                .max(RENEW_FLOOR_SECS),
        )
    }

    fn schedule_renewal(&self, expires_in: Duration) {
        let delay = Self::renew_delay(expires_in);
        let tok = CancellationToken::new();
        {
            let mut slot = self.inner.renewal.lock().expect("renewal lock poisoned");
            if slot.stopped {
                debug!("renewal stopped, not rescheduling");
                return;
            }
            // Cancel-then-set: never two renewal timers at once.
            if let Some(prev) = slot.timer.replace(tok.clone()) {
                prev.cancel();
            }
        }
        debug!(delay_secs = delay.as_secs(), "scheduled token renewal");

        let mgr = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tok.cancelled() => return,
                _ = sleep(delay) => {}
            }
            if let Err(e) = mgr.renew().await {
                warn!(error = %e, "scheduled token renewal failed, retrying in 10s");
                tokio::select! {
                    _ = tok.cancelled() => return,
                    _ = sleep(RENEW_RETRY) => {}
                }
                if let Err(e) = mgr.renew().await {
                    // Keep running: the stale credential stays usable until
                    // it actually expires, and the next expiry check will
                    // trigger another acquire.
                    error!(error = %e, "token renewal retry failed");
                }
            }
        });
    }
}

/// `expires_in` arrives as a number, but some platform responses carry it as
/// a numeric string.
fn as_seconds(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
}
