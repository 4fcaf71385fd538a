//! Outbound call gateway: authenticated HTTP requests through the fixed
//! reverse proxy, gated on credential freshness.

use reqwest::header::AUTHORIZATION;
pub use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use qbot_core::{
    config::Config,
    domain::{GroupId, SendOptions, UserId},
    Error, Result,
};

use crate::token::TokenManager;

/// One outbound call; ephemeral, never persisted.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Bypass the managed credential for this one call.
    pub token_override: Option<String>,
}

/// Response body as the proxy returned it: parsed when well-formed JSON,
/// otherwise the raw text unchanged. The gateway stays transport-agnostic
/// and raises no decoding error for non-JSON bodies.
#[derive(Clone, Debug)]
pub enum ApiResponse {
    Json(Value),
    Raw(String),
}

impl ApiResponse {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ApiResponse::Json(v) => Some(v),
            ApiResponse::Raw(_) => None,
        }
    }

    fn into_json(self, context: &str) -> Result<Value> {
        match self {
            ApiResponse::Json(v) => Ok(v),
            ApiResponse::Raw(raw) => {
                let head: String = raw.chars().take(200).collect();
                Err(Error::Protocol(format!("non-JSON {context} response: {head}")))
            }
        }
    }
}

/// Issues authenticated calls through the configured reverse proxy with
/// header `Authorization: QQBot <token>`.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
}

impl ApiClient {
    pub fn new(cfg: &Config, tokens: TokenManager) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.call_timeout)
            .build()
            .expect("reqwest client build");
        Self {
            http,
            base_url: format!("http://{}:{}", cfg.proxy_hostname, cfg.proxy_port),
            tokens,
        }
    }

    pub async fn call(&self, path: &str, method: Method, body: Option<Value>) -> Result<ApiResponse> {
        self.request(OutboundRequest {
            path: path.to_string(),
            method,
            body,
            token_override: None,
        })
        .await
    }

    /// Issue an outbound request.
    ///
    /// Freshness gate: an invalid credential is renewed once and the call
    /// retried with the fresh token; a second consecutive invalidity fails
    /// with [`Error::Auth`] rather than looping.
    pub async fn request(&self, req: OutboundRequest) -> Result<ApiResponse> {
        let mut refreshed = false;
        loop {
            if req.token_override.is_none() && !self.tokens.is_valid() {
                if refreshed {
                    return Err(Error::Auth {
                        code: None,
                        message: "credential still invalid after refresh".to_string(),
                    });
                }
                debug!(path = %req.path, "credential inside safety margin, refreshing");
                self.tokens.ensure_fresh().await?;
                refreshed = true;
                continue;
            }

            let token = match &req.token_override {
                Some(t) => t.clone(),
                None => self.tokens.current_token()?,
            };
            return self.send(&req, &token).await;
        }
    }

    async fn send(&self, req: &OutboundRequest, token: &str) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .header(AUTHORIZATION, format!("QQBot {token}"));
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Transport(format!("outbound call failed: {e}"))
            }
        })?;
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Transport(format!("outbound body unreadable: {e}")))?;

        match serde_json::from_str::<Value>(&text) {
            Ok(v) => Ok(ApiResponse::Json(v)),
            Err(_) => Ok(ApiResponse::Raw(text)),
        }
    }

    /// Resolve the platform's persistent-connection endpoint, with the
    /// protocol version and encoding query parameters appended.
    pub async fn gateway_url(&self) -> Result<String> {
        let v = self
            .call("/gateway", Method::GET, None)
            .await?
            .into_json("gateway")?;
        fail_on_platform_code(&v)?;
        let url = v
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("gateway response missing url".to_string()))?;
        Ok(format!("{url}?v=9&encoding=json"))
    }

    /// Send a message to a group. Not idempotent; never retried here.
    pub async fn send_group_message(
        &self,
        group: &GroupId,
        content: &str,
        opts: &SendOptions,
    ) -> Result<Value> {
        self.send_message(&format!("/v2/groups/{}/messages", group.0), content, opts)
            .await
    }

    /// Send a direct message to a user. Not idempotent; never retried here.
    pub async fn send_private_message(
        &self,
        user: &UserId,
        content: &str,
        opts: &SendOptions,
    ) -> Result<Value> {
        self.send_message(&format!("/v2/users/{}/messages", user.0), content, opts)
            .await
    }

    async fn send_message(&self, path: &str, content: &str, opts: &SendOptions) -> Result<Value> {
        let mut body = serde_json::json!({
            "content": content,
            "msg_type": opts.msg_type as u8,
        });
        if let Some(md) = &opts.markdown {
            body["markdown"] = md.clone();
        }
        if let Some(media) = &opts.media {
            body["media"] = media.clone();
        }
        if let Some(id) = &opts.reply_to_msg_id {
            body["msg_id"] = Value::String(id.0.clone());
        }
        if let Some(id) = &opts.event_id {
            body["event_id"] = Value::String(id.0.clone());
        }

        let v = self
            .call(path, Method::POST, Some(body))
            .await?
            .into_json("send-message")?;
        fail_on_platform_code(&v)?;
        debug!(path, id = ?v.get("id"), "message sent");
        Ok(v)
    }
}

/// A `{code, message}` body means the platform rejected the call; surface
/// the code/message verbatim and leave no partial success behind.
fn fail_on_platform_code(v: &Value) -> Result<()> {
    if let Some(code) = v.get("code").and_then(Value::as_i64) {
        return Err(Error::Api {
            code,
            message: v
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }
    Ok(())
}
