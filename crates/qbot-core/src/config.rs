use std::{
    env, fs,
    path::Path,
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the bot.
///
/// Everything is read from environment variables (with `.env` support that
/// never overrides existing env). Missing credentials are fatal at startup;
/// nothing retries a misconfigured process.
#[derive(Clone, Debug)]
pub struct Config {
    // Platform credentials
    pub app_id: String,
    pub app_secret: String,

    /// Token endpoint. Overridable for tests.
    pub auth_url: String,

    // Reverse proxy all outbound calls go through
    pub proxy_hostname: String,
    pub proxy_port: u16,

    // Identify payload
    pub intents: u32,
    pub shard: [u32; 2],
    pub properties: serde_json::Value,

    // Runtime constants
    pub call_timeout: Duration,
    pub health_check_interval: Duration,
}

/// Default capability bitmask: group/C2C message intents.
pub const DEFAULT_INTENTS: u32 = (1 << 25) | (1 << 26) | (1 << 27);

const DEFAULT_AUTH_URL: &str = "https://bots.qq.com/app/getAppAccessToken";

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let app_id = env_str("QQ_APP_ID").and_then(non_empty).ok_or_else(|| {
            Error::Config("QQ_APP_ID environment variable is required".to_string())
        })?;
        let app_secret = env_str("QQ_APP_SECRET").and_then(non_empty).ok_or_else(|| {
            Error::Config("QQ_APP_SECRET environment variable is required".to_string())
        })?;

        let auth_url = env_str("QQ_AUTH_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string());

        let proxy_hostname = env_str("QQ_PROXY_HOST").and_then(non_empty).ok_or_else(|| {
            Error::Config("QQ_PROXY_HOST environment variable is required".to_string())
        })?;
        let proxy_port = env_u16("QQ_PROXY_PORT").unwrap_or(80);

        let intents = env_u32("QQ_INTENTS").unwrap_or(DEFAULT_INTENTS);
        let shard = parse_shard(env_str("QQ_SHARD").as_deref().unwrap_or("0,1"))?;

        let client_name = env_str("QQ_CLIENT_NAME")
            .and_then(non_empty)
            .unwrap_or_else(|| "qbot".to_string());
        let properties = serde_json::json!({
            "$os": std::env::consts::OS,
            "$browser": client_name,
            "$device": client_name,
        });

        let call_timeout = Duration::from_millis(env_u64("CALL_TIMEOUT_MS").unwrap_or(10_000));
        let health_check_interval =
            Duration::from_secs(env_u64("HEALTH_CHECK_INTERVAL_SECS").unwrap_or(300));

        Ok(Self {
            app_id,
            app_secret,
            auth_url,
            proxy_hostname,
            proxy_port,
            intents,
            shard,
            properties,
            call_timeout,
            health_check_interval,
        })
    }
}

/// Parses a shard pair `"id,count"`.
fn parse_shard(raw: &str) -> Result<[u32; 2]> {
    let parts: Vec<u32> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid shard value: {s}")))
        })
        .collect::<Result<_>>()?;
    if parts.len() != 2 {
        return Err(Error::Config(format!(
            "QQ_SHARD must be \"id,count\", got {raw:?}"
        )));
    }
    if parts[1] == 0 || parts[0] >= parts[1] {
        return Err(Error::Config(format!(
            "shard id must be < shard count, got {raw:?}"
        )));
    }
    Ok([parts[0], parts[1]])
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
