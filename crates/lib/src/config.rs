//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wxgate/config.json`) and environment.
//! Every section is optional; missing keys fall back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener and HTTP path settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// WeChat app settings (shared secret, push verification).
    #[serde(default)]
    pub wechat: WechatConfig,

    /// Lifetime policy for connections held open awaiting a reply.
    #[serde(default)]
    pub pending: PendingConfig,
}

/// Gateway bind, port, and HTTP paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Path WeChat calls for the handshake (GET) and push delivery (POST).
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    /// Path for health probes.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// When set, replies can be posted to this path as JSON `{inReplyTo, content}`.
    #[serde(default)]
    pub reply_path: Option<String>,

    /// Bearer token for the reply path. Overridden by WXGATE_REPLY_TOKEN env.
    #[serde(default)]
    pub reply_token: Option<String>,
}

/// WeChat app config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WechatConfig {
    /// Token configured in the WeChat admin console; used for handshake signatures.
    /// Overridden by WXGATE_AUTH_TOKEN env when set.
    pub auth_token: Option<String>,

    /// When true, push deliveries must also carry a valid signature/timestamp/nonce query.
    #[serde(default)]
    pub verify_push_signature: bool,
}

/// Pending reply lifetime. `ttlSecs = 0` keeps held connections open indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_path() -> String {
    "/api/v1/wechat/".to_string()
}

fn default_health_path() -> String {
    "/health/".to_string()
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            webhook_path: default_webhook_path(),
            health_path: default_health_path(),
            reply_path: None,
            reply_token: None,
        }
    }
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl PendingConfig {
    /// Maximum age of a pending entry, or None when eviction is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Secrets after applying env overrides to the config values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTokens {
    /// WeChat auth token: env WXGATE_AUTH_TOKEN overrides wechat.authToken.
    pub auth: Option<String>,
    /// Reply endpoint token: env WXGATE_REPLY_TOKEN overrides gateway.replyToken.
    pub reply: Option<String>,
}

impl ResolvedTokens {
    /// Resolve against the process environment.
    pub fn from_env(config: &Config) -> Self {
        Self::resolve(config, |key| std::env::var(key).ok())
    }

    /// Resolve with `env` standing in for the process environment.
    pub fn resolve(config: &Config, env: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| non_empty(env(key).as_ref());
        Self {
            auth: lookup("WXGATE_AUTH_TOKEN")
                .or_else(|| non_empty(config.wechat.auth_token.as_ref())),
            reply: lookup("WXGATE_REPLY_TOKEN")
                .or_else(|| non_empty(config.gateway.reply_token.as_ref())),
        }
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Check path shapes and the reply endpoint's exposure. Called before the listener binds.
pub fn validate(config: &Config, tokens: &ResolvedTokens) -> Result<()> {
    let g = &config.gateway;
    let mut paths = vec![("webhookPath", &g.webhook_path), ("healthPath", &g.health_path)];
    if let Some(ref p) = g.reply_path {
        paths.push(("replyPath", p));
    }
    for (name, path) in &paths {
        if !path.starts_with('/') {
            anyhow::bail!("gateway.{} must start with '/', got {:?}", name, path);
        }
    }
    for (i, (a_name, a)) in paths.iter().enumerate() {
        for (b_name, b) in &paths[i + 1..] {
            if a == b {
                anyhow::bail!("gateway.{} and gateway.{} are both {:?}", a_name, b_name, a);
            }
        }
    }
    if g.reply_path.is_some()
        && !is_loopback_bind(&g.bind)
        && tokens.reply.is_none()
    {
        anyhow::bail!(
            "refusing to expose gateway.replyPath on {} without a reply token (set gateway.replyToken or WXGATE_REPLY_TOKEN)",
            g.bind
        );
    }
    Ok(())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WXGATE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".wxgate").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
