//! Gateway HTTP server: webhook, health and reply routes on a single port.

use crate::channels::{
    DispatchError, MessageBus, OutboundReply, PendingReply, PendingReplyRegistry, ReplyDispatcher,
};
use crate::config::{self, Config, ResolvedTokens};
use crate::gateway::webhook;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shared state for the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Resolved WeChat auth token (config or WXGATE_AUTH_TOKEN).
    pub auth_token: Arc<str>,
    /// When Some, the reply route requires `Authorization: Bearer <token>`.
    pub reply_token: Option<Arc<str>>,
    pub registry: Arc<PendingReplyRegistry>,
    pub dispatcher: ReplyDispatcher,
    pub bus: Arc<dyn MessageBus>,
}

/// A configured gateway, ready to serve. Take [`Gateway::dispatcher`] before serving to
/// deliver replies from elsewhere in the process.
pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    /// Validate `config` with tokens resolved from the process environment.
    pub fn new(config: Config, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let tokens = ResolvedTokens::from_env(&config);
        Self::with_tokens(config, tokens, bus)
    }

    /// Validate `config` against already resolved `tokens`. Fails when no auth token is set.
    pub fn with_tokens(
        config: Config,
        tokens: ResolvedTokens,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        config::validate(&config, &tokens)?;
        let auth_token = tokens.auth.context(
            "wechat auth token not configured (set wechat.authToken or WXGATE_AUTH_TOKEN)",
        )?;
        let reply_token = tokens.reply.map(Arc::from);
        let registry = Arc::new(PendingReplyRegistry::new());
        let dispatcher = ReplyDispatcher::new(registry.clone());
        Ok(Self {
            state: GatewayState {
                config: Arc::new(config),
                auth_token: Arc::from(auth_token),
                reply_token,
                registry,
                dispatcher,
                bus,
            },
        })
    }

    pub fn dispatcher(&self) -> ReplyDispatcher {
        self.state.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<PendingReplyRegistry> {
        self.state.registry.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind to gateway.bind:gateway.port and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.state.config.gateway.bind.trim(),
            self.state.config.gateway.port
        );
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        log::info!("gateway listening on {}", bind_addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` completes. On shutdown every still-pending
    /// request is answered with 503 so in-flight connections can drain.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let registry = self.state.registry.clone();
        let pending = &self.state.config.pending;
        let sweeper = pending
            .ttl()
            .map(|ttl| spawn_sweeper(registry.clone(), ttl, pending.sweep_interval()));
        let app = self.router();

        let drain_on_shutdown = async move {
            shutdown.await;
            let drained = registry.drain(PendingReply::Unavailable).await;
            log::info!(
                "shutdown: released {} pending request(s), draining connections",
                drained
            );
        };

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(drain_on_shutdown)
            .await
            .context("gateway server exited");
        if let Some(handle) = sweeper {
            handle.abort();
        }
        log::info!("gateway stopped");
        result
    }
}

/// Build the router: webhook (GET/POST), health (GET) and, when configured, reply (POST).
pub fn router(state: GatewayState) -> Router {
    let config = state.config.clone();
    let mut app = Router::new()
        .route(&config.gateway.health_path, get(health_http))
        .route(
            &config.gateway.webhook_path,
            get(webhook::verify_handshake).post(webhook::receive_push),
        );
    if let Some(ref path) = config.gateway.reply_path {
        app = app.route(path, post(post_reply));
    }
    app.with_state(state)
}

/// Build a gateway for `config` and run it until shutdown.
pub async fn run_gateway(config: Config, bus: Arc<dyn MessageBus>) -> Result<()> {
    Gateway::new(config, bus)?.run().await
}

fn spawn_sweeper(
    registry: Arc<PendingReplyRegistry>,
    ttl: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = registry.sweep(ttl).await;
            if evicted > 0 {
                log::info!("evicted {} stale pending request(s)", evicted);
            }
        }
    })
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET <health-path> returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "pending": state.registry.size().await,
    }))
}

/// POST <reply-path> with JSON `{inReplyTo, content}`; completes the matching push request.
async fn post_reply(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(ref expected) = state.reply_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != &**expected {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid reply token" })),
            );
        }
    }
    let reply: OutboundReply = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    };
    match state.dispatcher.handle_outbound_reply(&reply).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "delivered": true }))),
        Err(e @ DispatchError::UnmatchedReply { .. }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "delivered": false, "error": e.to_string() })),
        ),
        Err(e @ DispatchError::ChannelWriteFailure { .. }) => (
            StatusCode::GONE,
            Json(json!({ "delivered": false, "error": e.to_string() })),
        ),
    }
}
