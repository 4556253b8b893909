//! Webhook handlers: handshake (GET) and push delivery (POST) on the webhook path.

use crate::channels::{PendingChannel, PendingReply};
use crate::gateway::server::GatewayState;
use crate::wechat::{self, SignatureQuery};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// GET: answers the handshake with `echostr` on a valid signature, otherwise an empty body.
/// Always 200; WeChat reads the empty body as rejection.
pub(crate) async fn verify_handshake(
    State(state): State<GatewayState>,
    query: Option<Query<SignatureQuery>>,
) -> String {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let body = query.handshake_response(&state.auth_token);
    if body.is_empty() {
        log::debug!("handshake rejected");
    } else {
        log::info!("handshake verified");
    }
    body
}

/// POST: parses the push, registers the still-open response under its message id, hands
/// the event to the bus, then waits for the reply (or another completion) before answering.
pub(crate) async fn receive_push(
    State(state): State<GatewayState>,
    query: Option<Query<SignatureQuery>>,
    body: Bytes,
) -> Response {
    if state.config.wechat.verify_push_signature {
        let signed = query
            .map(|Query(q)| q.is_signed_by(&state.auth_token))
            .unwrap_or(false);
        if !signed {
            log::debug!("push rejected: bad or missing signature");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let event = match wechat::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            log::debug!("push rejected: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let message_id = event.message_id.clone();
    let (channel, reply_rx) = PendingChannel::open(message_id.clone());
    let seq = state.registry.register(channel).await;

    if let Err(e) = state.bus.publish(event).await {
        log::warn!("publish for message {} failed: {}", message_id, e);
        // A retry with the same id may have superseded this request meanwhile; leave it be.
        if let Some(channel) = state.registry.take_if(&message_id, seq).await {
            let _ = channel.complete(PendingReply::Unavailable);
        }
    }

    match reply_rx.await {
        Ok(reply) => reply_response(reply),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn reply_response(reply: PendingReply) -> Response {
    match reply {
        PendingReply::Content(content) => (StatusCode::OK, content).into_response(),
        PendingReply::Superseded => StatusCode::CONFLICT.into_response(),
        PendingReply::Expired => StatusCode::GATEWAY_TIMEOUT.into_response(),
        PendingReply::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
