use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew for signed requests (5 minutes).
const MAX_TIMESTAMP_DRIFT_SECS: u64 = 300;

/// Request body cap while buffering for signature verification.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn unauthorized(reason: &'static str) -> Response {
    (StatusCode::UNAUTHORIZED, reason).into_response()
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Check the `X-Timestamp` header against the local clock.
fn timestamp_fresh(raw: &str) -> bool {
    let Ok(timestamp) = raw.parse::<u64>() else {
        return false;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.abs_diff(timestamp) <= MAX_TIMESTAMP_DRIFT_SECS
}

/// Axum middleware enforcing HMAC-SHA256 request signatures.
///
/// Callers send `X-Timestamp` (Unix seconds) and `X-Signature`
/// (`hmac-sha256=<hex>` over timestamp + body) computed with the shared
/// secret. Replays outside the drift window are rejected before any body
/// work.
pub async fn verify_hmac(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(signature) = header(request.headers(), "X-Signature").map(str::to_owned) else {
        return unauthorized("Missing or invalid X-Signature header");
    };
    let Some(timestamp) = header(request.headers(), "X-Timestamp").map(str::to_owned) else {
        return unauthorized("Missing or invalid X-Timestamp header");
    };
    if !timestamp_fresh(&timestamp) {
        return unauthorized("Timestamp outside the allowed window");
    }

    // Buffer the body to sign it, then hand it back to the handler.
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response(),
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(state.config.shared_secret.as_bytes()) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "HMAC initialization failed").into_response();
    };
    mac.update(timestamp.as_bytes());
    mac.update(&body_bytes);
    let expected = hex::encode(mac.finalize().into_bytes());

    let provided = signature.strip_prefix("hmac-sha256=").unwrap_or(&signature);
    if expected != provided {
        return unauthorized("HMAC signature verification failed");
    }

    next.run(Request::from_parts(parts, Body::from(body_bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_freshness() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(timestamp_fresh(&now.to_string()));
        assert!(timestamp_fresh(&(now - 60).to_string()));
        assert!(!timestamp_fresh(&(now - 3600).to_string()));
        assert!(!timestamp_fresh("not-a-number"));
        assert!(!timestamp_fresh(""));
    }
}
