use axum::{
    extract::Request,
    http::header::USER_AGENT,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::constants::XCODE_UA_PREFIX;
use crate::error::ProxyError;

/// The proxy serves exactly one client. Anything that doesn't identify as
/// Xcode is turned away at the door.
pub fn is_xcode_user_agent(user_agent: &str) -> bool {
    user_agent.starts_with(XCODE_UA_PREFIX)
}

/// Middleware guarding the `/v1` surface.
pub async fn require_xcode_user_agent(request: Request, next: Next) -> Response {
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !is_xcode_user_agent(user_agent) {
        log::warn!(
            "Rejected {} {} from user agent {:?}",
            request.method(),
            request.uri().path(),
            user_agent
        );
        return ProxyError::Forbidden.into_response();
    }

    next.run(request).await
}
