//! Pass-through authentication: credentials the router injects toward the
//! backend, distinct from the end-user authorization the router performs
//! toward the client.
//!
//! Dispatch is exhaustive over the closed set of kinds. Injection mutates the
//! outbound header map in place; a failure aborts the current request only.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use http::header::AUTHORIZATION;
use http::HeaderMap;
use serde::Deserialize;
use tracing::info;

use crate::auth::{AuthToken, Authorizer};
use crate::config::PassThroughKind;
use crate::error::{RouterError, RouterResult};
use crate::translator::{Target, TokenState};

/// Inject the target's credentials into `outbound`.
///
/// `request_uri` and `path` describe the request as the client composed it;
/// the ECS and CouchDB kinds validate against them.
#[allow(clippy::too_many_arguments)]
pub async fn apply(
    client: &reqwest::Client,
    authorizer: &dyn Authorizer,
    auth_token: Option<&AuthToken>,
    headers: &HeaderMap,
    request_uri: &str,
    path: &str,
    target: &Target,
    outbound: &mut HeaderMap,
) -> RouterResult<()> {
    match target.auth.config.kind {
        PassThroughKind::None => Ok(()),
        PassThroughKind::SitePro => set_basic(outbound, target),
        PassThroughKind::Ecs => {
            inject_ecs(authorizer, headers, request_uri, target, outbound).await
        }
        PassThroughKind::CouchDB => inject_couchdb(auth_token, path, target, outbound),
        PassThroughKind::PureHub => inject_purehub(client, target, outbound).await,
    }
}

fn set_basic(outbound: &mut HeaderMap, target: &Target) -> RouterResult<()> {
    let credentials = BASE64_STANDARD.encode(format!(
        "{}:{}",
        target.auth.config.username, target.auth.config.password
    ));
    let value = http::HeaderValue::from_str(&format!("Basic {credentials}"))
        .map_err(|e| RouterError::Internal(format!("Invalid pass-through credentials: {e}")))?;
    outbound.insert(AUTHORIZATION, value);
    Ok(())
}

fn set_bearer(outbound: &mut HeaderMap, token: &str) -> RouterResult<()> {
    let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| RouterError::Internal(format!("Invalid bearer token: {e}")))?;
    outbound.insert(AUTHORIZATION, value);
    Ok(())
}

/// ECS requests look like `/ecs/<category>/<action>/<object>/` with the
/// category constrained to the site-gate and site APIs. Anything else is
/// refused before it reaches the device, and every accepted call lands in
/// the central audit log.
async fn inject_ecs(
    authorizer: &dyn Authorizer,
    headers: &HeaderMap,
    request_uri: &str,
    target: &Target,
    outbound: &mut HeaderMap,
) -> RouterResult<()> {
    set_basic(outbound, target)?;

    // The trailing slash is part of the contract.
    let parts: Vec<&str> = request_uri.split('/').collect();
    if parts.len() != 6 || !parts[5].is_empty() || parts[1] != "ecs" {
        return Err(RouterError::EcsUrl);
    }

    let did_what = parts[3];
    let to_what = match parts[2] {
        "ACCESS" => format!("site gate: {}", parts[4]),
        "sam" => format!("site: {}", parts[4]),
        _ => return Err(RouterError::EcsUrl),
    };
    let context = serde_json::json!({
        "url": request_uri,
        "origin": "ecs api passthrough router",
    })
    .to_string();

    authorizer
        .add_to_audit_log(headers, did_what, &to_what, &context)
        .await
        .map_err(|(status, message)| RouterError::Denied { status, message })
}

/// CouchDB user storage: a caller may only reach their own `userdb-<id>`
/// database. The service ping passes through untouched.
fn inject_couchdb(
    auth_token: Option<&AuthToken>,
    path: &str,
    target: &Target,
    outbound: &mut HeaderMap,
) -> RouterResult<()> {
    if path == "/userstorage/" {
        return Ok(());
    }

    set_basic(outbound, target)?;

    let Some((_, after)) = path.split_once("userdb-") else {
        return Err(RouterError::Forbidden(
            "User storage path does not identify a user database".to_string(),
        ));
    };
    let path_id: i64 = after
        .split('/')
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| {
            RouterError::Forbidden("User storage path does not identify a user database".to_string())
        })?;

    match auth_token {
        Some(token) if token.user_id == path_id => Ok(()),
        _ => Err(RouterError::Forbidden(
            "Access to another user's storage is denied".to_string(),
        )),
    }
}

/// Sample login response:
///
/// ```json
/// {
///     "access_token": "a-long-token",
///     "token_type": "bearer",
///     "expires_in": 3599,
///     ".issued": "Thu, 12 Feb 2015 12:15:23 GMT",
///     ".expires": "Thu, 12 Feb 2015 13:15:23 GMT"
/// }
/// ```
#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(rename = ".expires")]
    expires: String,
}

/// Bearer injection runs in two attempts. The first is optimistic: under the
/// read lock, a valid token is injected straight away. The second takes the
/// write lock and refreshes - but must re-examine the token first, because
/// every request that saw the expired token queues up on the same write lock
/// and only the first one may hit the login endpoint.
async fn inject_purehub(
    client: &reqwest::Client,
    target: &Target,
    outbound: &mut HeaderMap,
) -> RouterResult<()> {
    {
        let state = target.auth.state.read().await;
        if token_is_fresh(&state) {
            return set_bearer(outbound, &state.token);
        }
    }

    let mut state = target.auth.state.write().await;
    if !token_is_fresh(&state) {
        let fresh = fetch_token(client, target)
            .await
            .map_err(RouterError::TokenRefresh)?;
        *state = fresh;
        info!(login_url = %target.auth.config.login_url, "Acquired pass-through bearer token");
    }
    set_bearer(outbound, &state.token)
}

fn token_is_fresh(state: &TokenState) -> bool {
    !state.token.is_empty() && state.expires > Utc::now()
}

async fn fetch_token(client: &reqwest::Client, target: &Target) -> Result<TokenState, String> {
    let config = &target.auth.config;
    let response = client
        .post(&config.login_url)
        .form(&[
            ("grant_type", "password"),
            ("username", config.username.as_str()),
            ("password", config.password.as_str()),
        ])
        .send()
        .await
        .map_err(|e| format!("Token request failed: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("Token request failed: {status}"));
    }

    let body: LoginResponse = response
        .json()
        .await
        .map_err(|e| format!("Error decoding token response: {e}"))?;
    let expires = DateTime::parse_from_rfc2822(&body.expires)
        .map_err(|e| format!("Error parsing token expiry '{}': {e}", body.expires))?;

    Ok(TokenState {
        token: body.access_token,
        // Tokens last an hour; shave a minute so one is never injected right
        // at the boundary.
        expires: expires.with_timezone(&Utc) - chrono::Duration::seconds(60),
    })
}
