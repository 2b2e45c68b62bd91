//! Admin HTTP request handlers
//!
//! Every handler except /health authenticates first; no account state is
//! touched before the credential check passes.

use super::router::ApiState;
use crate::domain::account::{Account, ProvisioningData, RegistrationState};
use crate::domain::shared::EngineError;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Account view returned to the administrator; credentials never leave.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: String,
    pub username: String,
    pub domain: String,
    pub state: RegistrationState,
    pub expires_at: Option<DateTime<Utc>>,
    pub premium: bool,
    pub selector: String,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            domain: account.domain,
            state: account.state,
            expires_at: account.expires_at,
            premium: account.premium,
            selector: account.selector,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub accounts: Vec<AccountView>,
    pub registered: usize,
    pub dialogs: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn status(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let accounts: Vec<AccountView> = state
        .signaling
        .account_snapshot()
        .await
        .into_iter()
        .map(AccountView::from)
        .collect();
    let registered = accounts
        .iter()
        .filter(|a| {
            matches!(
                a.state,
                RegistrationState::Registered | RegistrationState::AboutToExpire
            )
        })
        .count();
    let dialogs = state.signaling.dialog_snapshot().await.len();
    Json(StatusView {
        accounts,
        registered,
        dialogs,
    })
    .into_response()
}

pub async fn create_account(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    if state.log_request_body {
        debug!(%body, "admin request body");
    }

    let data = match provisioning_data(&state, &body) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "rejecting malformed provisioning request");
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };

    match state.signaling.register_account(data).await {
        Ok(account) => (StatusCode::CREATED, Json(AccountView::from(account))).into_response(),
        Err(e) => {
            warn!(error = %e, "account provisioning failed");
            error_response(status_for(&e), &e)
        }
    }
}

pub async fn delete_account(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.signaling.remove_account(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            &EngineError::Registration(format!("unknown account {}", id)),
        ),
        Err(e) => {
            warn!(error = %e, account = %id, "account removal failed");
            error_response(status_for(&e), &e)
        }
    }
}

/// Parse the posted provisioning blob. With a store key configured the body
/// may arrive sealed (base64, AES-GCM); a body that opens under the key is
/// parsed from its plaintext, anything else is parsed as posted.
fn provisioning_data(state: &ApiState, body: &str) -> Result<ProvisioningData, EngineError> {
    if let Some(cipher) = &state.cipher {
        if let Ok(opened) = cipher.open_base64(body.trim()) {
            let plain = String::from_utf8(opened).map_err(|_| {
                EngineError::Decryption("provisioning data is not valid UTF-8".to_string())
            })?;
            return ProvisioningData::parse(&plain);
        }
    }
    ProvisioningData::parse(body)
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Registration(_)
        | EngineError::Config(_)
        | EngineError::Decryption(_) => StatusCode::BAD_REQUEST,
        EngineError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: &EngineError) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Basic realm="sipis""#)],
    )
        .into_response()
}

/// HTTP Basic credential check against the configured administrator.
fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((username, password)) => {
            username == state.administrator.username && password == state.administrator.password
        }
        None => false,
    }
}
