// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Plain HTTP routes served next to the socket endpoint

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, header},
};
use serde_json::{Value, json};
use std::collections::HashMap;

/// `GET /healthz`
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /project/settings`
///
/// Runs inside a plain session context so identity lookups behave the same as
/// in socket reactions.
pub async fn project_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<Value>> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let user = if state.auth.requires_auth() {
        Some(state.auth.resolve_user(authorization)?)
    } else {
        None
    };

    let ctx = state
        .dispatcher
        .plain_context(user, authorization.map(str::to_string), HashMap::new());
    let body = ctx
        .scope(async {
            let ctx = parley_core::current()?;
            let config = state.dispatcher.config();
            Ok::<_, ServerError>(json!({
                "userEnv": config.user_env,
                "sessionTimeout": config.session_timeout,
                "requireLogin": config.require_login,
                "user": ctx.session().user(),
            }))
        })
        .await?;

    Ok(Json(body))
}
