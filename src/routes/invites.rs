use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::AppError;
use crate::invites;
use crate::models::invite::{
    GenerateRequest, InviteCodeResponse, SortDirection, SortField, VerifyRequest, VerifyResponse,
};
use crate::models::usage::UsageRecordResponse;
use crate::models::Page;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/invite-codes/generate", post(generate))
        .route("/api/invite-codes/verify", post(verify))
        .route("/api/invite-codes", get(list))
        .route("/api/invite-codes/{id}", get(get_by_id))
        .route("/api/invite-codes/code/{code}", get(get_by_code))
        .route("/api/invite-codes/{id}/usage-records", get(list_usage))
        .route("/api/invite-codes/{id}/enable", put(enable))
        .route("/api/invite-codes/{id}/disable", put(disable))
}

async fn generate(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<GenerateRequest>,
) -> Result<Json<Vec<InviteCodeResponse>>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let codes = invites::generate_batch(
        &state.db,
        body.count,
        body.description.as_deref(),
        &auth.username,
    )
    .await?;

    Ok(Json(codes))
}

async fn verify(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    let ip_address = forwarded_ip(&headers).unwrap_or_else(|| addr.ip().to_string());
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());

    let valid = invites::verify(
        &state.db,
        &body.code,
        body.user_id.as_deref(),
        &ip_address,
        user_agent,
    )
    .await?;

    Ok(Json(VerifyResponse { valid }))
}

/// First hop of X-Forwarded-For when running behind a proxy.
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<i64>,
    page_size: Option<i64>,
    sort_by: Option<SortField>,
    direction: Option<SortDirection>,
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<InviteCodeResponse>>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let page = invites::list(
        &state.db,
        params.page.unwrap_or(0),
        params.page_size.unwrap_or(10),
        params.sort_by.unwrap_or_default(),
        params.direction.unwrap_or_default(),
    )
    .await?;

    Ok(Json(page))
}

async fn get_by_id(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InviteCodeResponse>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let invite = invites::get_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Invite code not found".into()))?;

    Ok(Json(invite))
}

async fn get_by_code(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
) -> Result<Json<InviteCodeResponse>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let invite = invites::get_by_code(&state.db, &code)
        .await?
        .ok_or_else(|| AppError::NotFound("Invite code not found".into()))?;

    Ok(Json(invite))
}

#[derive(Debug, Deserialize)]
struct UsagePageParams {
    page: Option<i64>,
    page_size: Option<i64>,
}

async fn list_usage(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<UsagePageParams>,
) -> Result<Json<Page<UsageRecordResponse>>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let page = invites::list_usage(
        &state.db,
        id,
        params.page.unwrap_or(0),
        params.page_size.unwrap_or(10),
    )
    .await?;

    Ok(Json(page))
}

async fn enable(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InviteCodeResponse>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let invite = invites::set_active(&state.db, id, true)
        .await?
        .ok_or_else(|| AppError::NotFound("Invite code not found".into()))?;

    Ok(Json(invite))
}

async fn disable(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InviteCodeResponse>, AppError> {
    if !auth.is_admin() {
        return Err(AppError::Forbidden);
    }

    let invite = invites::set_active(&state.db, id, false)
        .await?
        .ok_or_else(|| AppError::NotFound("Invite code not found".into()))?;

    Ok(Json(invite))
}
