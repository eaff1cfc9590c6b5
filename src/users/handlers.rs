use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use tower_cookies::{Cookie, Cookies};
use tracing::instrument;

use crate::{error::ApiError, state::AppState};

use super::{
    dto::{
        AuthResponse, ChangePasswordRequest, LoginRequest, PublicUser, RefreshRequest,
        TokenPairResponse, UpdateProfileRequest,
    },
    jwt::AuthUser,
    service::{ImageUpload, RegisterInput, UserService},
};

const ACCESS_COOKIE: &str = "accessToken";
const REFRESH_COOKIE: &str = "refreshToken";
const UPLOAD_BODY_LIMIT: usize = 10 * 1024 * 1024; // 10MB

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/update-avatar", post(update_avatar))
        .route("/update-cover-image", post(update_cover_image))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh))
        .route("/change-password", post(change_password))
        .route("/update", patch(update_profile))
        .route("/me", get(me))
}

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .build()
}

fn set_session_cookies(cookies: &Cookies, access: &str, refresh: &str, secure: bool) {
    cookies.add(session_cookie(ACCESS_COOKIE, access.to_string(), secure));
    cookies.add(session_cookie(REFRESH_COOKIE, refresh.to_string(), secure));
}

fn clear_session_cookies(cookies: &Cookies) {
    cookies.remove(Cookie::build((ACCESS_COOKIE, "")).path("/").build());
    cookies.remove(Cookie::build((REFRESH_COOKIE, "")).path("/").build());
}

async fn image_from_field(field: axum::extract::multipart::Field<'_>) -> Result<ImageUpload, ApiError> {
    let content_type = field
        .content_type()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let body = field
        .bytes()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart payload: {e}")))?;
    Ok(ImageUpload { body, content_type })
}

/// Pull the single expected file out of a multipart body.
async fn single_image(mut mp: Multipart, field_name: &str) -> Result<ImageUpload, ApiError> {
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart payload: {e}")))?
    {
        if field.name() == Some(field_name) {
            return image_from_field(field).await;
        }
    }
    Err(ApiError::Validation(format!("{field_name} file is required")))
}

#[instrument(skip(state, cookies, mp))]
pub async fn register(
    State(state): State<AppState>,
    cookies: Cookies,
    mut mp: Multipart,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let mut username = None;
    let mut email = None;
    let mut password = None;
    let mut full_name = None;
    let mut avatar = None;
    let mut cover_image = None;

    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart payload: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "username" => username = Some(text_field(field).await?),
            "email" => email = Some(text_field(field).await?),
            "password" => password = Some(text_field(field).await?),
            "fullName" => full_name = Some(text_field(field).await?),
            "avatar" => avatar = Some(image_from_field(field).await?),
            "coverImage" => cover_image = Some(image_from_field(field).await?),
            _ => {}
        }
    }

    let avatar = avatar.ok_or_else(|| ApiError::Validation("avatar image is required".into()))?;

    let svc = UserService::from_state(&state);
    let response = svc
        .register(RegisterInput {
            username: username.unwrap_or_default(),
            email: email.unwrap_or_default(),
            password: password.unwrap_or_default(),
            full_name: full_name.unwrap_or_default(),
            avatar,
            cover_image,
        })
        .await?;

    set_session_cookies(
        &cookies,
        &response.access_token,
        &response.refresh_token,
        state.config.production,
    );
    Ok((StatusCode::CREATED, Json(response)))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart payload: {e}")))
}

#[instrument(skip(state, cookies, payload))]
pub async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let svc = UserService::from_state(&state);
    let response = svc
        .login(
            payload.username.as_deref(),
            payload.email.as_deref(),
            &payload.password,
        )
        .await?;

    set_session_cookies(
        &cookies,
        &response.access_token,
        &response.refresh_token,
        state.config.production,
    );
    Ok(Json(response))
}

#[instrument(skip(state, cookies))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    cookies: Cookies,
) -> Result<Json<serde_json::Value>, ApiError> {
    let svc = UserService::from_state(&state);
    svc.logout(user_id).await?;
    clear_session_cookies(&cookies);
    Ok(Json(json!({ "success": true, "message": "logged out" })))
}

#[instrument(skip(state, cookies, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    cookies: Cookies,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let presented = cookies
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| payload.and_then(|Json(p)| p.refresh_token))
        .ok_or_else(|| ApiError::Unauthorized("missing refresh token".into()))?;

    let svc = UserService::from_state(&state);
    let pair = svc.refresh(&presented).await?;

    set_session_cookies(
        &cookies,
        &pair.access_token,
        &pair.refresh_token,
        state.config.production,
    );
    Ok(Json(pair))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let svc = UserService::from_state(&state);
    svc.change_password(user_id, &payload.old_password, &payload.new_password)
        .await?;
    Ok(Json(json!({ "success": true, "message": "password changed" })))
}

#[instrument(skip(state))]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, ApiError> {
    let svc = UserService::from_state(&state);
    Ok(Json(svc.current_user(user_id).await?))
}

#[instrument(skip(state, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<PublicUser>, ApiError> {
    let svc = UserService::from_state(&state);
    Ok(Json(svc.update_profile(user_id, payload).await?))
}

#[instrument(skip(state, mp))]
pub async fn update_avatar(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Multipart,
) -> Result<Json<PublicUser>, ApiError> {
    let img = single_image(mp, "avatar").await?;
    let svc = UserService::from_state(&state);
    Ok(Json(svc.update_avatar(user_id, img).await?))
}

#[instrument(skip(state, mp))]
pub async fn update_cover_image(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Multipart,
) -> Result<Json<PublicUser>, ApiError> {
    let img = single_image(mp, "coverImage").await?;
    let svc = UserService::from_state(&state);
    Ok(Json(svc.update_cover_image(user_id, img).await?))
}
