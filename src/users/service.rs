use std::sync::Arc;

use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{ext_from_mime, key_from_url, MediaStore};

use super::claims::TokenKind;
use super::dto::{AuthResponse, PublicUser, TokenPairResponse, UpdateProfileRequest};
use super::jwt::JwtKeys;
use super::password::{hash_password, verify_password};
use super::repo::{NewUser, PgUserStore, UserChanges, UserStore};

const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn required(value: &str, name: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation(format!("{name} is required")));
    }
    Ok(trimmed.to_string())
}

/// An image received from a client, ready for the media store.
pub struct ImageUpload {
    pub body: Bytes,
    pub content_type: String,
}

pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub avatar: ImageUpload,
    pub cover_image: Option<ImageUpload>,
}

/// Session coordinator: ties the credential store, password hasher, token
/// issuer and media store together. Generic over the store so the flows
/// can be exercised without a live database.
pub struct UserService<S: UserStore> {
    store: S,
    keys: JwtKeys,
    media: Arc<dyn MediaStore>,
}

impl UserService<PgUserStore> {
    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            PgUserStore::new(state.db.clone()),
            JwtKeys::new(&state.config.jwt),
            state.media.clone(),
        )
    }
}

impl<S: UserStore> UserService<S> {
    pub fn new(store: S, keys: JwtKeys, media: Arc<dyn MediaStore>) -> Self {
        Self { store, keys, media }
    }

    /// Mint a fresh token pair and persist the refresh half on the user
    /// record, overwriting whatever was there. At most one refresh token
    /// is live per user.
    async fn issue_session(&self, user_id: Uuid) -> Result<(String, String), ApiError> {
        let access = self.keys.sign_access(user_id)?;
        let refresh = self.keys.sign_refresh(user_id)?;
        self.store
            .set_refresh_token(user_id, Some(refresh.as_str()))
            .await?;
        Ok((access, refresh))
    }

    async fn store_image(&self, folder: &str, img: &ImageUpload) -> Result<String, ApiError> {
        let ext = ext_from_mime(&img.content_type).unwrap_or("bin");
        let key = format!("{}/{}.{}", folder, Uuid::new_v4(), ext);
        let url = self
            .media
            .store(&key, img.body.clone(), &img.content_type)
            .await
            .map_err(|e| ApiError::Upload(e.to_string()))?;
        if url.is_empty() {
            return Err(ApiError::Upload("media store returned no URL".into()));
        }
        Ok(url)
    }

    /// Delete a previously stored object by its public URL. Failures are
    /// logged and swallowed; a stale orphaned object is an accepted
    /// trade-off.
    async fn discard_stored(&self, url: &str) {
        let Some(key) = key_from_url(self.media.public_base_url(), url) else {
            return;
        };
        if let Err(e) = self.media.delete(&key).await {
            warn!(error = %e, key = %key, "failed to delete replaced media object");
        }
    }

    pub async fn register(&self, input: RegisterInput) -> Result<AuthResponse, ApiError> {
        let username = required(&input.username, "username")?.to_lowercase();
        let email = required(&input.email, "email")?.to_lowercase();
        let full_name = required(&input.full_name, "fullName")?;
        let password = required(&input.password, "password")?;

        if !is_valid_email(&email) {
            return Err(ApiError::Validation("invalid email".into()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(ApiError::Validation("password too short".into()));
        }

        if self
            .store
            .find_by_identity(Some(&username), Some(&email))
            .await?
            .is_some()
        {
            warn!(username = %username, email = %email, "identity already registered");
            return Err(ApiError::Conflict("user already exists".into()));
        }

        // Avatar must land in the media store before the user exists. If
        // creation fails afterwards the uploaded object is orphaned; no
        // rollback is attempted.
        let avatar_url = self.store_image("avatars", &input.avatar).await?;
        let cover_image_url = match &input.cover_image {
            Some(img) => Some(self.store_image("covers", img).await?),
            None => None,
        };

        let password_hash = hash_password(&password)?;

        let user = self
            .store
            .create(NewUser {
                username,
                email,
                full_name,
                password_hash,
                avatar_url,
                cover_image_url,
            })
            .await?;

        let (access_token, refresh_token) = self.issue_session(user.id).await?;
        info!(user_id = %user.id, username = %user.username, "user registered");

        Ok(AuthResponse {
            user: user.into(),
            access_token,
            refresh_token,
        })
    }

    pub async fn login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        password: &str,
    ) -> Result<AuthResponse, ApiError> {
        let username = username.map(|u| u.trim().to_lowercase());
        let email = email.map(|e| e.trim().to_lowercase());
        if username.as_deref().map_or(true, str::is_empty)
            && email.as_deref().map_or(true, str::is_empty)
        {
            return Err(ApiError::Validation("username or email is required".into()));
        }

        let user = self
            .store
            .find_by_identity(username.as_deref(), email.as_deref())
            .await?
            .ok_or_else(|| ApiError::NotFound("user does not exist".into()))?;

        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "login with invalid password");
            return Err(ApiError::Unauthorized("invalid credentials".into()));
        }

        // Overwrites any previously stored refresh token: logging in ends
        // the prior session.
        let (access_token, refresh_token) = self.issue_session(user.id).await?;
        info!(user_id = %user.id, "user logged in");

        Ok(AuthResponse {
            user: user.into(),
            access_token,
            refresh_token,
        })
    }

    pub async fn logout(&self, user_id: Uuid) -> Result<(), ApiError> {
        self.store.set_refresh_token(user_id, None).await?;
        info!(user_id = %user_id, "user logged out");
        Ok(())
    }

    /// Rotate a presented refresh token. The token must verify
    /// cryptographically *and* byte-for-byte equal the stored one; a stale
    /// token from before a rotation or logout is rejected even if it has
    /// not expired. Two truly concurrent refreshes can still interleave
    /// between the read and the write; that window is accepted.
    pub async fn refresh(&self, presented: &str) -> Result<TokenPairResponse, ApiError> {
        let claims = self.keys.verify(presented, TokenKind::Refresh)?;

        let user = self
            .store
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("user not found".into()))?;

        if user.refresh_token.as_deref() != Some(presented) {
            warn!(user_id = %user.id, "stale or replayed refresh token");
            return Err(ApiError::Unauthorized("refresh token is no longer valid".into()));
        }

        let (access_token, refresh_token) = self.issue_session(user.id).await?;
        info!(user_id = %user.id, "session refreshed");

        Ok(TokenPairResponse {
            access_token,
            refresh_token,
        })
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let new_password = required(new_password, "new password")?;
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(ApiError::Validation("password too short".into()));
        }

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        if !verify_password(old_password, &user.password_hash) {
            warn!(user_id = %user_id, "password change with wrong old password");
            return Err(ApiError::Unauthorized("old password is incorrect".into()));
        }

        let password_hash = hash_password(&new_password)?;
        self.store
            .update(
                user_id,
                UserChanges {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?;
        info!(user_id = %user_id, "password changed");
        Ok(())
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        req: UpdateProfileRequest,
    ) -> Result<PublicUser, ApiError> {
        let full_name = match req.full_name {
            Some(n) => Some(required(&n, "fullName")?),
            None => None,
        };
        let email = match req.email {
            Some(e) => {
                let email = required(&e, "email")?.to_lowercase();
                if !is_valid_email(&email) {
                    return Err(ApiError::Validation("invalid email".into()));
                }
                if let Some(existing) = self.store.find_by_identity(None, Some(&email)).await? {
                    if existing.id != user_id {
                        return Err(ApiError::Conflict("email already taken".into()));
                    }
                }
                Some(email)
            }
            None => None,
        };

        let user = self
            .store
            .update(
                user_id,
                UserChanges {
                    email,
                    full_name,
                    ..Default::default()
                },
            )
            .await?;
        info!(user_id = %user_id, "profile updated");
        Ok(user.into())
    }

    pub async fn update_avatar(
        &self,
        user_id: Uuid,
        img: ImageUpload,
    ) -> Result<PublicUser, ApiError> {
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let avatar_url = self.store_image("avatars", &img).await?;
        let updated = self
            .store
            .update(
                user_id,
                UserChanges {
                    avatar_url: Some(avatar_url),
                    ..Default::default()
                },
            )
            .await?;

        self.discard_stored(&user.avatar_url).await;
        info!(user_id = %user_id, "avatar updated");
        Ok(updated.into())
    }

    pub async fn update_cover_image(
        &self,
        user_id: Uuid,
        img: ImageUpload,
    ) -> Result<PublicUser, ApiError> {
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let cover_image_url = self.store_image("covers", &img).await?;
        let updated = self
            .store
            .update(
                user_id,
                UserChanges {
                    cover_image_url: Some(cover_image_url),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(old) = user.cover_image_url.as_deref() {
            self.discard_stored(old).await;
        }
        info!(user_id = %user_id, "cover image updated");
        Ok(updated.into())
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<PublicUser, ApiError> {
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        Ok(user.into())
    }
}
