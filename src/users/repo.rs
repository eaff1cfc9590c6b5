use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, \
     avatar_url, cover_image_url, refresh_token, created_at, updated_at";

/// User record in the database. Never serialized directly; responses go
/// through `PublicUser`.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    pub refresh_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields required to create a user. `username` and `email` must already
/// be trimmed and lowercased; `password_hash` is the Argon2 output.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password_hash: Option<String>,
    pub avatar_url: Option<String>,
    pub cover_image_url: Option<String>,
}

/// Credential store contract. Lookups on username/email expect lowercased
/// input; the Postgres implementation stores both lowercased, so equality
/// is case-insensitive end to end.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_identity(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, ApiError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError>;

    /// Fails with `Conflict` if the username or email is already taken.
    async fn create(&self, new: NewUser) -> Result<User, ApiError>;

    /// Fails with `NotFound` if the id is absent.
    async fn update(&self, id: Uuid, changes: UserChanges) -> Result<User, ApiError>;

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_identity(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, ApiError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE username = LOWER($1) OR email = LOWER($2)"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username.unwrap_or(""))
            .bind(email.unwrap_or(""))
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> Result<User, ApiError> {
        let sql = format!(
            "INSERT INTO users \
             (username, email, full_name, password_hash, avatar_url, cover_image_url) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.full_name)
            .bind(&new.password_hash)
            .bind(&new.avatar_url)
            .bind(&new.cover_image_url)
            .fetch_one(&self.db)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ApiError::Conflict("username or email already taken".into())
                }
                _ => ApiError::Database(e),
            })?;
        Ok(user)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> Result<User, ApiError> {
        let sql = format!(
            "UPDATE users SET \
             email = COALESCE($2, email), \
             full_name = COALESCE($3, full_name), \
             password_hash = COALESCE($4, password_hash), \
             avatar_url = COALESCE($5, avatar_url), \
             cover_image_url = COALESCE($6, cover_image_url), \
             updated_at = now() \
             WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(&changes.email)
            .bind(&changes.full_name)
            .bind(&changes.password_hash)
            .bind(&changes.avatar_url)
            .bind(&changes.cover_image_url)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ApiError::Conflict("email already taken".into())
                }
                _ => ApiError::Database(e),
            })?;
        user.ok_or_else(|| ApiError::NotFound("user not found".into()))
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), ApiError> {
        sqlx::query("UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
