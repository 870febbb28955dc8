//! Postgres-backed account and comment stores.
//!
//! ## Schema
//!
//! - `users`: one row per account, `email` unique (stored lowercase)
//! - `cards`: one row per card, comments embedded as a JSONB array with a GIN
//!   index so "cards with a comment by user X" is a containment lookup
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database, code `23505` | `Conflict` |
//! | RowNotFound | `NotFound` |
//! | anything else | `Unavailable` (source kept) |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use taskboard_auth::{NewUser, Role, UserLookup, UserPatch, UserRecord};
use taskboard_boards::{Card, CardComment, CommentUpdateSummary};
use taskboard_core::{BoardId, CardId, UserId, UserSnapshot};

use super::accounts::AccountStore;
use super::comments::CommentStore;
use super::error::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL,
        display_name TEXT NOT NULL,
        avatar TEXT,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'client',
        is_active BOOLEAN NOT NULL DEFAULT FALSE,
        verify_token TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS users_username_idx ON users (username)",
    r#"
    CREATE TABLE IF NOT EXISTS cards (
        id UUID PRIMARY KEY,
        board_id UUID NOT NULL,
        title TEXT NOT NULL,
        comments JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    "CREATE INDEX IF NOT EXISTS cards_comments_gin ON cards USING GIN (comments jsonb_path_ops)",
];

/// Create tables and indexes if missing.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: Arc<PgPool>,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const USER_COLUMNS: &str = "id, email, username, display_name, avatar, password_hash, role, \
                            is_active, verify_token, created_at, updated_at";

#[async_trait]
impl AccountStore for PostgresAccountStore {
    #[instrument(skip(self), err)]
    async fn find_one_by(&self, lookup: &UserLookup) -> Result<Option<UserRecord>, StoreError> {
        let row = match lookup {
            UserLookup::Id(id) => {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
                sqlx::query(&sql)
                    .bind(*id.as_uuid())
                    .fetch_optional(&*self.pool)
                    .await?
            }
            UserLookup::Email(email) => {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = lower($1)");
                sqlx::query(&sql)
                    .bind(email.as_str())
                    .fetch_optional(&*self.pool)
                    .await?
            }
            UserLookup::Username(username) => {
                let sql = format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE username = $1 ORDER BY created_at LIMIT 1"
                );
                sqlx::query(&sql)
                    .bind(username.as_str())
                    .fetch_optional(&*self.pool)
                    .await?
            }
        };

        row.map(|row| user_from_row(&row)).transpose()
    }

    #[instrument(skip(self, user), fields(email = %user.email), err)]
    async fn insert(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let record = user.into_record(UserId::new(), Utc::now());

        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, display_name, avatar, password_hash, role,
                               is_active, verify_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(*record.id.as_uuid())
        .bind(&record.email)
        .bind(&record.username)
        .bind(&record.display_name)
        .bind(&record.avatar)
        .bind(&record.password_hash)
        .bind(record.role.as_str())
        .bind(record.is_active)
        .bind(&record.verify_token)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self, patch), fields(user_id = %user_id), err)]
    async fn update(&self, user_id: UserId, patch: &UserPatch) -> Result<UserRecord, StoreError> {
        let (set_token, token) = match &patch.verify_token {
            Some(token) => (true, token.clone()),
            None => (false, None),
        };

        let sql = format!(
            r#"
            UPDATE users SET
                display_name = COALESCE($2, display_name),
                avatar = COALESCE($3, avatar),
                password_hash = COALESCE($4, password_hash),
                is_active = COALESCE($5, is_active),
                verify_token = CASE WHEN $6 THEN $7 ELSE verify_token END,
                updated_at = $8
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(*user_id.as_uuid())
            .bind(&patch.display_name)
            .bind(&patch.avatar)
            .bind(&patch.password_hash)
            .bind(patch.is_active)
            .bind(set_token)
            .bind(token)
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("user {user_id}")))?;

        user_from_row(&row)
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<UserRecord, StoreError> {
    let role: String = row.try_get("role")?;
    let role = role
        .parse::<Role>()
        .map_err(|e| StoreError::Unavailable {
            message: "stored role is invalid".to_string(),
            source: Some(Box::new(e)),
        })?;

    Ok(UserRecord {
        id: UserId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        avatar: row.try_get("avatar")?,
        password_hash: row.try_get("password_hash")?,
        role,
        is_active: row.try_get("is_active")?,
        verify_token: row.try_get("verify_token")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Cards & comments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PostgresCommentStore {
    pool: Arc<PgPool>,
}

impl PostgresCommentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Refresh one card under a row lock. Returns `None` if the card vanished.
    async fn refresh_card(
        &self,
        card_id: CardId,
        snapshot: &UserSnapshot,
    ) -> Result<Option<(CardId, taskboard_boards::AuthorRefresh)>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id, board_id, title, comments FROM cards WHERE id = $1 FOR UPDATE")
            .bind(*card_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut card = card_from_row(&row)?;
        let refresh = card.refresh_author(snapshot);

        if !refresh.changed.is_empty() {
            sqlx::query("UPDATE cards SET comments = $2 WHERE id = $1")
                .bind(*card_id.as_uuid())
                .bind(Json(&card.comments))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(Some((card_id, refresh)))
    }
}

#[async_trait]
impl CommentStore for PostgresCommentStore {
    async fn insert_card(&self, card: Card) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO cards (id, board_id, title, comments) VALUES ($1, $2, $3, $4)")
            .bind(*card.id.as_uuid())
            .bind(*card.board_id.as_uuid())
            .bind(&card.title)
            .bind(Json(&card.comments))
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn get_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query("SELECT id, board_id, title, comments FROM cards WHERE id = $1")
            .bind(*card_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await?;
        row.map(|row| card_from_row(&row)).transpose()
    }

    async fn remove_card(&self, card_id: CardId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM cards WHERE id = $1")
            .bind(*card_id.as_uuid())
            .execute(&*self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("card {card_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, snapshot), fields(user_id = %snapshot.user_id), err)]
    async fn update_many_comments(
        &self,
        snapshot: &UserSnapshot,
    ) -> Result<CommentUpdateSummary, StoreError> {
        let probe = serde_json::json!([{ "user_id": snapshot.user_id }]);
        let card_ids: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM cards WHERE comments @> $1")
            .bind(probe)
            .fetch_all(&*self.pool)
            .await?;

        let mut summary = CommentUpdateSummary::default();
        for card_id in card_ids.into_iter().map(CardId::from_uuid) {
            match self.refresh_card(card_id, snapshot).await? {
                Some((card_id, refresh)) => summary.record(card_id, refresh),
                None => debug!(card_id = %card_id, "card removed during refresh, skipped"),
            }
        }
        Ok(summary)
    }
}

fn card_from_row(row: &sqlx::postgres::PgRow) -> Result<Card, StoreError> {
    let Json(comments): Json<Vec<CardComment>> = row.try_get("comments")?;
    Ok(Card {
        id: CardId::from_uuid(row.try_get("id")?),
        board_id: BoardId::from_uuid(row.try_get("board_id")?),
        title: row.try_get("title")?,
        comments,
    })
}
