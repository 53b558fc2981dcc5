//! Record store backends and the hybrid persistence facade for Cuponera.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cuponera_core::{Counter, Discount, DiscountPatch, DiscountRef, User};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cuponera-store";

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const AVAILABILITY_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("account already exists for {0}")]
    DuplicateEmail(String),
    #[error("no storage backend available")]
    Unavailable,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("file store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt file store snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// Infrastructure failures degrade the facade to the other backend;
    /// semantic outcomes (not found, duplicates) never do.
    fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_)
                | StoreError::Io(_)
                | StoreError::Corrupt(_)
                | StoreError::Unavailable
        )
    }
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Discount),
    Duplicate(Discount),
}

/// One logical record store. The two physical backends and the hybrid
/// facade all implement it, so callers never know which backend served a
/// call.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ping(&self) -> bool;

    async fn find_discount(&self, reference: &DiscountRef) -> Result<Option<Discount>, StoreError>;

    /// Active records, newest first.
    async fn list_active(&self) -> Result<Vec<Discount>, StoreError>;

    /// Insert respecting `(source, external_id)` uniqueness; a duplicate
    /// returns the existing record instead of creating a second one.
    async fn insert_discount(&self, discount: Discount) -> Result<InsertOutcome, StoreError>;

    /// Partial update located by reference: native id first, then external
    /// id (oldest record wins when a bare external id is ambiguous).
    async fn update_discount(
        &self,
        reference: &DiscountRef,
        patch: DiscountPatch,
    ) -> Result<Discount, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_session(&self, token_hash: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, user: User) -> Result<User, StoreError>;

    async fn set_session(&self, user_id: Uuid, token_hash: &str) -> Result<(), StoreError>;

    async fn toggle_favorite(
        &self,
        user_id: Uuid,
        discount_id: Uuid,
    ) -> Result<BTreeSet<Uuid>, StoreError>;

    async fn favorites(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS discounts (
    id UUID PRIMARY KEY,
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    discount_percentage DOUBLE PRECISION,
    discount_amount DOUBLE PRECISION,
    currency TEXT NOT NULL,
    store_json JSONB NOT NULL,
    payment_methods_json JSONB NOT NULL DEFAULT '[]'::jsonb,
    valid_from TIMESTAMPTZ,
    valid_until TIMESTAMPTZ,
    url TEXT NOT NULL,
    affiliate_url TEXT,
    image_url TEXT,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    verified BOOLEAN NOT NULL DEFAULT FALSE,
    last_verified_at TIMESTAMPTZ,
    clicks BIGINT NOT NULL DEFAULT 0,
    likes BIGINT NOT NULL DEFAULT 0,
    dislikes BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (source, external_id)
);

CREATE INDEX IF NOT EXISTS idx_discounts_active_created
    ON discounts (active, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_discounts_external
    ON discounts (external_id);

CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    favorites JSONB NOT NULL DEFAULT '[]'::jsonb,
    session_token_hash TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_session
    ON users (session_token_hash);
"#;

const DISCOUNT_COLUMNS: &str = "id, source, external_id, title, description, discount_percentage, \
     discount_amount, currency, store_json, payment_methods_json, valid_from, valid_until, url, \
     affiliate_url, image_url, active, verified, last_verified_at, clicks, likes, dislikes, \
     created_at, updated_at";

const USER_COLUMNS: &str =
    "id, name, email, password_hash, favorites, session_token_hash, created_at";

/// A bare external id can match rows under several sources; the oldest row
/// wins, deterministically.
const OLDEST_BY_EXTERNAL_ID: &str =
    "id = (SELECT id FROM discounts WHERE external_id = $1 ORDER BY created_at ASC LIMIT 1)";

/// Postgres-backed primary store.
#[derive(Debug, Clone)]
pub struct PrimaryStore {
    pool: PgPool,
}

enum MatchKey<'a> {
    Id(Uuid),
    External(&'a str),
}

impl PrimaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn update_matching(
        &self,
        where_clause: &str,
        key: MatchKey<'_>,
        patch: &DiscountPatch,
    ) -> Result<Option<Discount>, StoreError> {
        let now = Utc::now();
        let set_clause = match patch {
            DiscountPatch::SetVerified { .. } => {
                "verified = $2, last_verified_at = $3, updated_at = $4"
            }
            DiscountPatch::Increment(Counter::Clicks) => "clicks = clicks + 1, updated_at = $2",
            DiscountPatch::Increment(Counter::Likes) => "likes = likes + 1, updated_at = $2",
            DiscountPatch::Increment(Counter::Dislikes) => "dislikes = dislikes + 1, updated_at = $2",
            DiscountPatch::Refresh(_) => {
                "title = $2, description = $3, discount_percentage = $4, discount_amount = $5, \
                 currency = COALESCE($6, currency), store_json = $7, payment_methods_json = $8, \
                 valid_from = $9, valid_until = $10, url = $11, affiliate_url = $12, \
                 image_url = $13, active = TRUE, updated_at = $14"
            }
        };
        let sql =
            format!("UPDATE discounts SET {set_clause} WHERE {where_clause} RETURNING {DISCOUNT_COLUMNS}");

        let mut query = sqlx::query(&sql);
        query = match key {
            MatchKey::Id(id) => query.bind(id),
            MatchKey::External(external_id) => query.bind(external_id.to_string()),
        };
        query = match patch {
            DiscountPatch::SetVerified { verified, at } => {
                query.bind(*verified).bind(*at).bind(now)
            }
            DiscountPatch::Increment(_) => query.bind(now),
            DiscountPatch::Refresh(draft) => {
                let store_json = serde_json::to_value(draft.store_ref())?;
                let payment_json = serde_json::to_value(draft.payment_method_refs())?;
                query
                    .bind(draft.title.clone())
                    .bind(draft.description.clone())
                    .bind(draft.discount_percentage)
                    .bind(draft.discount_amount)
                    .bind(draft.currency.clone())
                    .bind(store_json)
                    .bind(payment_json)
                    .bind(draft.valid_from)
                    .bind(draft.valid_until)
                    .bind(draft.url.clone())
                    .bind(draft.affiliate_url.clone())
                    .bind(draft.image_url.clone())
                    .bind(now)
            }
        };

        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| discount_from_row(&r)).transpose()
    }
}

fn discount_from_row(row: &PgRow) -> Result<Discount, StoreError> {
    let store_json: serde_json::Value = row.try_get("store_json")?;
    let payment_json: serde_json::Value = row.try_get("payment_methods_json")?;
    Ok(Discount {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        discount_percentage: row.try_get("discount_percentage")?,
        discount_amount: row.try_get("discount_amount")?,
        currency: row.try_get("currency")?,
        store: serde_json::from_value(store_json)?,
        payment_methods: serde_json::from_value(payment_json)?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
        url: row.try_get("url")?,
        affiliate_url: row.try_get("affiliate_url")?,
        image_url: row.try_get("image_url")?,
        active: row.try_get("active")?,
        verified: row.try_get("verified")?,
        last_verified_at: row.try_get("last_verified_at")?,
        clicks: row.try_get("clicks")?,
        likes: row.try_get("likes")?,
        dislikes: row.try_get("dislikes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let favorites: serde_json::Value = row.try_get("favorites")?;
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        favorites: serde_json::from_value(favorites)?,
        session_token_hash: row.try_get("session_token_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RecordStore for PrimaryStore {
    async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool)).await,
            Ok(Ok(_))
        )
    }

    async fn find_discount(&self, reference: &DiscountRef) -> Result<Option<Discount>, StoreError> {
        if let Some(id) = reference.native_id() {
            let sql = format!("SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE id = $1");
            if let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
                return Ok(Some(discount_from_row(&row)?));
            }
        }
        let sql = format!(
            "SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE external_id = $1 \
             ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(reference.raw())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| discount_from_row(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Discount>, StoreError> {
        let sql = format!(
            "SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE active ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(discount_from_row).collect()
    }

    async fn insert_discount(&self, discount: Discount) -> Result<InsertOutcome, StoreError> {
        let store_json = serde_json::to_value(&discount.store)?;
        let payment_json = serde_json::to_value(&discount.payment_methods)?;
        let result = sqlx::query(
            r#"
            INSERT INTO discounts (id, source, external_id, title, description,
                discount_percentage, discount_amount, currency, store_json,
                payment_methods_json, valid_from, valid_until, url, affiliate_url,
                image_url, active, verified, last_verified_at, clicks, likes,
                dislikes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (source, external_id) DO NOTHING
            "#,
        )
        .bind(discount.id)
        .bind(&discount.source)
        .bind(&discount.external_id)
        .bind(&discount.title)
        .bind(&discount.description)
        .bind(discount.discount_percentage)
        .bind(discount.discount_amount)
        .bind(&discount.currency)
        .bind(store_json)
        .bind(payment_json)
        .bind(discount.valid_from)
        .bind(discount.valid_until)
        .bind(&discount.url)
        .bind(&discount.affiliate_url)
        .bind(&discount.image_url)
        .bind(discount.active)
        .bind(discount.verified)
        .bind(discount.last_verified_at)
        .bind(discount.clicks)
        .bind(discount.likes)
        .bind(discount.dislikes)
        .bind(discount.created_at)
        .bind(discount.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted(discount));
        }

        let sql = format!(
            "SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE source = $1 AND external_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&discount.source)
            .bind(&discount.external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(InsertOutcome::Duplicate(discount_from_row(&row)?))
    }

    async fn update_discount(
        &self,
        reference: &DiscountRef,
        patch: DiscountPatch,
    ) -> Result<Discount, StoreError> {
        if let Some(id) = reference.native_id() {
            if let Some(discount) = self
                .update_matching("id = $1", MatchKey::Id(id), &patch)
                .await?
            {
                return Ok(discount);
            }
        }
        if let Some(discount) = self
            .update_matching(OLDEST_BY_EXTERNAL_ID, MatchKey::External(reference.raw()), &patch)
            .await?
        {
            return Ok(discount);
        }
        Err(StoreError::NotFound)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query(&sql).bind(email).fetch_optional(&self.pool).await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn find_user_by_session(&self, token_hash: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE session_token_hash = $1");
        let row = sqlx::query(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        let favorites = serde_json::to_value(&user.favorites)?;
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, name, email, password_hash, favorites,
                session_token_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(favorites)
        .bind(&user.session_token_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateEmail(user.email));
        }
        Ok(user)
    }

    async fn set_session(&self, user_id: Uuid, token_hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET session_token_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn toggle_favorite(
        &self,
        user_id: Uuid,
        discount_id: Uuid,
    ) -> Result<BTreeSet<Uuid>, StoreError> {
        // Single statement so concurrent toggles for the same user stay
        // atomic; `?`/`-`/`||` are the jsonb membership, remove and append
        // operators.
        let row = sqlx::query(
            r#"
            UPDATE users
               SET favorites = CASE
                     WHEN favorites ? $2 THEN favorites - $2
                     ELSE favorites || to_jsonb($2::text)
                   END
             WHERE id = $1
             RETURNING favorites
            "#,
        )
        .bind(user_id)
        .bind(discount_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StoreError::NotFound)?;
        let favorites: serde_json::Value = row.try_get("favorites")?;
        Ok(serde_json::from_value(favorites)?)
    }

    async fn favorites(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError> {
        let row = sqlx::query("SELECT favorites FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(StoreError::NotFound)?;
        let favorites: serde_json::Value = row.try_get("favorites")?;
        Ok(serde_json::from_value(favorites)?)
    }
}

/// Flat-file fallback store: one pretty-printed JSON snapshot per
/// collection, mutated under a per-file lock with an atomic temp-file
/// rename so readers never observe a partial write.
#[derive(Debug)]
pub struct FallbackStore {
    dir: PathBuf,
    discounts_lock: Mutex<()>,
    users_lock: Mutex<()>,
}

impl FallbackStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            discounts_lock: Mutex::new(()),
            users_lock: Mutex::new(()),
        }
    }

    pub fn discounts_path(&self) -> PathBuf {
        self.dir.join("discounts.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.dir.join("users.json")
    }

    async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_snapshot<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(items)?;
        let temp_path = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes).await?;
        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn with_discounts<T>(
        &self,
        apply: impl FnOnce(&mut Vec<Discount>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.discounts_lock.lock().await;
        let path = self.discounts_path();
        let mut items = Self::read_snapshot(&path).await?;
        let out = apply(&mut items)?;
        Self::write_snapshot(&path, &items).await?;
        Ok(out)
    }

    async fn with_users<T>(
        &self,
        apply: impl FnOnce(&mut Vec<User>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.users_lock.lock().await;
        let path = self.users_path();
        let mut items = Self::read_snapshot(&path).await?;
        let out = apply(&mut items)?;
        Self::write_snapshot(&path, &items).await?;
        Ok(out)
    }
}

fn locate(items: &[Discount], reference: &DiscountRef) -> Option<usize> {
    if let Some(id) = reference.native_id() {
        if let Some(idx) = items.iter().position(|d| d.id == id) {
            return Some(idx);
        }
    }
    items
        .iter()
        .enumerate()
        .filter(|(_, d)| d.external_id == reference.raw())
        .min_by_key(|(_, d)| d.created_at)
        .map(|(idx, _)| idx)
}

#[async_trait]
impl RecordStore for FallbackStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn find_discount(&self, reference: &DiscountRef) -> Result<Option<Discount>, StoreError> {
        let items: Vec<Discount> = Self::read_snapshot(&self.discounts_path()).await?;
        Ok(locate(&items, reference).map(|idx| items[idx].clone()))
    }

    async fn list_active(&self) -> Result<Vec<Discount>, StoreError> {
        let items: Vec<Discount> = Self::read_snapshot(&self.discounts_path()).await?;
        let mut active: Vec<Discount> = items.into_iter().filter(|d| d.active).collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn insert_discount(&self, discount: Discount) -> Result<InsertOutcome, StoreError> {
        self.with_discounts(move |items| {
            if let Some(existing) = items
                .iter()
                .find(|d| d.source == discount.source && d.external_id == discount.external_id)
            {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
            items.push(discount.clone());
            Ok(InsertOutcome::Inserted(discount))
        })
        .await
    }

    async fn update_discount(
        &self,
        reference: &DiscountRef,
        patch: DiscountPatch,
    ) -> Result<Discount, StoreError> {
        self.with_discounts(move |items| {
            let idx = locate(items, reference).ok_or(StoreError::NotFound)?;
            items[idx].apply_patch(&patch, Utc::now());
            Ok(items[idx].clone())
        })
        .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let items: Vec<User> = Self::read_snapshot(&self.users_path()).await?;
        Ok(items.into_iter().find(|u| u.email == email))
    }

    async fn find_user_by_session(&self, token_hash: &str) -> Result<Option<User>, StoreError> {
        let items: Vec<User> = Self::read_snapshot(&self.users_path()).await?;
        Ok(items
            .into_iter()
            .find(|u| u.session_token_hash.as_deref() == Some(token_hash)))
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        self.with_users(move |items| {
            if items.iter().any(|u| u.email == user.email) {
                return Err(StoreError::DuplicateEmail(user.email.clone()));
            }
            items.push(user.clone());
            Ok(user)
        })
        .await
    }

    async fn set_session(&self, user_id: Uuid, token_hash: &str) -> Result<(), StoreError> {
        self.with_users(move |items| {
            let user = items
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or(StoreError::NotFound)?;
            user.session_token_hash = Some(token_hash.to_string());
            Ok(())
        })
        .await
    }

    async fn toggle_favorite(
        &self,
        user_id: Uuid,
        discount_id: Uuid,
    ) -> Result<BTreeSet<Uuid>, StoreError> {
        self.with_users(move |items| {
            let user = items
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or(StoreError::NotFound)?;
            if !user.favorites.remove(&discount_id) {
                user.favorites.insert(discount_id);
            }
            Ok(user.favorites.clone())
        })
        .await
    }

    async fn favorites(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError> {
        let items: Vec<User> = Self::read_snapshot(&self.users_path()).await?;
        items
            .into_iter()
            .find(|u| u.id == user_id)
            .map(|u| u.favorites)
            .ok_or(StoreError::NotFound)
    }
}

#[derive(Debug, Clone, Copy)]
struct AvailabilityProbe {
    checked_at: Instant,
    healthy: bool,
}

/// One logical store over an optional primary database and the flat-file
/// fallback.
///
/// Exactly one backend is authoritative per call: availability decides
/// first, then reads and updates fall through to the fallback when the
/// primary has no match. Results are never merged across backends, and
/// every underlying failure surfaces as a typed [`StoreError`].
#[derive(Debug)]
pub struct HybridStore {
    primary: Option<PrimaryStore>,
    fallback: FallbackStore,
    availability: Mutex<Option<AvailabilityProbe>>,
}

impl HybridStore {
    pub fn new(primary: Option<PrimaryStore>, fallback: FallbackStore) -> Self {
        Self {
            primary,
            fallback,
            availability: Mutex::new(None),
        }
    }

    /// Cheap liveness check for the primary backend; the probe result is
    /// cached briefly so an unreachable database does not stall every call.
    pub async fn is_primary_available(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };
        {
            let cached = self.availability.lock().await;
            if let Some(probe) = *cached {
                if probe.checked_at.elapsed() < AVAILABILITY_TTL {
                    return probe.healthy;
                }
            }
        }
        let healthy = primary.ping().await;
        *self.availability.lock().await = Some(AvailabilityProbe {
            checked_at: Instant::now(),
            healthy,
        });
        healthy
    }

    async fn primary_if_available(&self) -> Option<&PrimaryStore> {
        if self.is_primary_available().await {
            self.primary.as_ref()
        } else {
            None
        }
    }

    async fn degrade(&self, operation: &str, err: &StoreError) {
        warn!(error = %err, operation, "primary store failed; degrading to file fallback");
        *self.availability.lock().await = Some(AvailabilityProbe {
            checked_at: Instant::now(),
            healthy: false,
        });
    }
}

#[async_trait]
impl RecordStore for HybridStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn find_discount(&self, reference: &DiscountRef) -> Result<Option<Discount>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.find_discount(reference).await {
                Ok(Some(discount)) => return Ok(Some(discount)),
                Ok(None) => return self.fallback.find_discount(reference).await,
                Err(err) if err.is_backend_failure() => self.degrade("find_discount", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.find_discount(reference).await
    }

    async fn list_active(&self) -> Result<Vec<Discount>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.list_active().await {
                Ok(items) if !items.is_empty() => return Ok(items),
                Ok(_) => return self.fallback.list_active().await,
                Err(err) if err.is_backend_failure() => self.degrade("list_active", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.list_active().await
    }

    async fn insert_discount(&self, discount: Discount) -> Result<InsertOutcome, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.insert_discount(discount.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_backend_failure() => self.degrade("insert_discount", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.insert_discount(discount).await
    }

    async fn update_discount(
        &self,
        reference: &DiscountRef,
        patch: DiscountPatch,
    ) -> Result<Discount, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.update_discount(reference, patch.clone()).await {
                Ok(discount) => return Ok(discount),
                // The record may live under the fallback's identity scheme.
                Err(StoreError::NotFound) => {
                    return self.fallback.update_discount(reference, patch).await
                }
                Err(err) if err.is_backend_failure() => self.degrade("update_discount", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.update_discount(reference, patch).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.find_user_by_email(email).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => return self.fallback.find_user_by_email(email).await,
                Err(err) if err.is_backend_failure() => {
                    self.degrade("find_user_by_email", &err).await
                }
                Err(err) => return Err(err),
            }
        }
        self.fallback.find_user_by_email(email).await
    }

    async fn find_user_by_session(&self, token_hash: &str) -> Result<Option<User>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.find_user_by_session(token_hash).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => return self.fallback.find_user_by_session(token_hash).await,
                Err(err) if err.is_backend_failure() => {
                    self.degrade("find_user_by_session", &err).await
                }
                Err(err) => return Err(err),
            }
        }
        self.fallback.find_user_by_session(token_hash).await
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.insert_user(user.clone()).await {
                Ok(user) => return Ok(user),
                Err(err) if err.is_backend_failure() => self.degrade("insert_user", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.insert_user(user).await
    }

    async fn set_session(&self, user_id: Uuid, token_hash: &str) -> Result<(), StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.set_session(user_id, token_hash).await {
                Ok(()) => return Ok(()),
                Err(StoreError::NotFound) => {
                    return self.fallback.set_session(user_id, token_hash).await
                }
                Err(err) if err.is_backend_failure() => self.degrade("set_session", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.set_session(user_id, token_hash).await
    }

    async fn toggle_favorite(
        &self,
        user_id: Uuid,
        discount_id: Uuid,
    ) -> Result<BTreeSet<Uuid>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.toggle_favorite(user_id, discount_id).await {
                Ok(favorites) => return Ok(favorites),
                Err(StoreError::NotFound) => {
                    return self.fallback.toggle_favorite(user_id, discount_id).await
                }
                Err(err) if err.is_backend_failure() => self.degrade("toggle_favorite", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.toggle_favorite(user_id, discount_id).await
    }

    async fn favorites(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError> {
        if let Some(primary) = self.primary_if_available().await {
            match primary.favorites(user_id).await {
                Ok(favorites) => return Ok(favorites),
                Err(StoreError::NotFound) => return self.fallback.favorites(user_id).await,
                Err(err) if err.is_backend_failure() => self.degrade("favorites", &err).await,
                Err(err) => return Err(err),
            }
        }
        self.fallback.favorites(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use cuponera_core::{DiscountDraft, DraftPaymentMethod, PaymentKind};
    use tempfile::tempdir;

    fn mk_draft(source: &str, external_id: &str, title: &str) -> DiscountDraft {
        DiscountDraft {
            source: source.to_string(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            description: "test offer".to_string(),
            discount_percentage: Some(30.0),
            discount_amount: None,
            currency: None,
            url: format!("https://example.com/{external_id}"),
            affiliate_url: None,
            image_url: None,
            store_name: "Banco Uno".to_string(),
            store_slug: None,
            payment_methods: vec![DraftPaymentMethod {
                name: "Cuenta Uno".to_string(),
                kind: PaymentKind::Bank,
                slug: None,
            }],
            valid_from: None,
            valid_until: None,
        }
    }

    fn mk_discount(source: &str, external_id: &str, title: &str, hour: u32) -> Discount {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).single().unwrap();
        Discount::from_draft(mk_draft(source, external_id, title), at)
    }

    fn mk_user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: "Test".to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$test".to_string(),
            favorites: BTreeSet::new(),
            session_token_hash: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_source_insert_returns_existing_record() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());

        let first = mk_discount("mock-banco", "mb-1", "First", 9);
        let first_id = first.id;
        match store.insert_discount(first).await.expect("insert") {
            InsertOutcome::Inserted(_) => {}
            InsertOutcome::Duplicate(_) => panic!("fresh insert reported duplicate"),
        }

        let second = mk_discount("mock-banco", "mb-1", "Second", 10);
        match store.insert_discount(second).await.expect("insert") {
            InsertOutcome::Duplicate(existing) => assert_eq!(existing.id, first_id),
            InsertOutcome::Inserted(_) => panic!("duplicate insert created a second record"),
        }

        assert_eq!(store.list_active().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn same_external_id_under_other_source_is_not_a_duplicate() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());

        store
            .insert_discount(mk_discount("mock-banco", "shared", "A", 9))
            .await
            .expect("insert");
        match store
            .insert_discount(mk_discount("mock-retail", "shared", "B", 10))
            .await
            .expect("insert")
        {
            InsertOutcome::Inserted(_) => {}
            InsertOutcome::Duplicate(_) => panic!("distinct sources collided"),
        }
    }

    #[tokio::test]
    async fn find_resolves_both_reference_forms_to_the_same_record() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let inserted = match store
            .insert_discount(mk_discount("mock-banco", "mb-7", "A", 9))
            .await
            .expect("insert")
        {
            InsertOutcome::Inserted(d) => d,
            InsertOutcome::Duplicate(_) => unreachable!(),
        };

        let by_native = store
            .find_discount(&DiscountRef::parse(inserted.id.to_string()))
            .await
            .expect("find")
            .expect("present");
        let by_external = store
            .find_discount(&DiscountRef::parse("mb-7"))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(by_native.id, inserted.id);
        assert_eq!(by_external.id, inserted.id);
    }

    #[tokio::test]
    async fn native_id_wins_over_a_colliding_external_id() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let a = match store
            .insert_discount(mk_discount("mock-banco", "mb-1", "A", 9))
            .await
            .expect("insert")
        {
            InsertOutcome::Inserted(d) => d,
            InsertOutcome::Duplicate(_) => unreachable!(),
        };
        // An adversarial record whose external id is A's native id.
        let mut b = mk_discount("mock-retail", "placeholder", "B", 10);
        b.external_id = a.id.to_string();
        store.insert_discount(b).await.expect("insert");

        let found = store
            .find_discount(&DiscountRef::parse(a.id.to_string()))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, a.id);
        assert_eq!(found.title, "A");
    }

    #[tokio::test]
    async fn ambiguous_external_id_updates_the_oldest_record() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let older = match store
            .insert_discount(mk_discount("mock-banco", "shared", "Older", 8))
            .await
            .expect("insert")
        {
            InsertOutcome::Inserted(d) => d,
            InsertOutcome::Duplicate(_) => unreachable!(),
        };
        store
            .insert_discount(mk_discount("mock-retail", "shared", "Newer", 11))
            .await
            .expect("insert");

        let updated = store
            .update_discount(
                &DiscountRef::parse("shared"),
                DiscountPatch::Increment(Counter::Clicks),
            )
            .await
            .expect("update");
        assert_eq!(updated.id, older.id);
        assert_eq!(updated.clicks, 1);
    }

    #[tokio::test]
    async fn listing_is_active_only_and_newest_first() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        store
            .insert_discount(mk_discount("mock-banco", "mb-1", "Oldest", 7))
            .await
            .expect("insert");
        store
            .insert_discount(mk_discount("mock-banco", "mb-2", "Newest", 12))
            .await
            .expect("insert");
        store
            .insert_discount(mk_discount("mock-banco", "mb-3", "Middle", 9))
            .await
            .expect("insert");
        let mut inactive = mk_discount("mock-banco", "mb-4", "Hidden", 13);
        inactive.active = false;
        store.insert_discount(inactive).await.expect("insert");

        let listed = store.list_active().await.expect("list");
        let titles: Vec<&str> = listed.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Newest", "Middle", "Oldest"]);
    }

    #[tokio::test]
    async fn update_unknown_reference_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let err = store
            .update_discount(
                &DiscountRef::parse("nope"),
                DiscountPatch::Increment(Counter::Likes),
            )
            .await
            .expect_err("missing record");
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn verification_patch_persists_flag_and_timestamp() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        store
            .insert_discount(mk_discount("mock-banco", "mb-1", "A", 9))
            .await
            .expect("insert");

        let at = Utc.with_ymd_and_hms(2026, 3, 11, 4, 0, 0).single().unwrap();
        let updated = store
            .update_discount(
                &DiscountRef::parse("mb-1"),
                DiscountPatch::SetVerified { verified: true, at },
            )
            .await
            .expect("update");
        assert!(updated.verified);
        assert_eq!(updated.last_verified_at, Some(at));

        // Survives a fresh read from disk.
        let reread = store
            .find_discount(&DiscountRef::parse("mb-1"))
            .await
            .expect("find")
            .expect("present");
        assert!(reread.verified);
        assert_eq!(reread.last_verified_at, Some(at));
    }

    #[tokio::test]
    async fn concurrent_click_increments_all_land() {
        let dir = tempdir().expect("tempdir");
        let store: Arc<HybridStore> =
            Arc::new(HybridStore::new(None, FallbackStore::new(dir.path())));
        let inserted = match store
            .insert_discount(mk_discount("mock-banco", "mb-1", "A", 9))
            .await
            .expect("insert")
        {
            InsertOutcome::Inserted(d) => d,
            InsertOutcome::Duplicate(_) => unreachable!(),
        };

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let reference = DiscountRef::from_id(inserted.id);
            handles.push(tokio::spawn(async move {
                store
                    .update_discount(&reference, DiscountPatch::Increment(Counter::Clicks))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("task").expect("increment");
        }

        let final_state = store
            .find_discount(&DiscountRef::from_id(inserted.id))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(final_state.clicks, 20);
    }

    #[tokio::test]
    async fn facade_without_primary_serves_fallback_records() {
        let dir = tempdir().expect("tempdir");
        let store = HybridStore::new(None, FallbackStore::new(dir.path()));
        assert!(!store.is_primary_available().await);

        for (external_id, title, hour) in
            [("mb-1", "One", 9), ("mb-2", "Two", 10), ("mb-3", "Three", 11)]
        {
            store
                .insert_discount(mk_discount("mock-banco", external_id, title, hour))
                .await
                .expect("insert");
        }

        let listed = store.list_active().await.expect("list");
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].title, "Three");
        assert_eq!(listed[2].title, "One");
    }

    #[tokio::test]
    async fn snapshot_writes_leave_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        store
            .insert_discount(mk_discount("mock-banco", "mb-1", "A", 9))
            .await
            .expect("insert");
        store
            .update_discount(
                &DiscountRef::parse("mb-1"),
                DiscountPatch::Increment(Counter::Clicks),
            )
            .await
            .expect("update");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn user_insert_rejects_duplicate_email() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        store
            .insert_user(mk_user("ana@example.com"))
            .await
            .expect("insert");
        let err = store
            .insert_user(mk_user("ana@example.com"))
            .await
            .expect_err("duplicate email");
        assert!(matches!(err, StoreError::DuplicateEmail(_)));
    }

    #[tokio::test]
    async fn session_round_trip_finds_user_by_token_hash() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let user = store
            .insert_user(mk_user("ana@example.com"))
            .await
            .expect("insert");

        store
            .set_session(user.id, "deadbeef")
            .await
            .expect("set session");
        let found = store
            .find_user_by_session("deadbeef")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, user.id);
        assert!(store
            .find_user_by_session("feedface")
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn toggle_favorite_adds_then_removes() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path());
        let user = store
            .insert_user(mk_user("ana@example.com"))
            .await
            .expect("insert");
        let discount_id = Uuid::new_v4();

        let favorites = store
            .toggle_favorite(user.id, discount_id)
            .await
            .expect("toggle");
        assert!(favorites.contains(&discount_id));

        let favorites = store
            .toggle_favorite(user.id, discount_id)
            .await
            .expect("toggle");
        assert!(favorites.is_empty());

        assert_eq!(
            store.favorites(user.id).await.expect("favorites"),
            BTreeSet::new()
        );
    }

    #[tokio::test]
    async fn missing_snapshot_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = FallbackStore::new(dir.path().join("nested").join("deeper"));
        assert!(store.list_active().await.expect("list").is_empty());
        assert!(store
            .find_discount(&DiscountRef::parse("anything"))
            .await
            .expect("find")
            .is_none());
    }
}
