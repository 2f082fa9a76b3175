use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::storage::RecordStore;
use crate::video::StoredRow;

const CONNECT_ATTEMPTS: u32 = 5;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id BIGSERIAL PRIMARY KEY,
            caption TEXT NOT NULL DEFAULT '',
            views BIGINT NOT NULL DEFAULT 0,
            likes BIGINT NOT NULL DEFAULT 0,
            comments BIGINT NOT NULL DEFAULT 0,
            shares BIGINT NOT NULL DEFAULT 0,
            date VARCHAR NOT NULL,
            url VARCHAR NOT NULL UNIQUE,
            score BIGINT NOT NULL DEFAULT 0,
            emoji_count BIGINT NOT NULL DEFAULT 0,
            word_count BIGINT NOT NULL DEFAULT 0,
            sports_keyword_count BIGINT NOT NULL DEFAULT 0,
            inserted_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres table store. The UNIQUE url column makes duplicate appends from
/// overlapping runs no-ops.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut attempts = 0;
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(2)
                .connect(database_url)
                .await
            {
                Ok(pool) => break pool,
                Err(e) => {
                    attempts += 1;
                    if attempts >= CONNECT_ATTEMPTS {
                        return Err(StoreError::Init(e.to_string()));
                    }
                    warn!(attempt = attempts, error = %e, "Database connect failed, retrying in 2s");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        init_db(&pool)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;
        info!("Database connected");
        Ok(Self::new(pool))
    }
}

// counts are u64 in memory, BIGINT on disk
fn to_db(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn push_row(builder: &mut QueryBuilder<'_, Postgres>, row: &StoredRow) {
    let mut tuple = builder.separated(", ");
    tuple.push_unseparated("(");
    tuple
        .push_bind(row.caption.clone())
        .push_bind(to_db(row.views))
        .push_bind(to_db(row.likes))
        .push_bind(to_db(row.comments))
        .push_bind(to_db(row.shares))
        .push_bind(row.date.clone())
        .push_bind(row.url.clone())
        .push_bind(to_db(row.score))
        .push_bind(to_db(row.emoji_count))
        .push_bind(to_db(row.word_count))
        .push_bind(to_db(row.sports_keyword_count));
    tuple.push_unseparated(")");
}

const INSERT_PREFIX: &str = "INSERT INTO videos (caption, views, likes, comments, shares, date, url, score, emoji_count, word_count, sports_keyword_count) VALUES ";
const ON_CONFLICT: &str = " ON CONFLICT (url) DO NOTHING";

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT url FROM videos")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("url"))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    async fn append_row(&self, row: &StoredRow) -> Result<(), StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(INSERT_PREFIX);
        push_row(&mut builder, row);
        builder.push(ON_CONFLICT);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// One multi-row insert inside a transaction, so a batch lands whole or not at all.
    async fn append_rows(&self, rows: &[StoredRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::<Postgres>::new(INSERT_PREFIX);
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            push_row(&mut builder, row);
        }
        builder.push(ON_CONFLICT);

        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        let skipped = rows.len() as u64 - result.rows_affected();
        if skipped > 0 {
            warn!(skipped, "Rows already present, ignored by url constraint");
        }
        Ok(())
    }
}
