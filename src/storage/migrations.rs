//! Schema migrations.
//!
//! Migrations from [`schema::MIGRATIONS`](super::schema::MIGRATIONS) are
//! applied in order inside one transaction held under an advisory lock, and
//! recorded in `collect_migrations` together with a checksum of their
//! statements. A recorded migration whose statements changed afterwards
//! stops the run.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{Migration, MIGRATIONS};

/// Advisory lock key serializing collectors that start at the same time.
const MIGRATION_LOCK_KEY: i64 = 0x636f_6c6c_6563_74;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration '{name}' failed: {message}")]
    Failed { name: String, message: String },

    /// An applied migration no longer matches the statements shipped in
    /// this build.
    #[error("Migration '{name}' was modified after it was applied")]
    ChecksumMismatch { name: String },

    /// The database knows a migration this build does not.
    #[error("Database has unknown migration '{0}'; is a newer collector running?")]
    Unknown(String),
}

/// A migration recorded in the database.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// SHA-256 over the statements of `migration`, separated by NUL bytes.
pub fn checksum(migration: &Migration) -> String {
    let mut hasher = Sha256::new();
    for statement in migration.statements {
        hasher.update(statement.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Migrations of `known` missing from `applied`, after checking that the
/// applied ones still match.
pub fn pending<'a>(
    known: &'a [Migration],
    applied: &[AppliedMigration],
) -> Result<Vec<&'a Migration>, MigrationError> {
    for record in applied {
        let migration = known
            .iter()
            .find(|m| m.name == record.name)
            .ok_or_else(|| MigrationError::Unknown(record.name.clone()))?;
        if checksum(migration) != record.checksum {
            return Err(MigrationError::ChecksumMismatch {
                name: record.name.clone(),
            });
        }
    }

    Ok(known
        .iter()
        .filter(|m| !applied.iter().any(|a| a.name == m.name))
        .collect())
}

/// Applies [`MIGRATIONS`] to a Postgres pool.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies pending migrations and returns how many ran. A second run
    /// applies nothing.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let applied = self.applied_in(&mut *tx).await?;
        let todo = pending(MIGRATIONS, &applied)?;

        for migration in &todo {
            debug!(migration = migration.name, "Applying migration");
            for statement in migration.statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationError::Failed {
                        name: migration.name.to_string(),
                        message: e.to_string(),
                    })?;
            }
            sqlx::query("INSERT INTO collect_migrations (name, checksum) VALUES ($1, $2)")
                .bind(migration.name)
                .bind(checksum(migration))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if !todo.is_empty() {
            info!(
                applied = todo.len(),
                latest = todo.last().map(|m| m.name).unwrap_or_default(),
                "Database schema migrated"
            );
        }
        Ok(todo.len())
    }

    /// Migrations recorded in the database, oldest first.
    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;
        let mut conn = self.pool.acquire().await?;
        self.applied_in(&mut *conn).await
    }

    async fn applied_in(
        &self,
        conn: &mut sqlx::PgConnection,
    ) -> Result<Vec<AppliedMigration>, MigrationError> {
        let rows = sqlx::query_as::<_, AppliedMigration>(
            "SELECT name, checksum, applied_at FROM collect_migrations ORDER BY name",
        )
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collect_migrations (
                name TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
