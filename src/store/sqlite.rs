//! SQLite-backed user, balance and project store.
//!
//! Tables:
//! - `users`: id, name, email, credits, created_at, updated_at
//! - `processed_orders`: order_id, user_id, product_id, credits, processed_at
//! - `image_projects`: generation parameters and image location per user

use super::{now_epoch, CreditStore, Increment, OrderRef, StoreError};
use crate::projects::ImageProject;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

/// A user record as seen by billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub credits: i64,
    pub created_at: i64,
}

const PROJECT_COLUMNS: &str = "id, user_id, name, prompt, negative_prompt, image_url, s3_key,
     width, height, num_inference_steps, guidance_scale, seed, model_id, created_at, updated_at";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent readers from other processes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::from_connection(conn)
    }

    /// Create an in-memory store (for tests and dry runs).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT,
                email TEXT,
                credits INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_orders (
                order_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                product_id TEXT NOT NULL,
                credits INTEGER NOT NULL,
                processed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_orders_user ON processed_orders(user_id);

            CREATE TABLE IF NOT EXISTS image_projects (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT,
                prompt TEXT NOT NULL,
                negative_prompt TEXT,
                image_url TEXT NOT NULL,
                s3_key TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                num_inference_steps INTEGER NOT NULL,
                guidance_scale REAL NOT NULL,
                seed INTEGER NOT NULL,
                model_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_image_projects_user ON image_projects(user_id, created_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Create a user with an initial balance.
    pub fn create_user(
        &self,
        id: &str,
        name: Option<&str>,
        email: Option<&str>,
        credits: i64,
    ) -> Result<User, StoreError> {
        let now = now_epoch();
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, name, email, credits, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, email, credits, now],
        );

        match result {
            Ok(_) => Ok(User {
                id: id.to_string(),
                name: name.map(str::to_string),
                email: email.map(str::to_string),
                credits,
                created_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::UserExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, name, email, credits, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        credits: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Spend credits (e.g. per image generation).
    ///
    /// Returns the new balance. The balance never goes below zero.
    pub fn deduct_credits(&self, user_id: &str, amount: u32) -> Result<i64, StoreError> {
        let now = now_epoch();
        let conn = self.conn.lock();

        let updated = conn.execute(
            "UPDATE users SET credits = credits - ?1, updated_at = ?2
             WHERE id = ?3 AND credits >= ?1",
            params![amount, now, user_id],
        )?;

        let available: Option<i64> = conn
            .query_row(
                "SELECT credits FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        match (updated, available) {
            (_, None) => Err(StoreError::UserNotFound(user_id.to_string())),
            (0, Some(available)) => Err(StoreError::InsufficientCredits {
                required: amount,
                available,
            }),
            (_, Some(balance)) => Ok(balance),
        }
    }

    // ── Image projects ──────────────────────────────────────────────

    pub fn insert_project(&self, project: &ImageProject) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO image_projects ({PROJECT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                project.id,
                project.user_id,
                project.name,
                project.prompt,
                project.negative_prompt,
                project.image_url,
                project.s3_key,
                project.width,
                project.height,
                project.num_inference_steps,
                project.guidance_scale,
                project.seed,
                project.model_id,
                project.created_at.timestamp(),
                project.updated_at.timestamp(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            // Only the users(id) reference can fail as a foreign key here.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Err(StoreError::UserNotFound(project.user_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All projects owned by a user, most recent first.
    pub fn list_projects(&self, user_id: &str) -> Result<Vec<ImageProject>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM image_projects
             WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;

        let projects = stmt
            .query_map(params![user_id], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Delete a project if it belongs to the user. Returns whether a row was removed.
    pub fn delete_project(&self, user_id: &str, project_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM image_projects WHERE id = ?1 AND user_id = ?2",
            params![project_id, user_id],
        )?;
        Ok(deleted > 0)
    }
}

impl CreditStore for SqliteStore {
    fn increment_credits(
        &self,
        user_id: &str,
        amount: u32,
        order: Option<OrderRef<'_>>,
    ) -> Result<Increment, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn.lock();
        // Dropping `tx` without commit rolls back.
        let tx = conn.transaction()?;

        if let Some(order) = order {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO processed_orders (order_id, user_id, product_id, credits, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![order.order_id, user_id, order.product_id, amount, now],
            )?;
            if inserted == 0 {
                return Ok(Increment::AlreadyProcessed);
            }
        }

        let updated = tx.execute(
            "UPDATE users SET credits = credits + ?1, updated_at = ?2 WHERE id = ?3",
            params![amount, now, user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }

        let balance: i64 = tx.query_row(
            "SELECT credits FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(Increment::Applied { balance })
    }

    fn credit_balance(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let balance = conn
            .query_row(
                "SELECT credits FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ImageProject> {
    Ok(ImageProject {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        prompt: row.get(3)?,
        negative_prompt: row.get(4)?,
        image_url: row.get(5)?,
        s3_key: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        num_inference_steps: row.get(9)?,
        guidance_scale: row.get(10)?,
        seed: row.get(11)?,
        model_id: row.get(12)?,
        created_at: from_epoch(row.get(13)?),
        updated_at: from_epoch(row.get(14)?),
    })
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
