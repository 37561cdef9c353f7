//! Task row CRUD operations.

use crate::error::DatabaseError;
use crate::persistence::PersistenceAdapter;
use crate::types::{TaskId, TaskRecord};
use crate::{Error, Result};
use async_trait::async_trait;

use super::{Database, TaskRow};

impl Database {
    /// Insert or replace a task row in a single statement
    pub async fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
        let row = TaskRow::from(record);

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, source_url, destination_path, status,
                bytes_downloaded, total_bytes, resume_offset, validator,
                attempt_count, last_error, last_error_kind,
                priority, sequence, eligible_at, expected_sha256,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                resume_offset = excluded.resume_offset,
                validator = excluded.validator,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                last_error_kind = excluded.last_error_kind,
                priority = excluded.priority,
                sequence = excluded.sequence,
                eligible_at = excluded.eligible_at,
                expected_sha256 = excluded.expected_sha256,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.id)
        .bind(&row.source_url)
        .bind(&row.destination_path)
        .bind(row.status)
        .bind(row.bytes_downloaded)
        .bind(row.total_bytes)
        .bind(row.resume_offset)
        .bind(&row.validator)
        .bind(row.attempt_count)
        .bind(&row.last_error)
        .bind(&row.last_error_kind)
        .bind(row.priority)
        .bind(row.sequence)
        .bind(row.eligible_at)
        .bind(&row.expected_sha256)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to save task {}: {}",
                record.id, e
            )))
        })?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT
                id, source_url, destination_path, status,
                bytes_downloaded, total_bytes, resume_offset, validator,
                attempt_count, last_error, last_error_kind,
                priority, sequence, eligible_at, expected_sha256,
                created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get task: {}",
                e
            )))
        })?;

        Ok(row.map(TaskRecord::try_from).transpose()?)
    }

    /// List all tasks in queue order
    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT
                id, source_url, destination_path, status,
                bytes_downloaded, total_bytes, resume_offset, validator,
                attempt_count, last_error, last_error_kind,
                priority, sequence, eligible_at, expected_sha256,
                created_at, updated_at
            FROM tasks
            ORDER BY priority DESC, sequence ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list tasks: {}",
                e
            )))
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match TaskRecord::try_from(row) {
                Ok(record) => records.push(record),
                // One bad row must not keep every other task from loading
                Err(e) => tracing::warn!(error = %e, "skipping unreadable task row"),
            }
        }
        Ok(records)
    }

    /// Delete a task row
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete task: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Reserve a never-used task id
    pub async fn next_task_id(&self) -> Result<TaskId> {
        let result = sqlx::query("INSERT INTO task_ids DEFAULT VALUES")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to allocate task id: {}",
                    e
                )))
            })?;
        let id = result.last_insert_rowid();

        // sqlite_sequence keeps the high-water mark; the rows themselves are not needed
        sqlx::query("DELETE FROM task_ids WHERE id < ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to prune task ids: {}",
                    e
                )))
            })?;

        Ok(TaskId(id))
    }
}

#[async_trait]
impl PersistenceAdapter for Database {
    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        self.list_tasks().await
    }

    async fn allocate_id(&self) -> Result<TaskId> {
        self.next_task_id().await
    }

    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.upsert_task(record).await
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.delete_task(id).await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
