//! Repository for ingest sources.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{ProjectId, Source, SourceId},
};

const SOURCE_COLUMNS: &str =
    "id, project_id, name, source_type, verifier, created_at, updated_at, deleted_at";

/// Repository for source database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a source.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sources (id, project_id, name, source_type, verifier,
                                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(source.id)
        .bind(source.project_id)
        .bind(&source.name)
        .bind(&source.source_type)
        .bind(&source.verifier)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a source by id within a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(&self, project_id: ProjectId, id: SourceId) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources
             WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(source)
    }

    /// Soft-deletes a source.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn soft_delete(&self, project_id: ProjectId, id: SourceId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE sources SET deleted_at = NOW()
            WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .bind(project_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
