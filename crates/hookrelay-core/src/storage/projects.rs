//! Repository for project configuration.
//!
//! Projects are created by the management surface and consumed read-mostly
//! by the delivery core; the dispatcher fronts these reads with a TTL cache.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Project, ProjectConfig, ProjectId},
};

const FETCH_PROJECT: &str = r"
SELECT id, name, project_type, config, created_at, updated_at, deleted_at
FROM projects
WHERE id = $1 AND deleted_at IS NULL
";

/// Repository for project database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO projects (id, name, project_type, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(project.project_type)
        .bind(&project.config)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a project by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(FETCH_PROJECT)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(project)
    }

    /// Finds a project by id, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or soft-deleted projects.
    pub async fn must_find_by_id(&self, id: ProjectId) -> Result<Project> {
        self.find_by_id(id).await?.ok_or_else(|| CoreError::not_found(format!("project {id}")))
    }

    /// Ids of every live project.
    ///
    /// The retention scheduler walks this to enqueue per-project sweeps.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_all_ids(&self) -> Result<Vec<ProjectId>> {
        let ids = sqlx::query_scalar::<_, ProjectId>(
            "SELECT id FROM projects WHERE deleted_at IS NULL ORDER BY id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Replaces a project's configuration block.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_config(&self, id: ProjectId, config: &ProjectConfig) -> Result<()> {
        sqlx::query(
            r"
            UPDATE projects
            SET config = $1, updated_at = NOW()
            WHERE id = $2 AND deleted_at IS NULL
            ",
        )
        .bind(sqlx::types::Json(config))
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Soft-deletes a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn soft_delete(&self, id: ProjectId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE projects SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
