use crate::config::DatabaseConfig;
use crate::error::{StoreError, ValidationError};
use crate::models::{Container, ContainerPatch, LegacyEntry, NewContainer, Role, Shipper};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Typed access to the `shippers`, `containers`, `user_roles` and legacy
/// `entries` tables. Rows never leave this boundary untyped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;

    /// All shippers, newest first
    async fn list_shippers(&self) -> Result<Vec<Shipper>, StoreError>;

    async fn create_shipper(&self, user_id: Uuid, name: String) -> Result<Shipper, StoreError>;

    /// Delete the shipper row only; fails while containers still reference it
    async fn delete_shipper(&self, id: Uuid) -> Result<(), StoreError>;

    /// Delete the shipper and its containers in one transaction
    async fn delete_shipper_cascade(&self, id: Uuid) -> Result<u64, StoreError>;

    /// Containers of one shipper, newest first
    async fn list_containers(&self, shipper_id: Uuid) -> Result<Vec<Container>, StoreError>;

    async fn create_container(&self, fields: NewContainer) -> Result<Container, StoreError>;

    /// Insert all rows or none
    async fn create_containers(
        &self,
        batch: Vec<NewContainer>,
    ) -> Result<Vec<Container>, StoreError>;

    async fn delete_container(&self, id: Uuid) -> Result<(), StoreError>;

    async fn delete_containers_for_shipper(&self, shipper_id: Uuid) -> Result<u64, StoreError>;

    async fn update_container(
        &self,
        id: Uuid,
        patch: ContainerPatch,
    ) -> Result<Container, StoreError>;

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool, StoreError>;

    /// Legacy flat entries, newest first
    async fn list_legacy_entries(&self) -> Result<Vec<LegacyEntry>, StoreError>;

    async fn delete_legacy_entry(&self, id: Uuid) -> Result<(), StoreError>;
}

const CONTAINER_COLUMNS: &str = r#"
    id, shipper_id, user_id, container_photo_url, commodity_photo_url,
    ispm_photo_url, latitude, longitude, created_at, custom_timestamp,
    verified, verified_at, verified_by
"#;

/// Record store backed by PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn insert_container<'e, E>(
        executor: E,
        fields: &NewContainer,
    ) -> Result<Container, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            r#"
            INSERT INTO containers (
                id, shipper_id, user_id, container_photo_url, commodity_photo_url,
                ispm_photo_url, latitude, longitude, created_at, verified
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, NOW(), FALSE
            )
            RETURNING {CONTAINER_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Container>(&sql)
            .bind(Uuid::new_v4())
            .bind(fields.shipper_id)
            .bind(fields.user_id)
            .bind(&fields.container_photo_url)
            .bind(&fields.commodity_photo_url)
            .bind(&fields.ispm_photo_url)
            .bind(fields.latitude)
            .bind(fields.longitude)
            .fetch_one(executor)
            .await
            .map_err(|e| map_insert_error(e, fields.shipper_id))
    }
}

fn map_insert_error(err: sqlx::Error, shipper_id: Uuid) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::InvalidReference { shipper_id }
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_shippers(&self) -> Result<Vec<Shipper>, StoreError> {
        let shippers = sqlx::query_as::<_, Shipper>(
            r#"
            SELECT id, user_id, name, created_at
            FROM shippers
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(shippers)
    }

    #[instrument(skip(self))]
    async fn create_shipper(&self, user_id: Uuid, name: String) -> Result<Shipper, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyShipperName.into());
        }

        let shipper = sqlx::query_as::<_, Shipper>(
            r#"
            INSERT INTO shippers (id, user_id, name, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, user_id, name, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        debug!(shipper_id = %shipper.id, "Shipper created");
        Ok(shipper)
    }

    #[instrument(skip(self))]
    async fn delete_shipper(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM shippers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "shipper",
                id,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_shipper_cascade(&self, id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let containers = sqlx::query("DELETE FROM containers WHERE shipper_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let shippers = sqlx::query("DELETE FROM shippers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if shippers == 0 {
            // dropping the transaction rolls the container deletes back
            return Err(StoreError::NotFound {
                entity: "shipper",
                id,
            });
        }

        tx.commit().await?;

        info!(shipper_id = %id, containers_deleted = containers, "Shipper deleted");
        Ok(containers)
    }

    #[instrument(skip(self))]
    async fn list_containers(&self, shipper_id: Uuid) -> Result<Vec<Container>, StoreError> {
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers \
             WHERE shipper_id = $1 ORDER BY created_at DESC"
        );

        let containers = sqlx::query_as::<_, Container>(&sql)
            .bind(shipper_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(containers)
    }

    #[instrument(skip(self, fields), fields(shipper_id = %fields.shipper_id))]
    async fn create_container(&self, fields: NewContainer) -> Result<Container, StoreError> {
        let container = Self::insert_container(&self.pool, &fields).await?;
        metrics::counter!("inspection.containers.created").increment(1);
        Ok(container)
    }

    #[instrument(skip(self, batch), fields(count = batch.len()))]
    async fn create_containers(
        &self,
        batch: Vec<NewContainer>,
    ) -> Result<Vec<Container>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(batch.len());

        for fields in &batch {
            created.push(Self::insert_container(&mut *tx, fields).await?);
        }

        tx.commit().await?;

        metrics::counter!("inspection.containers.created").increment(created.len() as u64);
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_container(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM containers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "container",
                id,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_containers_for_shipper(&self, shipper_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM containers WHERE shipper_id = $1")
            .bind(shipper_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, patch))]
    async fn update_container(
        &self,
        id: Uuid,
        patch: ContainerPatch,
    ) -> Result<Container, StoreError> {
        let mut assignments: Vec<String> = Vec::new();
        let mut param_count = 1;

        if patch.verification().is_some() {
            assignments.push("verified = TRUE".to_string());
            param_count += 1;
            assignments.push(format!("verified_at = ${param_count}"));
            param_count += 1;
            assignments.push(format!("verified_by = ${param_count}"));
        }

        if patch.custom_timestamp_change().is_some() {
            param_count += 1;
            assignments.push(format!("custom_timestamp = ${param_count}"));
        }

        let sql = if assignments.is_empty() {
            format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = $1")
        } else {
            format!(
                "UPDATE containers SET {} WHERE id = $1 RETURNING {CONTAINER_COLUMNS}",
                assignments.join(", ")
            )
        };

        let mut query = sqlx::query_as::<_, Container>(&sql).bind(id);

        if let Some((at, actor)) = patch.verification() {
            query = query.bind(at).bind(actor);
        }
        if let Some(custom_timestamp) = patch.custom_timestamp_change() {
            query = query.bind(custom_timestamp);
        }

        query
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "container",
                id,
            })
    }

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_roles WHERE user_id = $1 AND role = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn list_legacy_entries(&self) -> Result<Vec<LegacyEntry>, StoreError> {
        let entries = sqlx::query_as::<_, LegacyEntry>(
            r#"
            SELECT id, user_id, shipper, container_photo_url, commodity_photo_url,
                   ispm_photo_url, latitude, longitude, created_at
            FROM entries
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn delete_legacy_entry(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
