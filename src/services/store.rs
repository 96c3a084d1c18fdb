//! Storage abstraction for resources and import jobs
//!
//! Two backends sit behind the same traits:
//! - `PgStore` → PostgreSQL via sqlx (production)
//! - `MemoryStore` → in-process maps (tests, local development)
//!
//! Selected via STORE_BACKEND env variable ("postgres" or "memory").

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::queries;
use crate::types::{
    CandidateFilter, Category, ImportJob, MaintenanceRecord, NewResource, Resource,
    ResourceChanges, ResourceStatus,
};

/// Storage-level failures the callers need to tell apart
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Resource with code '{0}' already exists")]
    DuplicateCode(String),
    #[error("Resource {0} not found")]
    ResourceNotFound(Uuid),
}

/// Result of an optimistic save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Stored; carries the new version
    Saved(i64),
    /// Stored version differs from the one the caller read
    Conflict,
}

/// Resource repository
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn find_resource(&self, id: Uuid) -> Result<Option<Resource>>;

    async fn find_resource_by_code(&self, code: &str) -> Result<Option<Resource>>;

    /// `AVAILABLE` resources matching the filter, at most `limit`
    async fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Resource>>;

    /// Fails with `StoreError::DuplicateCode` when the code is taken
    async fn create_resource(&self, input: NewResource) -> Result<Resource>;

    async fn update_resource(&self, id: Uuid, changes: ResourceChanges) -> Result<Resource>;

    /// Returns false if nothing was deleted
    async fn delete_resource(&self, id: Uuid) -> Result<bool>;

    async fn count_resources(&self) -> Result<u64>;

    async fn find_category_by_code(&self, code: &str) -> Result<Option<Category>>;

    /// Maintenance records that block availability and overlap `[start, end)`
    async fn find_blocking_maintenance(
        &self,
        resource_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceRecord>>;
}

/// Import job repository
#[async_trait]
pub trait ImportJobStore: Send + Sync {
    async fn insert_job(&self, job: &ImportJob) -> Result<()>;

    async fn find_job(&self, id: Uuid) -> Result<Option<ImportJob>>;

    /// Persist `job` if the stored version still equals `job.version`
    async fn save_job(&self, job: &ImportJob) -> Result<SaveOutcome>;
}

/// Both repositories behind shared handles
#[derive(Clone)]
pub struct Stores {
    pub resources: Arc<dyn ResourceStore>,
    pub jobs: Arc<dyn ImportJobStore>,
}

impl Stores {
    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let stores = Self {
            resources: store.clone(),
            jobs: store.clone(),
        };
        (stores, store)
    }

    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            resources: store.clone(),
            jobs: store,
        }
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn find_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        queries::resource::get_resource(&self.pool, id).await
    }

    async fn find_resource_by_code(&self, code: &str) -> Result<Option<Resource>> {
        queries::resource::get_resource_by_code(&self.pool, code).await
    }

    async fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Resource>> {
        queries::resource::list_candidates(&self.pool, filter, limit).await
    }

    async fn create_resource(&self, input: NewResource) -> Result<Resource> {
        queries::resource::create_resource(&self.pool, &input).await
    }

    async fn update_resource(&self, id: Uuid, changes: ResourceChanges) -> Result<Resource> {
        queries::resource::update_resource(&self.pool, id, &changes)
            .await?
            .ok_or_else(|| StoreError::ResourceNotFound(id).into())
    }

    async fn delete_resource(&self, id: Uuid) -> Result<bool> {
        queries::resource::delete_resource(&self.pool, id).await
    }

    async fn count_resources(&self) -> Result<u64> {
        queries::resource::count_resources(&self.pool).await
    }

    async fn find_category_by_code(&self, code: &str) -> Result<Option<Category>> {
        queries::resource::get_category_by_code(&self.pool, code).await
    }

    async fn find_blocking_maintenance(
        &self,
        resource_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceRecord>> {
        queries::resource::list_blocking_maintenance(&self.pool, resource_id, start, end).await
    }
}

#[async_trait]
impl ImportJobStore for PgStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<()> {
        queries::import_job::insert_import_job(&self.pool, job).await
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        queries::import_job::get_import_job(&self.pool, id).await
    }

    async fn save_job(&self, job: &ImportJob) -> Result<SaveOutcome> {
        let saved = queries::import_job::update_import_job(&self.pool, job).await?;
        Ok(match saved {
            Some(version) => SaveOutcome::Saved(version),
            None => SaveOutcome::Conflict,
        })
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Map-backed store with the same uniqueness and versioning rules as PostgreSQL
#[derive(Default)]
pub struct MemoryStore {
    resources: RwLock<HashMap<Uuid, Resource>>,
    categories: RwLock<Vec<Category>>,
    maintenance: RwLock<Vec<MaintenanceRecord>>,
    jobs: RwLock<HashMap<Uuid, ImportJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn add_category(&self, code: &str, name: &str) -> Category {
        let category = Category {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: name.to_string(),
        };
        self.categories.write().push(category.clone());
        category
    }

    #[cfg(test)]
    pub fn add_maintenance(&self, record: MaintenanceRecord) {
        self.maintenance.write().push(record);
    }

    #[cfg(test)]
    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    fn build_resource(input: NewResource) -> Resource {
        let now = Utc::now();
        Resource {
            id: Uuid::new_v4(),
            code: input.code,
            name: input.name,
            description: input.description,
            resource_type: input.resource_type.unwrap_or(crate::types::ResourceType::Other),
            status: input.status.unwrap_or(ResourceStatus::Available),
            capacity: input.capacity,
            features: input.features,
            location: input.location,
            building: input.building,
            floor: input.floor,
            category_id: input.category_id,
            attributes: input.attributes.unwrap_or_else(|| serde_json::json!({})),
            program_ids: input.program_ids,
            metadata: serde_json::json!({}),
            created_by: input.created_by,
            updated_by: input.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn find_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.resources.read().get(&id).cloned())
    }

    async fn find_resource_by_code(&self, code: &str) -> Result<Option<Resource>> {
        Ok(self
            .resources
            .read()
            .values()
            .find(|r| r.code == code)
            .cloned())
    }

    async fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Resource>> {
        let mut matches: Vec<Resource> = self
            .resources
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.capacity
                .unwrap_or(i32::MAX)
                .cmp(&b.capacity.unwrap_or(i32::MAX))
                .then_with(|| a.name.cmp(&b.name))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn create_resource(&self, input: NewResource) -> Result<Resource> {
        let mut resources = self.resources.write();
        if resources.values().any(|r| r.code == input.code) {
            return Err(StoreError::DuplicateCode(input.code).into());
        }
        let resource = Self::build_resource(input);
        resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn update_resource(&self, id: Uuid, changes: ResourceChanges) -> Result<Resource> {
        let mut resources = self.resources.write();
        let resource = resources
            .get_mut(&id)
            .ok_or(StoreError::ResourceNotFound(id))?;
        changes.apply_to(resource);
        Ok(resource.clone())
    }

    async fn delete_resource(&self, id: Uuid) -> Result<bool> {
        Ok(self.resources.write().remove(&id).is_some())
    }

    async fn count_resources(&self) -> Result<u64> {
        Ok(self.resources.read().len() as u64)
    }

    async fn find_category_by_code(&self, code: &str) -> Result<Option<Category>> {
        Ok(self
            .categories
            .read()
            .iter()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn find_blocking_maintenance(
        &self,
        resource_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceRecord>> {
        Ok(self
            .maintenance
            .read()
            .iter()
            .filter(|m| m.resource_id == resource_id && m.affects_availability && m.overlaps(start, end))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ImportJobStore for MemoryStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<()> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn save_job(&self, job: &ImportJob) -> Result<SaveOutcome> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job.id) {
            Some(stored) if stored.version == job.version => {
                let mut next = job.clone();
                next.version += 1;
                let version = next.version;
                *stored = next;
                Ok(SaveOutcome::Saved(version))
            }
            _ => Ok(SaveOutcome::Conflict),
        }
    }
}
