//! Resource database queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::services::store::StoreError;
use crate::types::{
    CandidateFilter, Category, MaintenanceRecord, NewResource, Resource, ResourceChanges,
    ResourceStatus, ResourceType,
};

const RESOURCE_COLUMNS: &str = r#"
    id, code, name, description, resource_type, status, capacity, features,
    location, building, floor, category_id, attributes, program_ids, metadata,
    created_by, updated_by, created_at, updated_at
"#;

/// Get resource by ID
pub async fn get_resource(pool: &PgPool, id: Uuid) -> Result<Option<Resource>> {
    let resource = sqlx::query_as::<_, Resource>(&format!(
        "SELECT {} FROM resources WHERE id = $1",
        RESOURCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(resource)
}

/// Get resource by its unique code
pub async fn get_resource_by_code(pool: &PgPool, code: &str) -> Result<Option<Resource>> {
    let resource = sqlx::query_as::<_, Resource>(&format!(
        "SELECT {} FROM resources WHERE code = $1",
        RESOURCE_COLUMNS
    ))
    .bind(code)
    .fetch_optional(pool)
    .await?;

    Ok(resource)
}

/// List AVAILABLE resources matching a candidate filter
pub async fn list_candidates(
    pool: &PgPool,
    filter: &CandidateFilter,
    limit: usize,
) -> Result<Vec<Resource>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "SELECT {} FROM resources WHERE status = ",
        RESOURCE_COLUMNS
    ));
    qb.push_bind(ResourceStatus::Available);

    if let Some(resource_type) = filter.resource_type {
        qb.push(" AND resource_type = ").push_bind(resource_type);
    }
    if let Some(exclude_id) = filter.exclude_id {
        qb.push(" AND id <> ").push_bind(exclude_id);
    }
    if let Some(capacity) = filter.capacity {
        qb.push(" AND capacity >= ").push_bind(capacity);
    }
    if !filter.features.is_empty() {
        qb.push(" AND features @> ").push_bind(filter.features.clone());
    }
    if let Some(ref location) = filter.location {
        qb.push(" AND location ILIKE ")
            .push_bind(contains_pattern(location))
            .push(" ESCAPE '\\'");
    }
    if let Some(ref building) = filter.building {
        qb.push(" AND building = ").push_bind(building.clone());
    }
    if let Some(ref floor) = filter.floor {
        qb.push(" AND floor = ").push_bind(floor.clone());
    }

    qb.push(" ORDER BY capacity ASC NULLS LAST, name ASC LIMIT ")
        .push_bind(limit as i64);

    let resources = qb.build_query_as::<Resource>().fetch_all(pool).await?;
    Ok(resources)
}

/// Create a new resource. A taken code is reported as `StoreError::DuplicateCode`.
pub async fn create_resource(pool: &PgPool, req: &NewResource) -> Result<Resource> {
    let result = sqlx::query_as::<_, Resource>(&format!(
        r#"
        INSERT INTO resources (
            id, code, name, description, resource_type, status, capacity, features,
            location, building, floor, category_id, attributes, program_ids, metadata,
            created_by, updated_by, created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8,
            $9, $10, $11, $12, $13, $14, '{{}}'::jsonb,
            $15, $15, NOW(), NOW()
        )
        RETURNING {}
        "#,
        RESOURCE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(&req.code)
    .bind(&req.name)
    .bind(&req.description)
    .bind(req.resource_type.unwrap_or(ResourceType::Other))
    .bind(req.status.unwrap_or_default())
    .bind(req.capacity)
    .bind(&req.features)
    .bind(&req.location)
    .bind(&req.building)
    .bind(&req.floor)
    .bind(req.category_id)
    .bind(req.attributes.clone().unwrap_or_else(|| serde_json::json!({})))
    .bind(&req.program_ids)
    .bind(req.created_by)
    .fetch_one(pool)
    .await;

    match result {
        Ok(resource) => Ok(resource),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(StoreError::DuplicateCode(req.code.clone()).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Update a resource; `None` fields keep their stored value
pub async fn update_resource(
    pool: &PgPool,
    id: Uuid,
    changes: &ResourceChanges,
) -> Result<Option<Resource>> {
    let resource = sqlx::query_as::<_, Resource>(&format!(
        r#"
        UPDATE resources SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            resource_type = COALESCE($4, resource_type),
            status = COALESCE($5, status),
            capacity = COALESCE($6, capacity),
            features = COALESCE($7, features),
            location = COALESCE($8, location),
            building = COALESCE($9, building),
            floor = COALESCE($10, floor),
            category_id = COALESCE($11, category_id),
            attributes = COALESCE($12, attributes),
            program_ids = COALESCE($13, program_ids),
            updated_by = COALESCE($14, updated_by),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        RESOURCE_COLUMNS
    ))
    .bind(id)
    .bind(&changes.name)
    .bind(&changes.description)
    .bind(changes.resource_type)
    .bind(changes.status)
    .bind(changes.capacity)
    .bind(&changes.features)
    .bind(&changes.location)
    .bind(&changes.building)
    .bind(&changes.floor)
    .bind(changes.category_id)
    .bind(&changes.attributes)
    .bind(&changes.program_ids)
    .bind(changes.updated_by)
    .fetch_optional(pool)
    .await?;

    Ok(resource)
}

/// Delete a resource
pub async fn delete_resource(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM resources WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Count all resources
pub async fn count_resources(pool: &PgPool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
        .fetch_one(pool)
        .await?;

    Ok(count.max(0) as u64)
}

/// Case-insensitive substring pattern with LIKE wildcards in `value` escaped
fn contains_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Find category by code
pub async fn get_category_by_code(pool: &PgPool, code: &str) -> Result<Option<Category>> {
    let category = sqlx::query_as::<_, Category>(
        "SELECT id, code, name FROM categories WHERE code = $1",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;

    Ok(category)
}

/// Maintenance records that block availability and overlap `[start, end)`
pub async fn list_blocking_maintenance(
    pool: &PgPool,
    resource_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MaintenanceRecord>> {
    let records = sqlx::query_as::<_, MaintenanceRecord>(
        r#"
        SELECT id, resource_id, title, starts_at, ends_at, affects_availability
        FROM maintenance_records
        WHERE resource_id = $1
          AND affects_availability
          AND starts_at < $3
          AND ends_at > $2
        ORDER BY starts_at
        "#,
    )
    .bind(resource_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
