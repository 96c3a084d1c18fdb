//! CSV import pipeline
//!
//! Turns raw CSV text into create/update calls against the resource store.
//! Rows are handled strictly in file order, one at a time, so row numbers in
//! error messages are deterministic. Row numbers count the header as line 1.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::store::ResourceStore;
use crate::types::{
    ImportError, ImportMode, ImportOutcome, ImportResult, ImportRowError, NewResource, Resource,
    ResourceChanges, ResourceStatus, ResourceType, ValidationResult,
};

/// How often progress is reported while importing
const PROGRESS_EVERY: u32 = 10;

/// Accepted header spellings, keyed by lowercase name without `_`, `-` and spaces
static HEADER_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("code", "code"),
        ("name", "name"),
        ("type", "type"),
        ("resourcetype", "type"),
        ("description", "description"),
        ("categorycode", "categoryCode"),
        ("category", "categoryCode"),
        ("capacity", "capacity"),
        ("features", "features"),
        ("location", "location"),
        ("building", "building"),
        ("floor", "floor"),
        ("status", "status"),
        ("attributes", "attributes"),
        ("programids", "programIds"),
        ("programs", "programIds"),
    ])
});

fn canonical_header(raw: &str) -> String {
    let key: String = raw
        .trim()
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(|c| c.to_lowercase())
        .collect();
    HEADER_ALIASES
        .get(key.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Cheap data-line estimate used when a job is submitted (header excluded)
pub fn count_data_lines(content: &str) -> usize {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
        .saturating_sub(1)
}

/// Raw fields of one data line keyed by canonical header name
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub row: usize,
    fields: HashMap<String, String>,
}

impl ParsedRow {
    /// Trimmed value, empty when the column is absent
    pub fn get(&self, key: &str) -> &str {
        self.fields.get(key).map(|s| s.trim()).unwrap_or("")
    }

    /// Value if present and non-empty
    pub fn opt(&self, key: &str) -> Option<String> {
        let v = self.get(key);
        (!v.is_empty()).then(|| v.to_string())
    }

    fn code(&self) -> Option<String> {
        self.opt("code")
    }
}

/// Parse CSV text into rows. Unreadable records become row errors.
pub fn parse_rows(content: &str) -> Result<Vec<Result<ParsedRow, ImportRowError>>, ImportError> {
    let content = content.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(canonical_header).collect(),
        Err(e) => {
            return Err(ImportError::Row {
                row: 1,
                code: None,
                message: format!("Unreadable CSV header: {}", e),
            })
        }
    };
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::Row {
            row: 1,
            code: None,
            message: "CSV header row is missing".to_string(),
        });
    }

    let rows = reader
        .records()
        .enumerate()
        .map(|(idx, record)| {
            let row = idx + 2;
            let record = record.map_err(|e| ImportRowError {
                row,
                code: None,
                error: format!("Unreadable CSV line: {}", e),
            })?;
            let fields = headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string()))
                .collect();
            Ok(ParsedRow { row, fields })
        })
        .collect();

    Ok(rows)
}

/// Typed values of a row that passed validation
#[derive(Debug, Clone)]
struct RowValues {
    code: String,
    name: String,
    resource_type: ResourceType,
    description: Option<String>,
    status: Option<ResourceStatus>,
    capacity: Option<i32>,
    features: Vec<String>,
    location: Option<String>,
    building: Option<String>,
    floor: Option<String>,
    category_id: Option<Uuid>,
    attributes: Option<serde_json::Value>,
    program_ids: Option<Vec<String>>,
}

impl RowValues {
    fn into_new(self, user_id: Uuid) -> NewResource {
        NewResource {
            code: self.code,
            name: self.name,
            description: self.description,
            resource_type: Some(self.resource_type),
            status: self.status,
            capacity: self.capacity,
            features: self.features,
            location: self.location,
            building: self.building,
            floor: self.floor,
            category_id: self.category_id,
            attributes: self.attributes,
            program_ids: self.program_ids.unwrap_or_default(),
            created_by: Some(user_id),
        }
    }

    fn into_changes(self, user_id: Uuid) -> ResourceChanges {
        ResourceChanges {
            name: Some(self.name),
            description: self.description,
            resource_type: Some(self.resource_type),
            status: self.status,
            capacity: self.capacity,
            features: (!self.features.is_empty()).then_some(self.features),
            location: self.location,
            building: self.building,
            floor: self.floor,
            category_id: self.category_id,
            attributes: self.attributes,
            program_ids: self.program_ids,
            updated_by: Some(user_id),
        }
    }
}

/// A validated row and the resource it matched, if any
struct PreparedRow {
    values: RowValues,
    existing: Option<Resource>,
}

enum Applied {
    Created(Uuid),
    Updated,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Running counts handed to a progress sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportProgress {
    pub processed: u32,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Receives periodic progress from a running import
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: ImportProgress);
}

/// CSV import over a resource store
#[derive(Clone)]
pub struct ImportPipeline {
    resources: Arc<dyn ResourceStore>,
    large_file_bytes: usize,
}

impl ImportPipeline {
    pub fn new(resources: Arc<dyn ResourceStore>, large_file_bytes: usize) -> Self {
        Self {
            resources,
            large_file_bytes,
        }
    }

    pub fn large_file_bytes(&self) -> usize {
        self.large_file_bytes
    }

    /// Import every row. Without `skip_errors` the first failing row aborts
    /// the run and is returned as `ImportError::Row`; rows before it stay applied.
    pub async fn run(
        &self,
        csv_content: &str,
        mode: ImportMode,
        user_id: Uuid,
        skip_errors: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<ImportOutcome, ImportError> {
        let started = Instant::now();
        let rows = parse_rows(csv_content)?;
        let total = rows.len() as u32;

        let mut result = ImportResult {
            total_rows: total,
            ..Default::default()
        };
        let mut created_ids = Vec::new();

        for (idx, parsed) in rows.into_iter().enumerate() {
            let outcome = match parsed {
                Ok(row) => self.process_row(&row, mode, user_id).await,
                Err(unreadable) => Err(unreadable),
            };

            match outcome {
                Ok(Applied::Created(id)) => {
                    result.success_count += 1;
                    created_ids.push(id);
                }
                Ok(Applied::Updated) => result.updated_count += 1,
                Err(failure) => {
                    debug!("Import row failed: {}", failure);
                    result.error_count += 1;
                    if !skip_errors {
                        return Err(ImportError::Row {
                            row: failure.row,
                            code: failure.code,
                            message: failure.error,
                        });
                    }
                    result.errors.push(failure);
                }
            }

            let processed = (idx + 1) as u32;
            if let Some(sink) = progress {
                if processed % PROGRESS_EVERY == 0 || processed == total {
                    sink.report(ImportProgress {
                        processed,
                        total,
                        succeeded: result.success_count + result.updated_count,
                        failed: result.error_count,
                    })
                    .await;
                }
            }
        }

        result.processing_time = started.elapsed().as_millis() as u64;
        info!(
            "Import finished in {}ms: {} created, {} updated, {} failed of {} rows",
            result.processing_time,
            result.success_count,
            result.updated_count,
            result.error_count,
            result.total_rows
        );

        Ok(ImportOutcome {
            result,
            created_ids,
        })
    }

    /// Dry run: parse and validate every row without writing anything
    pub async fn validate(
        &self,
        csv_content: &str,
        mode: ImportMode,
        user_id: Uuid,
    ) -> Result<ValidationResult, ImportError> {
        debug!("Validating import for user {} ({} bytes)", user_id, csv_content.len());
        let rows = parse_rows(csv_content)?;

        let mut report = ValidationResult {
            total_rows: rows.len() as u32,
            ..Default::default()
        };
        // Codes a real CREATE run would already have inserted by this row
        let mut seen_codes: HashMap<String, usize> = HashMap::new();

        for parsed in rows {
            let checked = match parsed {
                Ok(row) => match self.prepare_row(&row, mode).await {
                    Ok(prepared) => {
                        let code = prepared.values.code.clone();
                        match seen_codes.get(&code).copied() {
                            Some(first) if mode == ImportMode::Create => Err(ImportRowError {
                                row: row.row,
                                code: Some(code.clone()),
                                error: format!(
                                    "Resource with code '{}' already exists (row {})",
                                    code, first
                                ),
                            }),
                            _ => {
                                seen_codes.entry(code).or_insert(row.row);
                                Ok(())
                            }
                        }
                    }
                    Err(e) => Err(e),
                },
                Err(unreadable) => Err(unreadable),
            };

            match checked {
                Ok(()) => report.valid_rows += 1,
                Err(e) => {
                    report.invalid_rows += 1;
                    report.errors.push(e);
                }
            }
        }

        report.is_valid = report.invalid_rows == 0;

        if csv_content.len() > self.large_file_bytes {
            report.warnings.push(format!(
                "File is larger than {} bytes; use the asynchronous import",
                self.large_file_bytes
            ));
        }
        if report.total_rows == 0 {
            report.warnings.push("File contains no data rows".to_string());
        }
        if report.invalid_rows > 0 {
            report.warnings.push(format!(
                "{} row(s) have errors; enable skip-errors to import the remaining rows",
                report.invalid_rows
            ));
        }

        Ok(report)
    }

    async fn process_row(
        &self,
        row: &ParsedRow,
        mode: ImportMode,
        user_id: Uuid,
    ) -> Result<Applied, ImportRowError> {
        let prepared = self.prepare_row(row, mode).await?;
        let code = prepared.values.code.clone();
        let fail = |e: anyhow::Error| ImportRowError {
            row: row.row,
            code: Some(code.clone()),
            error: e.to_string(),
        };

        match prepared.existing {
            Some(existing) => {
                self.resources
                    .update_resource(existing.id, prepared.values.into_changes(user_id))
                    .await
                    .map_err(fail)?;
                Ok(Applied::Updated)
            }
            None => {
                let created = self
                    .resources
                    .create_resource(prepared.values.into_new(user_id))
                    .await
                    .map_err(fail)?;
                Ok(Applied::Created(created.id))
            }
        }
    }

    /// Validation, lookup, mode policy and embedded-value parsing, in that order
    async fn prepare_row(&self, row: &ParsedRow, mode: ImportMode) -> Result<PreparedRow, ImportRowError> {
        let code_hint = row.code();
        let fail = |message: String| ImportRowError {
            row: row.row,
            code: code_hint.clone(),
            error: message,
        };

        // Required fields
        let missing: Vec<&str> = ["code", "name", "type"]
            .into_iter()
            .filter(|f| row.get(f).is_empty())
            .collect();
        if !missing.is_empty() {
            return Err(fail(format!("Missing required field(s): {}", missing.join(", "))));
        }
        let code = row.get("code").to_string();

        let resource_type: ResourceType = row.get("type").parse().map_err(fail)?;

        let status = row
            .opt("status")
            .map(|s| s.parse::<ResourceStatus>())
            .transpose()
            .map_err(fail)?;

        let capacity = match row.opt("capacity") {
            Some(raw) => match raw.parse::<i32>() {
                Ok(n) if n >= 0 => Some(n),
                _ => return Err(fail(format!("Invalid capacity '{}'", raw))),
            },
            None => None,
        };

        let category_id = match row.opt("categoryCode") {
            Some(category_code) => {
                let category = self
                    .resources
                    .find_category_by_code(&category_code)
                    .await
                    .map_err(|e| fail(format!("Category lookup failed: {}", e)))?;
                match category {
                    Some(c) => Some(c.id),
                    None => return Err(fail(format!("Category '{}' not found", category_code))),
                }
            }
            None => None,
        };

        // Existing resource by code
        let existing = self
            .resources
            .find_resource_by_code(&code)
            .await
            .map_err(|e| fail(format!("Resource lookup failed: {}", e)))?;

        // Mode policy
        match (mode, &existing) {
            (ImportMode::Create, Some(_)) => {
                return Err(fail(format!("Resource with code '{}' already exists", code)));
            }
            (ImportMode::Update, None) => {
                return Err(fail(format!("Resource with code '{}' does not exist", code)));
            }
            _ => {}
        }

        // Embedded JSON and lists
        let attributes = match row.opt("attributes") {
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| fail(format!("Invalid JSON in attributes: {}", e)))?;
                if !value.is_object() {
                    return Err(fail("Invalid JSON in attributes: expected an object".to_string()));
                }
                Some(value)
            }
            None => None,
        };
        let program_ids = row.opt("programIds").map(|raw| split_list(&raw));
        let features = row.opt("features").map(|raw| split_list(&raw)).unwrap_or_default();

        Ok(PreparedRow {
            values: RowValues {
                code,
                name: row.get("name").to_string(),
                resource_type,
                description: row.opt("description"),
                status,
                capacity,
                features,
                location: row.opt("location"),
                building: row.opt("building"),
                floor: row.opt("floor"),
                category_id,
                attributes,
                program_ids,
            },
            existing,
        })
    }
}

/// Keeps only the first `n` distinct rows that failed
pub fn summarize_errors(errors: &[ImportRowError], n: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    errors
        .iter()
        .filter(|e| seen.insert(e.row))
        .take(n)
        .map(|e| e.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{MemoryStore, StoreError};
    use crate::types::{CandidateFilter, Category, MaintenanceRecord};
    use anyhow::Result;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(store: Arc<MemoryStore>) -> ImportPipeline {
        ImportPipeline::new(store, 1024)
    }

    /// Store wrapper counting writes. With `blind_lookups` the code lookup
    /// always misses, as if another writer inserted between lookup and create.
    struct CountingStore {
        inner: MemoryStore,
        creates: AtomicUsize,
        updates: AtomicUsize,
        blind_lookups: bool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                creates: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                blind_lookups: false,
            }
        }
    }

    #[async_trait]
    impl ResourceStore for CountingStore {
        async fn find_resource(&self, id: Uuid) -> Result<Option<Resource>> {
            self.inner.find_resource(id).await
        }
        async fn find_resource_by_code(&self, code: &str) -> Result<Option<Resource>> {
            if self.blind_lookups {
                return Ok(None);
            }
            self.inner.find_resource_by_code(code).await
        }
        async fn find_candidates(&self, f: &CandidateFilter, limit: usize) -> Result<Vec<Resource>> {
            self.inner.find_candidates(f, limit).await
        }
        async fn create_resource(&self, input: NewResource) -> Result<Resource> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_resource(input).await
        }
        async fn update_resource(&self, id: Uuid, changes: ResourceChanges) -> Result<Resource> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_resource(id, changes).await
        }
        async fn delete_resource(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_resource(id).await
        }
        async fn count_resources(&self) -> Result<u64> {
            self.inner.count_resources().await
        }
        async fn find_category_by_code(&self, code: &str) -> Result<Option<Category>> {
            self.inner.find_category_by_code(code).await
        }
        async fn find_blocking_maintenance(
            &self,
            id: Uuid,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<MaintenanceRecord>> {
            self.inner.find_blocking_maintenance(id, start, end).await
        }
    }

    /// Reports whatever it receives
    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<ImportProgress>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, progress: ImportProgress) {
            self.reports.lock().push(progress);
        }
    }

    const ABC_WITH_BAD_B: &str = "code,name,type\nA-1,Room A,CLASSROOM\nB-1,Room B,SPACESHIP\nC-1,Room C,LABORATORY\n";

    #[test]
    fn test_count_data_lines_excludes_header_and_blanks() {
        assert_eq!(count_data_lines("code,name,type\nA,a,CLASSROOM\n\nB,b,CLASSROOM\n"), 2);
        assert_eq!(count_data_lines("code,name,type\n"), 0);
        assert_eq!(count_data_lines(""), 0);
    }

    #[test]
    fn test_parse_rows_fills_missing_trailing_fields() {
        let rows = parse_rows("code,name,type,floor\nA-1,Room A\n").unwrap();
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.row, 2);
        assert_eq!(row.get("name"), "Room A");
        assert_eq!(row.get("type"), "");
        assert_eq!(row.get("floor"), "");
    }

    #[test]
    fn test_parse_rows_maps_header_aliases() {
        let rows = parse_rows("\u{feff}Code,Name,Resource_Type,category_code,program_ids\nA,B,CLASSROOM,CAT,p1;p2\n").unwrap();
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.get("code"), "A");
        assert_eq!(row.get("type"), "CLASSROOM");
        assert_eq!(row.get("categoryCode"), "CAT");
        assert_eq!(row.get("programIds"), "p1;p2");
    }

    #[test]
    fn test_parse_rows_rejects_missing_header() {
        let err = parse_rows("").unwrap_err();
        assert!(err.to_string().contains("Row 1"));
    }

    #[tokio::test]
    async fn skip_errors_records_bad_row_and_continues() {
        let store = Arc::new(MemoryStore::new());
        let outcome = pipeline(store.clone())
            .run(ABC_WITH_BAD_B, ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();

        let result = outcome.result;
        assert_eq!(result.total_rows, 3);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].row, 3);
        assert_eq!(result.errors[0].code.as_deref(), Some("B-1"));
        assert!(result.errors[0].error.contains("SPACESHIP"));
        assert_eq!(outcome.created_ids.len(), 2);
        assert_eq!(store.resource_count(), 2);
    }

    #[tokio::test]
    async fn first_error_aborts_without_skip_errors() {
        let store = Arc::new(CountingStore::new());
        let pipeline = ImportPipeline::new(store.clone(), 1024);

        let err = pipeline
            .run(ABC_WITH_BAD_B, ImportMode::Create, Uuid::new_v4(), false, None)
            .await
            .unwrap_err();

        match err {
            ImportError::Row { row, ref code, .. } => {
                assert_eq!(row, 3);
                assert_eq!(code.as_deref(), Some("B-1"));
            }
            ref other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().starts_with("Row 3:"));
        // Row C was never reached
        assert!(store.creates.load(Ordering::SeqCst) <= 2);
        assert!(store.inner.find_resource_by_code("C-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_mode_rejects_duplicate_code_without_updating() {
        let store = Arc::new(CountingStore::new());
        let pipeline = ImportPipeline::new(store.clone(), 1024);
        let csv = "code,name,type\nR-1,Room 1,CLASSROOM\nR-1,Room 1 dup,CLASSROOM";

        let outcome = pipeline
            .run(csv, ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();

        assert_eq!(outcome.result.total_rows, 2);
        assert_eq!(outcome.result.success_count, 1);
        assert_eq!(outcome.result.error_count, 1);
        let error = &outcome.result.errors[0];
        assert_eq!(error.row, 3);
        assert!(error.error.contains("already exists"));
        assert!(error.to_string().contains("Row 3"));
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_mode_requires_existing_code() {
        let store = Arc::new(MemoryStore::new());
        let outcome = pipeline(store)
            .run("code,name,type\nNOPE,Ghost,CLASSROOM\n", ImportMode::Update, Uuid::new_v4(), true, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.error_count, 1);
        assert!(outcome.result.errors[0].error.contains("does not exist"));
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let p = pipeline(store.clone());

        let first = p
            .run("code,name,type,capacity\nR-1,Room,CLASSROOM,20\n", ImportMode::Upsert, user, false, None)
            .await
            .unwrap();
        assert_eq!(first.result.success_count, 1);

        let second = p
            .run("code,name,type,capacity\nR-1,Room renamed,CLASSROOM,40\n", ImportMode::Upsert, user, false, None)
            .await
            .unwrap();
        assert_eq!(second.result.success_count, 0);
        assert_eq!(second.result.updated_count, 1);
        assert!(second.created_ids.is_empty());

        let stored = store.find_resource_by_code("R-1").await.unwrap().unwrap();
        assert_eq!(stored.name, "Room renamed");
        assert_eq!(stored.capacity, Some(40));
        assert_eq!(stored.updated_by, Some(user));
    }

    #[tokio::test]
    async fn embedded_json_and_lists_are_parsed() {
        let store = Arc::new(MemoryStore::new());
        let category = store.add_category("LAB", "Labs");
        let csv = "code,name,type,categoryCode,features,attributes,programIds\n\
                   L-1,Chem Lab,LABORATORY,LAB,fume-hood; sink,\"{\"\"benches\"\": 12}\",CHEM;BIO\n";

        let outcome = pipeline(store.clone())
            .run(csv, ImportMode::Create, Uuid::new_v4(), false, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.success_count, 1);

        let stored = store.find_resource_by_code("L-1").await.unwrap().unwrap();
        assert_eq!(stored.category_id, Some(category.id));
        assert_eq!(stored.features, vec!["fume-hood", "sink"]);
        assert_eq!(stored.attributes["benches"], 12);
        assert_eq!(stored.program_ids, vec!["CHEM", "BIO"]);
    }

    #[tokio::test]
    async fn malformed_json_fails_only_its_row() {
        let store = Arc::new(MemoryStore::new());
        let csv = "code,name,type,attributes\nA,Room A,CLASSROOM,{broken\nB,Room B,CLASSROOM,\n";
        let outcome = pipeline(store)
            .run(csv, ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.success_count, 1);
        assert_eq!(outcome.result.errors[0].row, 2);
        assert!(outcome.result.errors[0].error.contains("Invalid JSON in attributes"));
    }

    #[tokio::test]
    async fn unknown_category_and_missing_fields_fail_rows() {
        let store = Arc::new(MemoryStore::new());
        let csv = "code,name,type,categoryCode\nA,Room A,CLASSROOM,NOPE\n,Room B,\n";
        let outcome = pipeline(store)
            .run(csv, ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.error_count, 2);
        assert!(outcome.result.errors[0].error.contains("Category 'NOPE' not found"));
        assert_eq!(outcome.result.errors[1].code, None);
        assert!(outcome.result.errors[1].error.contains("code, type"));
    }

    #[tokio::test]
    async fn invalid_capacity_fails_row() {
        let store = Arc::new(MemoryStore::new());
        let outcome = pipeline(store)
            .run("code,name,type,capacity\nA,Room,CLASSROOM,-4\n", ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();
        assert!(outcome.result.errors[0].error.contains("Invalid capacity '-4'"));
    }

    #[tokio::test]
    async fn storage_duplicate_surfaces_as_row_failure() {
        let mut store = CountingStore::new();
        store.blind_lookups = true;
        store
            .inner
            .create_resource(NewResource {
                code: "R-1".into(),
                name: "Room 1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let store = Arc::new(store);
        let pipeline = ImportPipeline::new(store.clone(), 1024);

        let outcome = pipeline
            .run("code,name,type\nR-1,Room 1,CLASSROOM\n", ImportMode::Create, Uuid::new_v4(), true, None)
            .await
            .unwrap();

        assert_eq!(outcome.result.error_count, 1);
        assert_eq!(
            outcome.result.errors[0].error,
            StoreError::DuplicateCode("R-1".into()).to_string()
        );
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.resource_count(), 1);
    }

    #[tokio::test]
    async fn progress_is_reported_periodically_and_at_end() {
        let store = Arc::new(MemoryStore::new());
        let mut csv = String::from("code,name,type\n");
        for i in 0..12 {
            csv.push_str(&format!("R-{},Room {},CLASSROOM\n", i, i));
        }
        let sink = RecordingSink::default();
        pipeline(store)
            .run(&csv, ImportMode::Create, Uuid::new_v4(), true, Some(&sink))
            .await
            .unwrap();

        let reports = sink.reports.lock().clone();
        let processed: Vec<u32> = reports.iter().map(|r| r.processed).collect();
        assert_eq!(processed, vec![10, 12]);
        assert_eq!(reports[1].succeeded, 12);
    }

    #[tokio::test]
    async fn validate_reports_without_writing() {
        let store = Arc::new(CountingStore::new());
        let pipeline = ImportPipeline::new(store.clone(), 1024);

        let report = pipeline
            .validate(ABC_WITH_BAD_B, ImportMode::Create, Uuid::new_v4())
            .await
            .unwrap();

        assert!(!report.is_valid);
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.valid_rows, 2);
        assert_eq!(report.invalid_rows, 1);
        assert_eq!(report.errors[0].row, 3);
        assert!(report.warnings.iter().any(|w| w.contains("skip-errors")));
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validate_flags_in_file_duplicates_for_create() {
        let store = Arc::new(MemoryStore::new());
        let csv = "code,name,type\nR-1,Room 1,CLASSROOM\nR-1,Room 1 dup,CLASSROOM";

        let create = pipeline(store.clone())
            .validate(csv, ImportMode::Create, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(create.invalid_rows, 1);
        assert!(create.errors[0].error.contains("already exists (row 2)"));

        let upsert = pipeline(store)
            .validate(csv, ImportMode::Upsert, Uuid::new_v4())
            .await
            .unwrap();
        assert!(upsert.is_valid);
    }

    #[tokio::test]
    async fn validate_warns_on_large_file() {
        let store = Arc::new(MemoryStore::new());
        let mut csv = String::from("code,name,type\n");
        for i in 0..60 {
            csv.push_str(&format!("R-{},Room number {},CLASSROOM\n", i, i));
        }
        let report = ImportPipeline::new(store, 256)
            .validate(&csv, ImportMode::Create, Uuid::new_v4())
            .await
            .unwrap();
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("asynchronous")));
    }

    #[test]
    fn test_summarize_errors_limits_output() {
        let errors: Vec<ImportRowError> = (2..10)
            .map(|row| ImportRowError { row, code: None, error: "bad".into() })
            .collect();
        let summary = summarize_errors(&errors, 3);
        assert_eq!(summary, vec!["Row 2: bad", "Row 3: bad", "Row 4: bad"]);
    }
}
