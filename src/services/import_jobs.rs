//! Import job lifecycle
//!
//! Asynchronous imports are recorded as `ImportJob`s and processed on a
//! background task; callers poll by id. Every job mutation happens under the
//! per-job lock and is saved with an optimistic version check.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::import_pipeline::{
    count_data_lines, summarize_errors, ImportPipeline, ImportProgress, ProgressSink,
};
use crate::services::job_locks::JobLocks;
use crate::services::store::{ImportJobStore, ResourceStore, SaveOutcome, Stores};
use crate::types::{
    ImportError, ImportJob, ImportJobStatus, ImportMode, ImportResult, RollbackResult,
    ValidationResult,
};

/// Row errors echoed to the log when a job finishes
const LOGGED_ROW_ERRORS: usize = 5;

/// Parameters of an asynchronous import
#[derive(Debug, Clone)]
pub struct AsyncImportRequest {
    pub user_id: Uuid,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub csv_content: String,
    pub mode: ImportMode,
    pub skip_errors: bool,
}

/// Persists running counts while the worker owns the job
struct JobProgress {
    jobs: Arc<dyn ImportJobStore>,
    job: AsyncMutex<ImportJob>,
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn report(&self, progress: ImportProgress) {
        let mut job = self.job.lock().await;
        job.total_rows = progress.total as i32;
        job.processed_rows = progress.processed.min(progress.total) as i32;
        job.success_count = progress.succeeded as i32;
        job.error_count = progress.failed as i32;

        match self.jobs.save_job(&job).await {
            Ok(SaveOutcome::Saved(version)) => job.version = version,
            Ok(SaveOutcome::Conflict) => {
                warn!("Import job {} progress skipped: version conflict", job.id)
            }
            Err(e) => warn!("Import job {} progress not saved: {}", job.id, e),
        }
    }
}

/// Entry point for synchronous imports, dry runs and import jobs
#[derive(Clone)]
pub struct ImportJobTracker {
    jobs: Arc<dyn ImportJobStore>,
    resources: Arc<dyn ResourceStore>,
    pipeline: ImportPipeline,
    locks: JobLocks,
    workers: Arc<Mutex<JoinSet<()>>>,
}

impl ImportJobTracker {
    /// Files above `sync_import_max_bytes` must use `start_async_import`
    pub fn new(stores: &Stores, sync_import_max_bytes: usize) -> Self {
        Self {
            jobs: stores.jobs.clone(),
            resources: stores.resources.clone(),
            pipeline: ImportPipeline::new(stores.resources.clone(), sync_import_max_bytes),
            locks: JobLocks::new(),
            workers: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Run an import inline and return its result
    pub async fn import_sync(
        &self,
        csv_content: &str,
        mode: ImportMode,
        skip_errors: bool,
        user_id: Uuid,
    ) -> Result<ImportResult, ImportError> {
        let limit = self.pipeline.large_file_bytes();
        if csv_content.len() > limit {
            return Err(ImportError::FileTooLarge {
                size: csv_content.len(),
                limit,
            });
        }

        info!(
            "Synchronous import by {} ({} bytes, mode {}, skip errors: {})",
            user_id,
            csv_content.len(),
            mode,
            skip_errors
        );
        let outcome = self
            .pipeline
            .run(csv_content, mode, user_id, skip_errors, None)
            .await?;
        Ok(outcome.result)
    }

    /// Dry run
    pub async fn validate(
        &self,
        csv_content: &str,
        mode: ImportMode,
        user_id: Uuid,
    ) -> Result<ValidationResult, ImportError> {
        self.pipeline.validate(csv_content, mode, user_id).await
    }

    /// Record a `PENDING` job and process it in the background
    pub async fn start_async_import(&self, req: AsyncImportRequest) -> Result<ImportJob, ImportError> {
        let total_rows = count_data_lines(&req.csv_content) as i32;
        let file_size = req.file_size.unwrap_or(req.csv_content.len() as i64);
        let job = ImportJob::submit(
            req.user_id,
            req.file_name,
            file_size,
            total_rows,
            req.mode,
            req.skip_errors,
        );
        self.jobs.insert_job(&job).await?;
        info!(
            "Import job {} submitted by {}: {} ({} rows, mode {})",
            job.id, job.user_id, job.file_name, total_rows, job.mode
        );

        let tracker = self.clone();
        let job_id = job.id;
        let csv_content = req.csv_content;
        let mut workers = self.workers.lock();
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            if let Err(e) = tracker.process_job(job_id, csv_content).await {
                error!("Import job {} could not be processed: {}", job_id, e);
            }
        });

        Ok(job)
    }

    /// Job by id, visible to its owner only
    pub async fn get_import_job(&self, job_id: Uuid, user_id: Uuid) -> Result<ImportJob, ImportError> {
        let job = self.load(job_id).await?;
        if job.user_id != user_id {
            return Err(ImportError::NotOwner(job_id));
        }
        Ok(job)
    }

    /// Delete the resources a completed job created and mark it `ROLLED_BACK`.
    /// Deletion is best effort; failures are reported in the result.
    pub async fn rollback_import(
        &self,
        job_id: Uuid,
        reason: Option<String>,
        user_id: Uuid,
    ) -> Result<RollbackResult, ImportError> {
        // Cheap checks before queueing behind the job's lock
        self.check_rollback(&self.load(job_id).await?, user_id)?;

        let _guard = self.locks.lock(job_id).await;
        let mut job = self.load(job_id).await?;
        self.check_rollback(&job, user_id)?;

        let mut deleted_resource_ids = Vec::new();
        let mut failed_resource_ids = Vec::new();
        for resource_id in job.resource_ids.clone() {
            match self.resources.delete_resource(resource_id).await {
                Ok(true) => deleted_resource_ids.push(resource_id),
                Ok(false) => warn!(
                    "Rollback of job {}: resource {} was already gone",
                    job_id, resource_id
                ),
                Err(e) => {
                    warn!(
                        "Rollback of job {}: could not delete resource {}: {}",
                        job_id, resource_id, e
                    );
                    failed_resource_ids.push(resource_id);
                }
            }
        }

        job.roll_back(reason)?;
        self.save(&mut job).await?;
        info!(
            "Import job {} rolled back by {}: {} deleted, {} failed",
            job_id,
            user_id,
            deleted_resource_ids.len(),
            failed_resource_ids.len()
        );

        Ok(RollbackResult {
            job_id,
            deleted_count: deleted_resource_ids.len() as u32,
            success: failed_resource_ids.is_empty(),
            deleted_resource_ids,
            failed_resource_ids,
        })
    }

    /// Wait for every background job started so far
    pub async fn wait_idle(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock());
        while workers.join_next().await.is_some() {}
    }

    fn check_rollback(&self, job: &ImportJob, user_id: Uuid) -> Result<(), ImportError> {
        if job.user_id != user_id {
            return Err(ImportError::NotOwner(job.id));
        }
        if job.status != ImportJobStatus::Completed {
            return Err(ImportError::InvalidState {
                id: job.id,
                status: job.status,
            });
        }
        Ok(())
    }

    async fn load(&self, job_id: Uuid) -> Result<ImportJob, ImportError> {
        self.jobs
            .find_job(job_id)
            .await?
            .ok_or(ImportError::JobNotFound(job_id))
    }

    async fn save(&self, job: &mut ImportJob) -> Result<(), ImportError> {
        match self.jobs.save_job(job).await? {
            SaveOutcome::Saved(version) => {
                job.version = version;
                Ok(())
            }
            SaveOutcome::Conflict => Err(ImportError::Conflict(job.id)),
        }
    }

    /// Background worker: `PENDING -> PROCESSING -> COMPLETED | FAILED`.
    /// Any error on the way leaves the job `FAILED`, never stuck.
    async fn process_job(&self, job_id: Uuid, csv_content: String) -> Result<(), ImportError> {
        let _guard = match self.locks.try_lock(job_id) {
            Some(guard) => guard,
            None => {
                debug!("Import job {} is busy, waiting for its lock", job_id);
                self.locks.lock(job_id).await
            }
        };

        match self.run_job(job_id, &csv_content).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Import job {} aborted: {}", job_id, e);
                self.mark_failed(job_id, &e).await
            }
        }
    }

    /// Reload the job and record `error` on it, unless it already finished
    async fn mark_failed(&self, job_id: Uuid, error: &ImportError) -> Result<(), ImportError> {
        let mut job = self.load(job_id).await?;
        match job.status {
            ImportJobStatus::Pending => job.start()?,
            ImportJobStatus::Processing => {}
            _ => return Ok(()),
        }
        job.fail(error.to_string())?;
        self.save(&mut job).await
    }

    async fn run_job(&self, job_id: Uuid, csv_content: &str) -> Result<(), ImportError> {
        let mut job = self.load(job_id).await?;
        job.start()?;
        self.save(&mut job).await?;

        let (mode, user_id, skip_errors) = (job.mode, job.user_id, job.skip_errors);
        info!("Import job {} processing {} rows", job_id, job.total_rows);

        let progress = JobProgress {
            jobs: self.jobs.clone(),
            job: AsyncMutex::new(job),
        };
        let outcome = self
            .pipeline
            .run(csv_content, mode, user_id, skip_errors, Some(&progress))
            .await;
        let mut job = progress.job.into_inner();

        match outcome {
            Ok(outcome) => {
                job.complete(&outcome)?;
                let result = &outcome.result;
                info!(
                    "Import job {} completed in {}ms: {} created, {} updated, {} failed",
                    job_id,
                    result.processing_time,
                    result.success_count,
                    result.updated_count,
                    result.error_count
                );
                for line in summarize_errors(&result.errors, LOGGED_ROW_ERRORS) {
                    warn!("Import job {}: {}", job_id, line);
                }
            }
            Err(e) => {
                warn!("Import job {} failed: {}", job_id, e);
                job.fail(e.to_string())?;
            }
        }

        self.save(&mut job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use crate::types::NewResource;
    use std::time::Duration;

    const ABC_WITH_BAD_B: &str =
        "code,name,type\nA-1,Room A,CLASSROOM\nB-1,Room B,SPACESHIP\nC-1,Room C,LABORATORY\n";

    fn tracker() -> (ImportJobTracker, Arc<MemoryStore>) {
        let (stores, memory) = Stores::memory();
        (ImportJobTracker::new(&stores, 1024), memory)
    }

    fn request(user_id: Uuid, csv: &str, skip_errors: bool) -> AsyncImportRequest {
        AsyncImportRequest {
            user_id,
            file_name: "rooms.csv".into(),
            file_size: None,
            csv_content: csv.to_string(),
            mode: ImportMode::Create,
            skip_errors,
        }
    }

    async fn poll_until_finished(tracker: &ImportJobTracker, job_id: Uuid, user_id: Uuid) -> ImportJob {
        for _ in 0..200 {
            let job = tracker.get_import_job(job_id, user_id).await.unwrap();
            if matches!(job.status, ImportJobStatus::Completed | ImportJobStatus::Failed) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never finished", job_id);
    }

    async fn completed_job(tracker: &ImportJobTracker, user_id: Uuid, csv: &str) -> ImportJob {
        let job = tracker.start_async_import(request(user_id, csv, true)).await.unwrap();
        tracker.wait_idle().await;
        let job = tracker.get_import_job(job.id, user_id).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Completed);
        job
    }

    #[tokio::test]
    async fn async_import_runs_to_completion() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();

        let submitted = tracker
            .start_async_import(request(user, ABC_WITH_BAD_B, true))
            .await
            .unwrap();
        assert_eq!(submitted.status, ImportJobStatus::Pending);
        assert_eq!(submitted.total_rows, 3);
        assert_eq!(submitted.file_size, ABC_WITH_BAD_B.len() as i64);

        let job = poll_until_finished(&tracker, submitted.id, user).await;
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.total_rows, 3);
        assert_eq!(job.processed_rows, 3);
        assert_eq!(job.success_count, 2);
        assert_eq!(job.error_count, 1);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].starts_with("Row 3 (B-1):"));
        assert_eq!(job.resource_ids.len(), 2);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(store.resource_count(), 2);
    }

    #[tokio::test]
    async fn async_import_without_skip_errors_fails_job() {
        let (tracker, _) = tracker();
        let user = Uuid::new_v4();

        let submitted = tracker
            .start_async_import(request(user, ABC_WITH_BAD_B, false))
            .await
            .unwrap();
        let job = poll_until_finished(&tracker, submitted.id, user).await;

        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].starts_with("Row 3:"));
        assert!(job.resource_ids.is_empty());
    }

    /// Job store whose n-th `save_job` call fails
    struct FlakySaves {
        inner: Arc<MemoryStore>,
        calls: std::sync::atomic::AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl ImportJobStore for FlakySaves {
        async fn insert_job(&self, job: &ImportJob) -> anyhow::Result<()> {
            self.inner.insert_job(job).await
        }
        async fn find_job(&self, id: Uuid) -> anyhow::Result<Option<ImportJob>> {
            self.inner.find_job(id).await
        }
        async fn save_job(&self, job: &ImportJob) -> anyhow::Result<SaveOutcome> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call == self.fail_on {
                anyhow::bail!("connection reset by peer");
            }
            self.inner.save_job(job).await
        }
    }

    fn flaky_tracker(fail_on: usize) -> ImportJobTracker {
        let (stores, memory) = Stores::memory();
        let stores = Stores {
            resources: stores.resources,
            jobs: Arc::new(FlakySaves {
                inner: memory,
                calls: Default::default(),
                fail_on,
            }),
        };
        ImportJobTracker::new(&stores, 1024)
    }

    #[tokio::test]
    async fn storage_error_on_start_fails_job() {
        let tracker = flaky_tracker(1);
        let user = Uuid::new_v4();

        let submitted = tracker
            .start_async_import(request(user, ABC_WITH_BAD_B, true))
            .await
            .unwrap();
        tracker.wait_idle().await;

        let job = tracker.get_import_job(submitted.id, user).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert!(job.errors[0].contains("connection reset"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn storage_error_on_final_save_fails_job() {
        // start, progress at the last row, then the final save
        let tracker = flaky_tracker(3);
        let user = Uuid::new_v4();

        let submitted = tracker
            .start_async_import(request(user, ABC_WITH_BAD_B, true))
            .await
            .unwrap();
        tracker.wait_idle().await;

        let job = tracker.get_import_job(submitted.id, user).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.processed_rows, 3);
    }

    #[tokio::test]
    async fn get_import_job_enforces_owner() {
        let (tracker, _) = tracker();
        let owner = Uuid::new_v4();
        let job = completed_job(&tracker, owner, ABC_WITH_BAD_B).await;

        let err = tracker.get_import_job(job.id, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let err = tracker.get_import_job(Uuid::new_v4(), owner).await.unwrap_err();
        assert!(matches!(err, ImportError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn rollback_deletes_created_resources() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();
        let job = completed_job(&tracker, user, ABC_WITH_BAD_B).await;

        let result = tracker
            .rollback_import(job.id, Some("wrong file".into()), user)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.deleted_count, 2);
        assert_eq!(store.resource_count(), 0);

        let stored = tracker.get_import_job(job.id, user).await.unwrap();
        assert_eq!(stored.status, ImportJobStatus::RolledBack);
        assert!(stored.resource_ids.is_empty());
        assert_eq!(stored.rollback_reason.as_deref(), Some("wrong file"));
    }

    #[tokio::test]
    async fn second_rollback_is_rejected() {
        let (tracker, _) = tracker();
        let user = Uuid::new_v4();
        let job = completed_job(&tracker, user, ABC_WITH_BAD_B).await;

        tracker.rollback_import(job.id, None, user).await.unwrap();
        let err = tracker.rollback_import(job.id, None, user).await.unwrap_err();

        assert!(matches!(
            err,
            ImportError::InvalidState { status: ImportJobStatus::RolledBack, .. }
        ));
        assert!(err.to_string().contains("ROLLED_BACK"));
    }

    #[tokio::test]
    async fn concurrent_rollbacks_succeed_once() {
        let (tracker, _) = tracker();
        let user = Uuid::new_v4();
        let job = completed_job(&tracker, user, ABC_WITH_BAD_B).await;

        let (a, b) = tokio::join!(
            tracker.rollback_import(job.id, None, user),
            tracker.rollback_import(job.id, None, user)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn rollback_rejects_other_users_and_unfinished_jobs() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();

        let job = completed_job(&tracker, user, ABC_WITH_BAD_B).await;
        let err = tracker.rollback_import(job.id, None, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ImportError::NotOwner(_)));

        let pending = ImportJob::submit(user, "later.csv", 10, 1, ImportMode::Create, false);
        store.insert_job(&pending).await.unwrap();
        let err = tracker.rollback_import(pending.id, None, user).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert!(err.to_string().contains("PENDING"));

        let failed = tracker
            .start_async_import(request(user, ABC_WITH_BAD_B, false))
            .await
            .unwrap();
        tracker.wait_idle().await;
        let err = tracker.rollback_import(failed.id, None, user).await.unwrap_err();
        assert!(err.to_string().contains("FAILED"));
    }

    #[tokio::test]
    async fn rollback_rejects_processing_job() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();

        let mut running = ImportJob::submit(user, "big.csv", 10, 100, ImportMode::Create, false);
        store.insert_job(&running).await.unwrap();
        running.start().unwrap();
        assert!(matches!(store.save_job(&running).await.unwrap(), SaveOutcome::Saved(_)));

        let err = tracker.rollback_import(running.id, None, user).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert!(err.to_string().contains("PROCESSING"));

        let stored = tracker.get_import_job(running.id, user).await.unwrap();
        assert_eq!(stored.status, ImportJobStatus::Processing);
    }

    #[tokio::test]
    async fn rollback_skips_resources_already_gone() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();
        let job = completed_job(&tracker, user, ABC_WITH_BAD_B).await;
        store.delete_resource(job.resource_ids[0]).await.unwrap();

        let result = tracker.rollback_import(job.id, None, user).await.unwrap();
        assert!(result.success);
        assert_eq!(result.deleted_count, 1);
        assert!(result.failed_resource_ids.is_empty());
    }

    #[tokio::test]
    async fn rollback_leaves_updated_resources() {
        let (tracker, store) = tracker();
        let user = Uuid::new_v4();
        store
            .create_resource(NewResource {
                code: "A-1".into(),
                name: "Existing".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut req = request(user, "code,name,type\nA-1,Room A,CLASSROOM\nN-1,New,CLASSROOM\n", true);
        req.mode = ImportMode::Upsert;
        let submitted = tracker.start_async_import(req).await.unwrap();
        tracker.wait_idle().await;

        let job = tracker.get_import_job(submitted.id, user).await.unwrap();
        assert_eq!(job.success_count, 2);
        assert_eq!(job.updated_count, 1);
        assert_eq!(job.resource_ids.len(), 1);

        tracker.rollback_import(job.id, None, user).await.unwrap();
        assert!(store.find_resource_by_code("A-1").await.unwrap().is_some());
        assert!(store.find_resource_by_code("N-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_import_rejects_large_files() {
        let (tracker, _) = tracker();
        let csv = format!("code,name,type\n{}", "R,Room,CLASSROOM\n".repeat(100));

        let err = tracker
            .import_sync(&csv, ImportMode::Create, true, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::FileTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn sync_import_returns_result() {
        let (tracker, _) = tracker();
        let result = tracker
            .import_sync(ABC_WITH_BAD_B, ImportMode::Create, true, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(result.error_count, 1);
    }

    #[tokio::test]
    async fn progress_sink_persists_counts() {
        let (stores, _) = Stores::memory();
        let mut job = ImportJob::submit(Uuid::new_v4(), "a.csv", 10, 20, ImportMode::Create, true);
        stores.jobs.insert_job(&job).await.unwrap();
        job.start().unwrap();
        if let SaveOutcome::Saved(v) = stores.jobs.save_job(&job).await.unwrap() {
            job.version = v;
        }

        let sink = JobProgress {
            jobs: stores.jobs.clone(),
            job: AsyncMutex::new(job.clone()),
        };
        sink.report(ImportProgress { processed: 10, total: 18, succeeded: 9, failed: 1 })
            .await;

        let stored = stores.jobs.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.processed_rows, 10);
        assert_eq!(stored.total_rows, 18);
        assert_eq!(stored.error_count, 1);
        assert_eq!(sink.job.into_inner().version, stored.version);
    }
}
