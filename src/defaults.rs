pub const SERVICE_NAME: &str = "resources-service";

pub const QUERY_TIMEOUT_MS: u64 = 5_000;

pub const QUERY_MAX_ATTEMPTS: u32 = 3;

/// 1 MiB
pub const SYNC_IMPORT_MAX_BYTES: usize = 1024 * 1024;

pub const CANDIDATE_DEFAULT_LIMIT: usize = 5;

/// Upper bound a requester may ask for in one candidate search
pub const CANDIDATE_MAX_LIMIT: usize = 100;
