//! Shared identifiers and time helpers.

use chrono::Utc;

/// Identifier assigned to a job by the external API layer.
pub type JobId = String;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Stable identifier for the record generated from `seed_index` of a job.
///
/// Derived from progress rather than randomness, so regenerating a record
/// after resuming from an older checkpoint yields the same id.
pub fn record_id(job_id: &str, seed_index: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(job_id.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(&seed_index.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest.as_bytes()[..16])
}

/// Default claimant attribution for this process: prefix, hostname, pid.
pub fn default_owner_id(prefix: &str) -> String {
    let host = gethostname::gethostname();
    format!("{}-{}-{}", prefix, host.to_string_lossy(), std::process::id())
}
