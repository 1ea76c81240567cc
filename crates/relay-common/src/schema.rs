//! Version stamp for records written outside a running process.
//!
//! Backpressure spill files carry this version in their header so a restart
//! never replays entries encoded under a different record layout.

/// Record layout version (MAJOR.MINOR.PATCH).
///
/// MAJOR moves when a column is removed or changes type; a new nullable
/// column is a MINOR change.
pub const SCHEMA_VERSION: &str = "1.0.0";

fn major(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Whether records stamped with `version` can be read by this build.
///
/// Only the major component matters. Unparseable versions are never
/// compatible.
pub fn is_compatible(version: &str) -> bool {
    match (major(SCHEMA_VERSION), major(version)) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    }
}
