//! Identifier generation for pools, jobs and tasks
//!
//! Pool and job identifiers embed a process-wide stamp that is a millisecond
//! timestamp forced to be strictly increasing, so two identifiers minted in
//! the same process never collide even within one millisecond.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Last stamp handed out in this process
static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Next unique stamp, at least `now` in epoch milliseconds
pub fn next_stamp(now: DateTime<Utc>) -> i64 {
    let candidate = now.timestamp_millis();
    let mut last = LAST_STAMP.load(Ordering::SeqCst);
    loop {
        let next = candidate.max(last + 1);
        match LAST_STAMP.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Lower-case a caller-supplied name and replace characters the batch
/// service rejects in identifiers
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "batch".to_string()
    } else {
        cleaned
    }
}

/// Job identifier: `<name>-<stamp>`
pub fn job_id(name: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", sanitize_name(name), next_stamp(now))
}

/// Pool identifier: `<name>_<stamp>`
pub fn pool_id(name: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", sanitize_name(name), next_stamp(now))
}

/// Task identifier for the `index`-th input given a numbering base
pub fn task_id(base: usize, index: usize) -> String {
    format!("task{}", base + index)
}
