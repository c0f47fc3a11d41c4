//! Tracking of pod and service creations/deletions the controller asked for
//! but has not observed yet.
//!
//! A reconcile pass only mutates a replica type when its expectations are
//! satisfied. Without this, a pass running before the watch has delivered
//! the pods created by the previous pass would create them again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Default age after which an unobserved expectation is considered satisfied.
pub const DEFAULT_EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Kind of object an expectation counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controllee {
    /// Pods.
    Pods,
    /// Services.
    Services,
}

impl Controllee {
    fn as_str(self) -> &'static str {
        match self {
            Controllee::Pods => "pods",
            Controllee::Services => "services",
        }
    }
}

/// Key of one expectation record: (job key, lowercase replica type, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectationKey {
    job_key: String,
    replica_type: String,
    controllee: Controllee,
}

impl ExpectationKey {
    /// Build a key. The replica type is lowercased.
    pub fn new(job_key: &str, replica_type: &str, controllee: Controllee) -> Self {
        Self {
            job_key: job_key.to_string(),
            replica_type: replica_type.to_lowercase(),
            controllee,
        }
    }

    /// Key counting the pods of a replica type.
    pub fn pods(job_key: &str, replica_type: &str) -> Self {
        Self::new(job_key, replica_type, Controllee::Pods)
    }

    /// Key counting the services of a replica type.
    pub fn services(job_key: &str, replica_type: &str) -> Self {
        Self::new(job_key, replica_type, Controllee::Services)
    }

    /// The job key this expectation belongs to.
    pub fn job_key(&self) -> &str {
        &self.job_key
    }
}

impl fmt::Display for ExpectationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_key,
            self.replica_type,
            self.controllee.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Expectation {
    adds: i64,
    dels: i64,
    recorded_at: Instant,
}

impl Expectation {
    fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.dels <= 0
    }
}

/// Whether an expectation recorded at `recorded_at` has gone stale at `now`.
pub fn is_expired(recorded_at: Instant, now: Instant, timeout: Duration) -> bool {
    now.saturating_duration_since(recorded_at) > timeout
}

/// Process-wide expectation tracker.
///
/// Shared by concurrent reconciles and the watch handlers; all methods take `&self`.
#[derive(Debug)]
pub struct Expectations {
    records: Mutex<HashMap<ExpectationKey, Expectation>>,
    timeout: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATIONS_TIMEOUT)
    }
}

impl Expectations {
    /// Create a tracker with the given staleness timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Record `adds` pending creations and `dels` pending deletions,
    /// replacing any previous record for the key.
    pub fn set_expectations(&self, key: &ExpectationKey, adds: i64, dels: i64) {
        self.set_expectations_at(key, adds, dels, Instant::now());
    }

    fn set_expectations_at(&self, key: &ExpectationKey, adds: i64, dels: i64, now: Instant) {
        tracing::trace!(key = %key, adds, dels, "Setting expectations");
        self.records.lock().insert(
            key.clone(),
            Expectation {
                adds,
                dels,
                recorded_at: now,
            },
        );
    }

    /// Expect `count` creations. Replaces any previous record.
    pub fn expect_creations(&self, key: &ExpectationKey, count: i64) {
        self.set_expectations(key, count, 0);
    }

    /// Expect `count` deletions. Replaces any previous record.
    pub fn expect_deletions(&self, key: &ExpectationKey, count: i64) {
        self.set_expectations(key, 0, count);
    }

    /// A creation for `key` was observed, or will never happen.
    pub fn creation_observed(&self, key: &ExpectationKey) {
        self.lower_expectations(key, 1, 0);
    }

    /// A deletion for `key` was observed, or will never happen.
    pub fn deletion_observed(&self, key: &ExpectationKey) {
        self.lower_expectations(key, 0, 1);
    }

    /// Subtract `adds` creations and `dels` deletions from the record of `key`.
    pub fn lower_expectations(&self, key: &ExpectationKey, adds: i64, dels: i64) {
        if let Some(record) = self.records.lock().get_mut(key) {
            record.adds -= adds;
            record.dels -= dels;
            tracing::trace!(
                key = %key,
                adds = record.adds,
                dels = record.dels,
                "Lowered expectations"
            );
        }
    }

    /// Whether it is safe to mutate the objects counted by `key`.
    pub fn satisfied(&self, key: &ExpectationKey) -> bool {
        self.satisfied_at(key, Instant::now())
    }

    /// [`satisfied`](Self::satisfied) evaluated at `now`.
    pub fn satisfied_at(&self, key: &ExpectationKey, now: Instant) -> bool {
        match self.records.lock().get(key) {
            None => true,
            Some(record) if record.fulfilled() => true,
            Some(record) if is_expired(record.recorded_at, now, self.timeout) => {
                tracing::debug!(key = %key, "Expectations expired");
                true
            }
            Some(record) => {
                tracing::debug!(
                    key = %key,
                    adds = record.adds,
                    dels = record.dels,
                    "Controller still waiting on expectations"
                );
                false
            }
        }
    }

    /// Time until the record of `key` expires, `None` when it is satisfied.
    pub fn pending(&self, key: &ExpectationKey) -> Option<Duration> {
        self.pending_at(key, Instant::now())
    }

    /// [`pending`](Self::pending) evaluated at `now`.
    pub fn pending_at(&self, key: &ExpectationKey, now: Instant) -> Option<Duration> {
        if self.satisfied_at(key, now) {
            return None;
        }
        let records = self.records.lock();
        let record = records.get(key)?;
        let elapsed = now.saturating_duration_since(record.recorded_at);
        Some(self.timeout.saturating_sub(elapsed))
    }

    /// Drop the record of `key`.
    pub fn delete_expectations(&self, key: &ExpectationKey) {
        self.records.lock().remove(key);
    }

    /// Drop every record belonging to `job_key`.
    pub fn delete_job(&self, job_key: &str) {
        self.records.lock().retain(|k, _| k.job_key != job_key);
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        let key = ExpectationKey::pods("default/iris", "Worker");
        assert_eq!(key.to_string(), "default/iris/worker/pods");
        assert_eq!(
            ExpectationKey::services("default/iris", "master").to_string(),
            "default/iris/master/services"
        );
    }

    #[test]
    fn unknown_key_is_satisfied() {
        let exp = Expectations::default();
        assert!(exp.satisfied(&ExpectationKey::pods("ns/a", "worker")));
    }

    #[test]
    fn creations_must_be_observed() {
        let exp = Expectations::default();
        let key = ExpectationKey::pods("ns/a", "worker");

        exp.expect_creations(&key, 2);
        assert!(!exp.satisfied(&key));

        exp.creation_observed(&key);
        assert!(!exp.satisfied(&key));

        exp.creation_observed(&key);
        assert!(exp.satisfied(&key));
    }

    #[test]
    fn last_writer_wins() {
        let exp = Expectations::default();
        let key = ExpectationKey::pods("ns/a", "worker");

        exp.expect_creations(&key, 3);
        exp.expect_deletions(&key, 1);
        exp.deletion_observed(&key);
        assert!(exp.satisfied(&key));
    }

    #[test]
    fn observation_without_record_is_ignored() {
        let exp = Expectations::default();
        let key = ExpectationKey::pods("ns/a", "worker");
        exp.creation_observed(&key);
        assert!(exp.is_empty());
    }

    #[test]
    fn stale_records_are_satisfied() {
        let exp = Expectations::new(Duration::from_secs(60));
        let key = ExpectationKey::services("ns/a", "master");
        let start = Instant::now();

        exp.set_expectations_at(&key, 1, 0, start);
        assert!(!exp.satisfied_at(&key, start + Duration::from_secs(30)));
        assert!(exp.satisfied_at(&key, start + Duration::from_secs(61)));
    }

    #[test]
    fn pending_counts_down_to_expiry() {
        let exp = Expectations::new(Duration::from_secs(60));
        let key = ExpectationKey::pods("ns/a", "worker");
        let start = Instant::now();
        assert_eq!(exp.pending_at(&key, start), None);

        exp.set_expectations_at(&key, 1, 0, start);
        assert_eq!(
            exp.pending_at(&key, start + Duration::from_secs(45)),
            Some(Duration::from_secs(15))
        );
        assert_eq!(exp.pending_at(&key, start + Duration::from_secs(61)), None);

        exp.creation_observed(&key);
        assert_eq!(exp.pending_at(&key, start), None);
    }

    #[test]
    fn expiry_is_strict() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        assert!(!is_expired(t0, t0 + timeout, timeout));
        assert!(is_expired(t0, t0 + timeout + Duration::from_millis(1), timeout));
        assert!(!is_expired(t0 + timeout, t0, timeout));
    }

    #[test]
    fn delete_job_drops_all_keys() {
        let exp = Expectations::default();
        exp.expect_creations(&ExpectationKey::pods("ns/a", "master"), 1);
        exp.expect_creations(&ExpectationKey::services("ns/a", "worker"), 2);
        exp.expect_creations(&ExpectationKey::pods("ns/b", "master"), 1);

        exp.delete_job("ns/a");
        assert_eq!(exp.len(), 1);
    }
}
