//! Reconciliation primitives for container membership.
//!
//! A host keeps a membership set of the containers it believes it owns.
//! The daemon is ground truth. A scan compares the two and decides, for
//! each side, what has to change:
//!
//! - **Live but unknown**: adopt it as an already-started member.
//! - **Known but not live**: depending on its lifecycle, leave it alone,
//!   retire it, or mark it stopping so a later pass can retire it.
//!
//! The functions here are pure. Callers perform the daemon I/O and apply
//! the resulting [`ScanPlan`].
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Planning against an unchanged daemon twice never adopts the same
//!   container twice

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A row of the container listing could not be understood.
    #[error("malformed container listing at line {line}: {content}")]
    MalformedListing { line: usize, content: String },
}

/// Lifecycle of a host or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    OnFire,
    Stopping,
    Stopped,
}

impl Lifecycle {
    /// Returns true once teardown has begun.
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }

    /// Mid-transition states a scan must not act on.
    pub fn is_unsettled(&self) -> bool {
        matches!(self, Self::Starting | Self::OnFire)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::OnFire => "on_fire",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container row reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveContainer {
    /// Container ID, usually abbreviated.
    pub id: String,
    /// Image reference the container runs.
    pub image: String,
    /// Container name(s) as printed by the daemon.
    pub names: String,
}

/// Parse the table printed by the daemon's `ps` command.
///
/// The header row is skipped. The first column is the container ID, the
/// second the image, the last the names.
pub fn parse_ps_output(output: &str) -> Result<Vec<LiveContainer>, ReconcileError> {
    let mut rows = Vec::new();

    for (idx, line) in output.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("CONTAINER ID") {
            continue;
        }

        let columns: Vec<&str> = trimmed.split_whitespace().collect();
        let id = columns[0];
        if columns.len() < 2 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ReconcileError::MalformedListing {
                line: idx + 1,
                content: trimmed.to_string(),
            });
        }

        rows.push(LiveContainer {
            id: id.to_ascii_lowercase(),
            image: columns[1].to_string(),
            names: columns[columns.len() - 1].to_string(),
        });
    }

    Ok(rows)
}

/// A member as the host currently records it.
#[derive(Debug, Clone)]
pub struct Member<K> {
    pub key: K,
    /// Full daemon ID of the member's container.
    pub docker_id: String,
    pub lifecycle: Lifecycle,
}

/// Outcome of comparing a listing with the membership set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan<K> {
    /// Members present in the listing.
    pub matched: Vec<K>,
    /// Listed IDs with no matching member, to be inspected and adopted.
    pub adopt: Vec<String>,
    /// Absent members already stopping or stopped, to be deregistered.
    pub retire: Vec<K>,
    /// Absent members that should begin teardown.
    pub mark_stopping: Vec<K>,
    /// Absent members mid-transition, left untouched this pass.
    pub skipped: Vec<K>,
}

impl<K> Default for ScanPlan<K> {
    fn default() -> Self {
        Self {
            matched: Vec::new(),
            adopt: Vec::new(),
            retire: Vec::new(),
            mark_stopping: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl<K> ScanPlan<K> {
    /// True when applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.adopt.is_empty() && self.retire.is_empty() && self.mark_stopping.is_empty()
    }
}

/// Two IDs refer to the same container when one is a prefix of the other.
pub fn ids_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a.starts_with(&b) || b.starts_with(&a)
}

/// Compare the daemon listing with the recorded members.
pub fn plan_scan<K: Clone>(live: &[LiveContainer], members: &[Member<K>]) -> ScanPlan<K> {
    let mut plan = ScanPlan::default();

    for row in live {
        if !members.iter().any(|m| ids_match(&m.docker_id, &row.id)) {
            plan.adopt.push(row.id.clone());
        }
    }

    for member in members {
        if live.iter().any(|row| ids_match(&member.docker_id, &row.id)) {
            plan.matched.push(member.key.clone());
        } else if member.lifecycle.is_unsettled() {
            plan.skipped.push(member.key.clone());
        } else if member.lifecycle.is_stopping_or_stopped() {
            plan.retire.push(member.key.clone());
        } else {
            plan.mark_stopping.push(member.key.clone());
        }
    }

    plan
}

/// A content hash for deterministic naming.
///
/// Used to derive image names from the inputs that shape an image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute a content hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    /// Lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Default interval between membership scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "aaaaaaaaaaaa1111111111111111111111111111111111111111111111111111";
    const B: &str = "bbbbbbbbbbbb2222222222222222222222222222222222222222222222222222";
    const C: &str = "cccccccccccc3333333333333333333333333333333333333333333333333333";

    fn live(id: &str) -> LiveContainer {
        LiveContainer {
            id: id[..12].to_string(),
            image: "busybox".to_string(),
            names: "test".to_string(),
        }
    }

    fn member(key: &'static str, id: &str, lifecycle: Lifecycle) -> Member<&'static str> {
        Member {
            key,
            docker_id: id.to_string(),
            lifecycle,
        }
    }

    #[test]
    fn test_adopt_orphan_and_retire_stopped() {
        let listing = vec![live(A), live(B)];
        let members = vec![
            member("a", A, Lifecycle::Running),
            member("c", C, Lifecycle::Stopped),
        ];

        let plan = plan_scan(&listing, &members);
        assert_eq!(plan.matched, vec!["a"]);
        assert_eq!(plan.adopt, vec![B[..12].to_string()]);
        assert_eq!(plan.retire, vec!["c"]);
        assert!(plan.mark_stopping.is_empty());
    }

    #[test]
    fn test_absent_running_member_marked_stopping() {
        let members = vec![member("a", A, Lifecycle::Running)];
        let plan = plan_scan(&[], &members);
        assert_eq!(plan.mark_stopping, vec!["a"]);

        let members = vec![member("a", A, Lifecycle::Stopping)];
        let plan = plan_scan(&[], &members);
        assert_eq!(plan.retire, vec!["a"]);
    }

    #[test]
    fn test_unsettled_members_skipped() {
        let members = vec![
            member("s", A, Lifecycle::Starting),
            member("f", B, Lifecycle::OnFire),
        ];
        let plan = plan_scan(&[], &members);
        assert_eq!(plan.skipped, vec!["s", "f"]);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_plan_is_stable_once_applied() {
        let listing = vec![live(A), live(B)];
        let members = vec![
            member("a", A, Lifecycle::Running),
            member("b", B, Lifecycle::Running),
        ];
        let plan = plan_scan(&listing, &members);
        assert!(plan.is_noop());
        assert_eq!(plan.matched.len(), 2);
    }

    #[test]
    fn test_ids_match_prefix_either_way() {
        assert!(ids_match(A, &A[..12]));
        assert!(ids_match(&A[..12], A));
        assert!(!ids_match(A, B));
        assert!(!ids_match(A, ""));
    }

    #[test]
    fn test_parse_ps_output() {
        let output = "CONTAINER ID   IMAGE     COMMAND       CREATED   STATUS   PORTS   NAMES\n\
                      aaaaaaaaaaaa   busybox   \"sleep 1d\"   1 min     Up       22/tcp  fleet-01\n\
                      \n\
                      bbbbbbbbbbbb   alpine    \"sh\"         2 min     Up              fleet-02\n";
        let rows = parse_ps_output(output).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "aaaaaaaaaaaa");
        assert_eq!(rows[0].image, "busybox");
        assert_eq!(rows[1].names, "fleet-02");
    }

    #[test]
    fn test_parse_ps_output_rejects_garbage() {
        let err = parse_ps_output("CONTAINER ID IMAGE\nnot-an-id busybox\n").unwrap_err();
        assert_eq!(
            err,
            ReconcileError::MalformedListing {
                line: 2,
                content: "not-an-id busybox".to_string()
            }
        );
    }

    #[test]
    fn test_content_hash_deterministic() {
        let one = serde_json::json!({"name": "web", "version": "1.0", "env": {"B": "2", "A": "1"}});
        let two = serde_json::json!({"env": {"A": "1", "B": "2"}, "version": "1.0", "name": "web"});
        let hash = ContentHash::from_json(&one);
        assert_eq!(hash, ContentHash::from_json(&two));
        assert_eq!(hash.as_str().len(), 32);
        assert!(hash.as_str().bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_lifecycle_serde_names() {
        let json = serde_json::to_string(&Lifecycle::OnFire).unwrap();
        assert_eq!(json, "\"on_fire\"");
        assert_eq!(Lifecycle::OnFire.to_string(), "on_fire");
    }
}
