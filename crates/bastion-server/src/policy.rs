//! RBAC policy store.
//!
//! Maps a bastion user to a role and an ordered list of target patterns.
//! The source is a JSON array:
//!
//! ```json
//! [
//!   {"user": "alice", "role": "admin-role", "targets": ["10.0.0.*"]},
//!   {"user": "bob",   "role": "dev-role",   "targets": ["10.0.0.5", "db-*"]}
//! ]
//! ```
//!
//! The mapping lives behind an `Arc` that reload swaps in one step: the new
//! file is read and parsed with no lock held, and the write lock is taken
//! only for the pointer swap. Readers clone the `Arc` and never see a
//! half-applied reload.

use bastion_core::{BastionError, BastionResult, TargetPattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// One row of the policy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub user: String,
    pub role: String,
    #[serde(default)]
    pub targets: Vec<TargetPattern>,
}

/// What a user is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyEntry {
    pub role: String,
    pub targets: Vec<TargetPattern>,
}

type PolicyMap = HashMap<String, PolicyEntry>;

pub struct PolicyStore {
    entries: RwLock<Arc<PolicyMap>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Load the initial mapping from a JSON file.
    pub fn load(path: &Path) -> BastionResult<Self> {
        let store = Self::new();
        store.reload(path)?;
        Ok(store)
    }

    /// Replace the whole mapping with the contents of `path`.
    ///
    /// On any error the current mapping is left untouched.
    pub fn reload(&self, path: &Path) -> BastionResult<usize> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BastionError::PolicyIo(format!("{}: {e}", path.display())))?;
        let count = self.reload_from_str(&content)?;
        info!(path = %path.display(), users = count, "policy loaded");
        Ok(count)
    }

    pub fn reload_from_str(&self, content: &str) -> BastionResult<usize> {
        let records: Vec<PolicyRecord> = serde_json::from_str(content)
            .map_err(|e| BastionError::PolicyParse(e.to_string()))?;
        let map = Arc::new(build_map(records));
        let count = map.len();
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = map;
        Ok(count)
    }

    fn snapshot(&self) -> Arc<PolicyMap> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn lookup(&self, user: &str) -> Option<PolicyEntry> {
        self.snapshot().get(user).cloned()
    }

    /// Resolve the role `user` acts under when reaching `target`.
    ///
    /// Patterns are tried in stored order; an unknown user or no matching
    /// pattern is an [`BastionError::Authorization`].
    pub fn authorize(&self, user: &str, target: &str) -> BastionResult<String> {
        let map = self.snapshot();
        let denied = || BastionError::Authorization {
            user: user.to_string(),
            target: target.to_string(),
        };
        let entry = map.get(user).ok_or_else(denied)?;
        match bastion_core::pattern::first_match(&entry.targets, target) {
            Some(pattern) => {
                debug!(user, target, pattern = %pattern, role = %entry.role, "policy allow");
                Ok(entry.role.clone())
            }
            None => Err(denied()),
        }
    }

    /// Snapshot of the current mapping, ordered by user.
    pub fn list(&self) -> BTreeMap<String, PolicyEntry> {
        self.snapshot()
            .iter()
            .map(|(user, entry)| (user.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn build_map(records: Vec<PolicyRecord>) -> PolicyMap {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
        let entry = PolicyEntry {
            role: record.role,
            targets: record.targets,
        };
        if map.insert(record.user.clone(), entry).is_some() {
            warn!(user = %record.user, "duplicate policy entry, later row wins");
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"[
        {"user": "alice", "role": "admin-role", "targets": ["10.0.0.5"]},
        {"user": "bob", "role": "dev-role", "targets": ["db-*", "10.0.1.7"]},
        {"user": "ops", "role": "admin-role", "targets": ["*"]}
    ]"#;

    fn store() -> PolicyStore {
        let store = PolicyStore::new();
        store.reload_from_str(SAMPLE).unwrap();
        store
    }

    #[test]
    fn exact_target_allows_with_role() {
        assert_eq!(store().authorize("alice", "10.0.0.5").unwrap(), "admin-role");
    }

    #[test]
    fn unlisted_target_denies() {
        let err = store().authorize("alice", "10.0.0.9").unwrap_err();
        assert!(matches!(err, BastionError::Authorization { .. }));
    }

    #[test]
    fn unknown_user_denies() {
        let store = store();
        assert!(store.authorize("mallory", "10.0.0.5").is_err());
        assert!(store.lookup("mallory").is_none());
    }

    #[test]
    fn prefix_and_wildcard() {
        let store = store();
        assert_eq!(store.authorize("bob", "db-primary").unwrap(), "dev-role");
        assert!(store.authorize("bob", "web-1").is_err());
        assert_eq!(store.authorize("ops", "anything").unwrap(), "admin-role");
    }

    #[test]
    fn later_duplicate_wins() {
        let store = PolicyStore::new();
        store
            .reload_from_str(
                r#"[{"user":"alice","role":"a","targets":["x"]},
                    {"user":"alice","role":"b","targets":["y"]}]"#,
            )
            .unwrap();
        assert_eq!(store.lookup("alice").unwrap().role, "b");
        assert!(store.authorize("alice", "x").is_err());
    }

    #[test]
    fn failed_reload_keeps_previous_mapping() {
        let store = store();
        let err = store.reload_from_str("{not json").unwrap_err();
        assert!(matches!(err, BastionError::PolicyParse(_)));
        assert_eq!(store.len(), 3);

        let err = store.reload(Path::new("/nonexistent/policies.json")).unwrap_err();
        assert!(matches!(err, BastionError::PolicyIo(_)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn reload_from_file_replaces_everything() {
        let store = store();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"[{{"user":"carol","role":"dev-role","targets":["*"]}}]"#).unwrap();
        assert_eq!(store.reload(file.path()).unwrap(), 1);
        assert!(store.lookup("alice").is_none());
        assert_eq!(store.authorize("carol", "10.9.9.9").unwrap(), "dev-role");
    }

    #[test]
    fn list_is_sorted_snapshot() {
        let users: Vec<String> = store().list().into_keys().collect();
        assert_eq!(users, vec!["alice", "bob", "ops"]);
    }

    #[test]
    fn list_serializes_patterns_as_strings() {
        let json = serde_json::to_value(store().list()).unwrap();
        assert_eq!(json["bob"]["targets"][0], "db-*");
        assert_eq!(json["bob"]["role"], "dev-role");
    }

    #[test]
    fn readers_never_see_mixed_mappings() {
        let store = Arc::new(PolicyStore::new());
        let a = r#"[{"user":"u1","role":"a","targets":["*"]},{"user":"u2","role":"a","targets":["*"]}]"#;
        let b = r#"[{"user":"u1","role":"b","targets":["*"]},{"user":"u2","role":"b","targets":["*"]}]"#;
        store.reload_from_str(a).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.reload_from_str(if i % 2 == 0 { b } else { a }).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let snapshot = store.list();
            assert_eq!(snapshot["u1"].role, snapshot["u2"].role);
        }
        writer.join().unwrap();
    }
}
