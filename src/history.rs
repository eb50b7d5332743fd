//! Version history projection over the operation log.
//!
//! Everything here is a pure function of an operation slice; the
//! history panel is always derivable from the log and carries no state
//! of its own. Restoring an old version is deliberately not performed
//! here: [`operations_up_to`] hands back the replay set and the caller
//! decides what to do with it.

use std::collections::BTreeSet;

use crate::protocol::{Operation, OperationType};

/// One history entry: every operation that landed at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGroup {
    pub version: u64,
    pub operations: Vec<Operation>,
    /// Distinct contributing user ids, sorted.
    pub contributors: Vec<String>,
    /// Latest operation timestamp in the group, milliseconds.
    pub timestamp: u64,
    pub summary: String,
}

/// Group a log by version, newest first.
pub fn group_by_version(operations: &[Operation]) -> Vec<VersionGroup> {
    let mut sorted: Vec<&Operation> = operations.iter().collect();
    sorted.sort_by_key(|op| op.version);

    let mut groups: Vec<VersionGroup> = Vec::new();
    for op in sorted {
        match groups.last_mut() {
            Some(group) if group.version == op.version => group.operations.push(op.clone()),
            _ => groups.push(VersionGroup {
                version: op.version,
                operations: vec![op.clone()],
                contributors: Vec::new(),
                timestamp: 0,
                summary: String::new(),
            }),
        }
    }

    for group in &mut groups {
        let users: BTreeSet<&str> = group
            .operations
            .iter()
            .map(|op| op.origin_user.as_str())
            .collect();
        group.contributors = users.into_iter().map(String::from).collect();
        group.timestamp = group
            .operations
            .iter()
            .map(|op| op.timestamp)
            .max()
            .unwrap_or(0);
        group.summary = summarize(&group.operations, &group.contributors);
    }

    groups.reverse();
    groups
}

fn summarize(operations: &[Operation], contributors: &[String]) -> String {
    let who = contributors.join(", ");
    match operations {
        [only] => format!(
            "{} {} by {who}",
            only.op_type.as_str(),
            only.path.join("/")
        ),
        many => format!("{} changes by {who}", many.len()),
    }
}

/// Keep only groups containing at least one operation of `op_type`.
pub fn filter_by_type(groups: &[VersionGroup], op_type: OperationType) -> Vec<VersionGroup> {
    groups
        .iter()
        .filter(|g| g.operations.iter().any(|op| op.op_type == op_type))
        .cloned()
        .collect()
}

/// Case-insensitive search over paths, contributors and summaries.
pub fn search(groups: &[VersionGroup], query: &str) -> Vec<VersionGroup> {
    let needle = query.to_lowercase();
    if needle.is_empty() {
        return groups.to_vec();
    }
    groups
        .iter()
        .filter(|g| {
            g.summary.to_lowercase().contains(&needle)
                || g.contributors
                    .iter()
                    .any(|u| u.to_lowercase().contains(&needle))
                || g.operations
                    .iter()
                    .any(|op| op.path.join("/").to_lowercase().contains(&needle))
        })
        .cloned()
        .collect()
}

/// The replay set for restoring `version`: every operation at or below
/// it, ascending. Actually rebuilding state from it is the caller's
/// job.
pub fn operations_up_to(operations: &[Operation], version: u64) -> Vec<Operation> {
    let mut set: Vec<Operation> = operations
        .iter()
        .filter(|op| op.version <= version)
        .cloned()
        .collect();
    set.sort_by_key(|op| op.version);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn op(version: u64, user: &str, op_type: OperationType, path: &[&str]) -> Operation {
        Operation {
            id: Uuid::new_v4(),
            op_type,
            path: path.iter().map(|s| s.to_string()).collect(),
            payload: json!({}),
            origin_user: user.into(),
            timestamp: version * 100,
            version,
            dependencies: vec![],
        }
    }

    fn sample_log() -> Vec<Operation> {
        vec![
            op(1, "alice", OperationType::Insert, &["widgets", "Revenue"]),
            op(2, "bob", OperationType::Update, &["widgets", "Revenue"]),
            op(3, "alice", OperationType::Move, &["layout", "grid"]),
            op(4, "carol", OperationType::Delete, &["widgets", "Churn"]),
        ]
    }

    #[test]
    fn test_groups_are_newest_first() {
        let groups = group_by_version(&sample_log());
        let versions: Vec<u64> = groups.iter().map(|g| g.version).collect();
        assert_eq!(versions, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_group_merges_same_version() {
        let mut log = sample_log();
        log.push(op(2, "carol", OperationType::Style, &["widgets", "Revenue"]));

        let groups = group_by_version(&log);
        let v2 = groups.iter().find(|g| g.version == 2).unwrap();
        assert_eq!(v2.operations.len(), 2);
        assert_eq!(v2.contributors, vec!["bob", "carol"]);
        assert_eq!(v2.summary, "2 changes by bob, carol");
    }

    #[test]
    fn test_single_op_summary_names_path_and_user() {
        let groups = group_by_version(&sample_log());
        let v1 = groups.iter().find(|g| g.version == 1).unwrap();
        assert_eq!(v1.summary, "insert widgets/Revenue by alice");
        assert_eq!(v1.timestamp, 100);
    }

    #[test]
    fn test_filter_by_type() {
        let groups = group_by_version(&sample_log());
        let deletes = filter_by_type(&groups, OperationType::Delete);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].version, 4);

        assert!(filter_by_type(&groups, OperationType::Style).is_empty());
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let groups = group_by_version(&sample_log());

        let by_path = search(&groups, "REVENUE");
        assert_eq!(by_path.len(), 2);

        let by_user = search(&groups, "Carol");
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].version, 4);

        assert!(search(&groups, "nonexistent").is_empty());
        assert_eq!(search(&groups, "").len(), groups.len());
    }

    #[test]
    fn test_operations_up_to_is_ascending_replay_set() {
        let mut log = sample_log();
        log.reverse();

        let set = operations_up_to(&log, 3);
        let versions: Vec<u64> = set.iter().map(|op| op.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_log_projects_empty_history() {
        assert!(group_by_version(&[]).is_empty());
        assert!(operations_up_to(&[], 10).is_empty());
    }
}
