//! Two-phase storage pool creation protocol across cluster members
//! (spec §2 item 12, §4.7, scenario S5).
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterPoolError {
    #[error("storage pool is already in a terminal state")]
    AlreadyTerminal,
    #[error("partially created")]
    PartiallyCreated,
    #[error("unknown member: {0}")]
    UnknownMember(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Pending,
    Created,
    Errored,
}

#[derive(Debug, Clone, Default)]
pub struct MemberRecord {
    pub config: BTreeMap<String, String>,
    pub created: bool,
}

/// Tracks one storage pool's cluster-wide creation state: a global status
/// plus a per-member config/created record (spec §4.7).
#[derive(Debug, Clone)]
pub struct PoolCreationState {
    pub status: PoolStatus,
    pub global_config: BTreeMap<String, String>,
    pub members: BTreeMap<String, MemberRecord>,
}

impl PoolCreationState {
    fn new() -> Self {
        Self {
            status: PoolStatus::Pending,
            global_config: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }
}

/// Coordinates pool creation requests across members of a cluster. A
/// single-member deployment never touches `target`, landing in the one-shot
/// path every call below falls through to.
#[derive(Default)]
pub struct ClusterPoolRegistry {
    pools: Mutex<BTreeMap<String, PoolCreationState>>,
}

impl ClusterPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// No `target`: either the one-shot global create (first call for this
    /// pool name) or the notification POST that asks every member with a
    /// pending record to actually create the pool (spec §4.7).
    pub async fn create_global(
        &self,
        pool: &str,
        global_config: BTreeMap<String, String>,
        known_members: &[String],
        create_on_member: impl Fn(&str, &BTreeMap<String, String>) -> Result<(), String>,
    ) -> Result<PoolStatus, ClusterPoolError> {
        let mut pools = self.pools.lock().await;
        let state = pools.entry(pool.to_string()).or_insert_with(PoolCreationState::new);

        match state.status {
            PoolStatus::Created => return Err(ClusterPoolError::AlreadyTerminal),
            PoolStatus::Errored => return Err(ClusterPoolError::PartiallyCreated),
            PoolStatus::Pending => {}
        }

        state.global_config = global_config;

        if state.members.is_empty() {
            // One-shot path: no member previously registered a pending
            // record, so there is nothing to notify — create everywhere at
            // once using the known member list.
            let mut all_succeeded = true;
            for member in known_members {
                let merged = merge_config(&state.global_config, &BTreeMap::new());
                let result = create_on_member(member, &merged);
                let record = state.members.entry(member.clone()).or_default();
                record.config = merged;
                record.created = result.is_ok();
                all_succeeded &= result.is_ok();
            }
            state.status = if all_succeeded {
                PoolStatus::Created
            } else {
                PoolStatus::Errored
            };
            return Ok(state.status);
        }

        // Notification path: every member with a pending record gets its own
        // merged config (per-member keys win over the global ones).
        let mut all_succeeded = true;
        for (member, record) in state.members.iter_mut() {
            if record.created {
                continue;
            }
            let merged = merge_config(&state.global_config, &record.config);
            let result = create_on_member(member, &merged);
            record.config = merged;
            record.created = result.is_ok();
            all_succeeded &= result.is_ok();
        }

        state.status = if all_succeeded {
            PoolStatus::Created
        } else {
            PoolStatus::Errored
        };
        Ok(state.status)
    }

    /// `target=member`: register a pending, node-specific record without
    /// creating anything yet (spec §4.7).
    pub async fn create_pending_for_member(
        &self,
        pool: &str,
        member: &str,
        member_config: BTreeMap<String, String>,
    ) -> Result<(), ClusterPoolError> {
        let mut pools = self.pools.lock().await;
        let state = pools.entry(pool.to_string()).or_insert_with(PoolCreationState::new);

        if state.status != PoolStatus::Pending {
            return Err(ClusterPoolError::AlreadyTerminal);
        }

        state.members.insert(
            member.to_string(),
            MemberRecord {
                config: member_config,
                created: false,
            },
        );
        Ok(())
    }

    pub async fn status(&self, pool: &str) -> Option<PoolStatus> {
        self.pools.lock().await.get(pool).map(|s| s.status)
    }
}

/// Per-member config wins over the global config on key collisions.
fn merge_config(
    global: &BTreeMap<String, String>,
    member: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    merged.extend(member.clone());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_shot_create_with_no_pending_members_succeeds_for_all() {
        let registry = ClusterPoolRegistry::new();
        let members = vec!["node1".to_string(), "node2".to_string()];
        let status = registry
            .create_global(
                "default",
                BTreeMap::from([("source".to_string(), "/dev/sdb".to_string())]),
                &members,
                |_member, _config| Ok(()),
            )
            .await
            .unwrap();
        assert_eq!(status, PoolStatus::Created);
    }

    #[tokio::test]
    async fn target_member_creates_pending_until_notified() {
        let registry = ClusterPoolRegistry::new();
        registry
            .create_pending_for_member(
                "default",
                "node1",
                BTreeMap::from([("source".to_string(), "/dev/sdb".to_string())]),
            )
            .await
            .unwrap();
        registry
            .create_pending_for_member("default", "node2", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(registry.status("default").await, Some(PoolStatus::Pending));

        let status = registry
            .create_global(
                "default",
                BTreeMap::from([("zfs.pool_name".to_string(), "tank".to_string())]),
                &[],
                |_member, _config| Ok(()),
            )
            .await
            .unwrap();
        assert_eq!(status, PoolStatus::Created);
    }

    #[tokio::test]
    async fn one_failing_member_marks_the_whole_pool_errored() {
        let registry = ClusterPoolRegistry::new();
        registry
            .create_pending_for_member("default", "node1", BTreeMap::new())
            .await
            .unwrap();
        registry
            .create_pending_for_member("default", "node2", BTreeMap::new())
            .await
            .unwrap();

        let status = registry
            .create_global("default", BTreeMap::new(), &[], |member, _config| {
                if member == "node2" {
                    Err("disk not found".to_string())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(status, PoolStatus::Errored);
    }

    #[tokio::test]
    async fn subsequent_global_config_after_errored_is_rejected() {
        let registry = ClusterPoolRegistry::new();
        registry
            .create_pending_for_member("default", "node1", BTreeMap::new())
            .await
            .unwrap();
        registry
            .create_global("default", BTreeMap::new(), &[], |_m, _c| {
                Err("boom".to_string())
            })
            .await
            .unwrap();

        let err = registry
            .create_global("default", BTreeMap::new(), &[], |_m, _c| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterPoolError::PartiallyCreated);
    }
}
