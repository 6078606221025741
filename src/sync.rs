//! Atomic config replacement.
//!
//! `apply_config` swaps a new snapshot in while keeping runtime process
//! groups in sync: groups whose scheduling-relevant fields are unchanged are
//! mutated in place (their processes keep running), everything else is
//! rebuilt. Planning happens under the top-level write lock; the queued
//! shutdowns run after the lock is released so readers never block on them.

use crate::config::Config;
use crate::group::ProcessGroup;
use crate::manager::ProxyManager;
use futures_util::future::join_all;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

impl ProxyManager {
    /// Install a new config snapshot. Compatible groups are reused in place
    /// (preserving their object identity and running processes); removed or
    /// incompatible groups are shut down after the table swap is visible.
    pub async fn apply_config(&self, new_config: Config) {
        let new_config = Arc::new(new_config);
        let inner = self.inner();

        let groups_to_shutdown = {
            let mut state = inner.state.write().await;
            let old_config = state.config.clone();

            let mut next_groups: HashMap<String, Arc<ProcessGroup>> =
                HashMap::with_capacity(new_config.groups.len());
            let mut to_shutdown: Vec<Arc<ProcessGroup>> = Vec::new();

            for group_id in new_config.groups.keys() {
                if let Some(old_group) = state.groups.get(group_id) {
                    if runtime_group_compatible(&old_config, &new_config, group_id) {
                        old_group.update_config(new_config.clone());
                        next_groups.insert(group_id.clone(), Arc::clone(old_group));
                        continue;
                    }
                    debug!(group = %group_id, "group incompatible with new config, rebuilding");
                    to_shutdown.push(Arc::clone(old_group));
                }
                next_groups.insert(
                    group_id.clone(),
                    ProcessGroup::new(
                        group_id,
                        new_config.clone(),
                        inner.bus.clone(),
                        inner.upstream_log.clone(),
                    ),
                );
            }

            for (group_id, old_group) in &state.groups {
                if !next_groups.contains_key(group_id) {
                    debug!(group = %group_id, "group removed by new config");
                    to_shutdown.push(Arc::clone(old_group));
                }
            }

            state.config = new_config.clone();
            state.groups = next_groups;
            to_shutdown
        };

        counter!("modelswap_config_applies_total").increment(1);
        info!(
            models = new_config.models.len(),
            groups = new_config.groups.len(),
            shutdowns = groups_to_shutdown.len(),
            "config applied"
        );

        join_all(groups_to_shutdown.iter().map(|g| g.shutdown())).await;
    }
}

/// A group may be mutated in place when its scheduling-relevant fields and
/// its members' full configs are unchanged between the two snapshots.
pub(crate) fn runtime_group_compatible(
    old_config: &Config,
    new_config: &Config,
    group_id: &str,
) -> bool {
    let Some(old_group) = old_config.groups.get(group_id) else {
        return false;
    };
    let Some(new_group) = new_config.groups.get(group_id) else {
        return false;
    };

    if old_group.swap != new_group.swap
        || old_group.exclusive != new_group.exclusive
        || old_group.persistent != new_group.persistent
    {
        return false;
    }

    if old_group.members != new_group.members {
        return false;
    }

    for member in &new_group.members {
        let old = old_config.find_config(member);
        let new = new_config.find_config(member);
        match (old, new) {
            (Some((old_cfg, old_resolved)), Some((new_cfg, new_resolved))) => {
                if old_resolved != new_resolved || !old_cfg.runtime_eq(new_cfg) {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_config() -> Config {
        Config::from_yaml(
            r#"
models:
  a:
    cmd: "sleep 30"
    proxy: "http://127.0.0.1:8001"
  b:
    cmd: "sleep 30"
    proxy: "http://127.0.0.1:8002"
groups:
  g1:
    swap: true
    exclusive: true
    members: [a]
  g2:
    members: [b]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_identical_configs_are_compatible() {
        let c1 = two_group_config();
        let c2 = two_group_config();
        assert!(runtime_group_compatible(&c1, &c2, "g1"));
        assert!(runtime_group_compatible(&c1, &c2, "g2"));
    }

    #[test]
    fn test_missing_group_is_incompatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.groups.remove("g2");
        assert!(!runtime_group_compatible(&c1, &c2, "g2"));
        assert!(!runtime_group_compatible(&c2, &c1, "g2"));
    }

    #[test]
    fn test_flag_change_is_incompatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.groups.get_mut("g1").unwrap().swap = false;
        assert!(!runtime_group_compatible(&c1, &c2, "g1"));
    }

    #[test]
    fn test_member_order_matters() {
        let mut c1 = two_group_config();
        let mut c2 = two_group_config();
        for c in [&mut c1, &mut c2] {
            let g1 = c.groups.get_mut("g1").unwrap();
            g1.members = vec!["a".to_string(), "b".to_string()];
            c.groups.remove("g2");
        }
        assert!(runtime_group_compatible(&c1, &c2, "g1"));

        c2.groups.get_mut("g1").unwrap().members = vec!["b".to_string(), "a".to_string()];
        assert!(!runtime_group_compatible(&c1, &c2, "g1"));
    }

    #[test]
    fn test_member_config_change_is_incompatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.models.get_mut("a").unwrap().cmd = "sleep 60".to_string();
        assert!(!runtime_group_compatible(&c1, &c2, "g1"));
        // g2's member is untouched
        assert!(runtime_group_compatible(&c1, &c2, "g2"));
    }

    #[test]
    fn test_display_only_change_stays_compatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.models.get_mut("b").unwrap().description = "new".to_string();
        c2.models.get_mut("b").unwrap().name = "Model B".to_string();
        assert!(runtime_group_compatible(&c1, &c2, "g1"));
        assert!(runtime_group_compatible(&c1, &c2, "g2"));
    }

    #[test]
    fn test_metadata_change_is_incompatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.models.get_mut("b").unwrap().metadata.insert(
            "tier".to_string(),
            serde_yaml::Value::String("fast".to_string()),
        );
        assert!(runtime_group_compatible(&c1, &c2, "g1"));
        assert!(!runtime_group_compatible(&c1, &c2, "g2"));
    }

    #[test]
    fn test_alias_resolution_change_is_incompatible() {
        let c1 = two_group_config();
        let mut c2 = two_group_config();
        c2.models.get_mut("a").unwrap().use_model_name = "gpt-4".to_string();
        assert!(!runtime_group_compatible(&c1, &c2, "g1"));
    }
}
