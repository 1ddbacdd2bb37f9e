use std::collections::BTreeMap;

use bg_instance::{ActiveMap, InstanceId};

use crate::store::StateStore;

/// Ids to delete for one name. `ids` may be in any order; the active id is
/// always kept and does not count against `keep`.
pub fn plan_for_name(ids: &[InstanceId], active: Option<&InstanceId>, keep: usize) -> Vec<InstanceId> {
    let mut sorted: Vec<&InstanceId> = ids.iter().collect();
    sorted.sort_by(|a, b| b.cmp(a));

    sorted
        .into_iter()
        .filter(|id| Some(*id) != active)
        .skip(keep)
        .cloned()
        .collect()
}

/// Groups every well-formed instance id by owner name. Ids that do not parse
/// are left alone.
pub fn group_by_owner(ids: Vec<InstanceId>) -> BTreeMap<String, Vec<InstanceId>> {
    let mut out: BTreeMap<String, Vec<InstanceId>> = BTreeMap::new();
    for id in ids {
        if let Some(name) = id.owner_name() {
            out.entry(name).or_default().push(id);
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<InstanceId>,
    pub failed: Vec<(InstanceId, String)>,
}

/// Deletes old instance directories across all names. A failed deletion is
/// recorded and the rest continue.
pub fn prune(store: &StateStore, active: &ActiveMap, keep: usize) -> PruneReport {
    prune_with(store, active, keep, |id| store.remove_instance(id))
}

fn prune_with(
    store: &StateStore,
    active: &ActiveMap,
    keep: usize,
    mut remove: impl FnMut(&InstanceId) -> anyhow::Result<()>,
) -> PruneReport {
    let mut report = PruneReport::default();

    for (name, ids) in group_by_owner(store.list_all_instance_ids()) {
        for id in plan_for_name(&ids, active.get(&name), keep) {
            match remove(&id) {
                Ok(()) => {
                    tracing::debug!(instance_id = %id, "pruned");
                    report.deleted.push(id);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "prune failed");
                    report.failed.push((id, format!("{e:#}")));
                }
            }
        }
    }
    report
}
