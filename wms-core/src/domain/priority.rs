//! Fair-share priority arithmetic for task queues.

use std::collections::{BTreeMap, BTreeSet};

use crate::database::models::task_queue::TaskQueueRow;

/// Priority floor of any task queue, and the priority of background queues.
pub const TQ_MIN_SHARE: f64 = 0.001;

/// Average member priority at or below which a queue counts as background.
pub const BACKGROUND_PRIORITY_THRESHOLD: f64 = 0.1;

/// Splits an entity's share across its task queues.
pub trait PriorityCalculator: Send + Sync {
    /// `avg_priorities` maps each queue to its members' mean RealPriority and
    /// `rows` holds the same queues. Returns `(priority, queue ids)` groups.
    fn compute(
        &self,
        avg_priorities: &BTreeMap<i64, f64>,
        rows: &[TaskQueueRow],
        share: f64,
        allow_background: bool,
    ) -> Vec<(f64, Vec<i64>)>;
}

/// Proportional split of the share by average priority.
///
/// Queues that only differ in their site lists are run against the same
/// resources, so each of them gets the summed priority of its group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareProportionalCalculator;

/// Grouping key of equivalent queues: everything except id, priority and
/// the site lists.
fn equivalence_key(row: &TaskQueueRow) -> impl Ord + '_ {
    (
        (&row.owner, &row.owner_group, &row.vo),
        row.cpu_time,
        row.enabled,
        &row.criteria.grid_ces,
        &row.criteria.platforms,
        &row.criteria.job_types,
        &row.criteria.tags,
    )
}

impl PriorityCalculator for ShareProportionalCalculator {
    fn compute(
        &self,
        avg_priorities: &BTreeMap<i64, f64>,
        rows: &[TaskQueueRow],
        share: f64,
        allow_background: bool,
    ) -> Vec<(f64, Vec<i64>)> {
        if avg_priorities.is_empty() {
            return Vec::new();
        }

        let is_background =
            |avg: f64| allow_background && avg <= BACKGROUND_PRIORITY_THRESHOLD;
        let total: f64 = avg_priorities
            .values()
            .filter(|avg| !is_background(**avg))
            .sum();
        let foreground = avg_priorities
            .values()
            .filter(|avg| !is_background(**avg))
            .count()
            .max(1);

        let mut priorities: BTreeMap<i64, f64> = avg_priorities
            .iter()
            .map(|(&tq_id, &avg)| {
                let priority = if is_background(avg) {
                    TQ_MIN_SHARE
                } else if total > 0.0 {
                    avg / total * share
                } else {
                    share / foreground as f64
                };
                (tq_id, priority.max(TQ_MIN_SHARE))
            })
            .collect();

        let mut groups: BTreeMap<_, Vec<i64>> = BTreeMap::new();
        for row in rows.iter().filter(|row| priorities.contains_key(&row.tq_id)) {
            groups.entry(equivalence_key(row)).or_default().push(row.tq_id);
        }
        for members in groups.values().filter(|members| members.len() > 1) {
            let sum: f64 = members.iter().filter_map(|id| priorities.get(id)).sum();
            for id in members {
                priorities.insert(*id, sum);
            }
        }

        // Group by priority value; f64 is not Ord so compare bit patterns.
        let mut by_priority: BTreeMap<u64, (f64, BTreeSet<i64>)> = BTreeMap::new();
        for (tq_id, priority) in priorities {
            by_priority
                .entry(priority.to_bits())
                .or_insert_with(|| (priority, BTreeSet::new()))
                .1
                .insert(tq_id);
        }
        by_priority
            .into_values()
            .map(|(priority, ids)| (priority, ids.into_iter().collect()))
            .collect()
    }
}
