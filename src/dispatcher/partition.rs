use std::mem;

use super::job::JobItem;
use crate::cost::FunctionCostRecord;
use crate::settings::JobSizingSettings;

/// An item paired with the latest cost record of its function, if any.
#[derive(Debug, Clone)]
pub struct CostedItem {
    pub item: JobItem,
    pub cost: Option<FunctionCostRecord>,
}

/// Splits a batch of ready items into jobs.
pub trait JobSizingStrategy: Send + Sync {
    fn partition(&self, items: Vec<CostedItem>) -> Vec<Vec<JobItem>>;
}

/// Packs cheap items together up to a target estimated job time and isolates
/// expensive or bulky ones.
///
/// An item gets a job of its own when its function's mean invocation time
/// reaches `target_job_nanos` or its mean output reaches
/// `isolation_output_bytes`. Other items fill the current job until adding one
/// would pass the target time or the item cap. Functions without a cost record
/// are assumed to take `default_item_nanos`.
#[derive(Debug, Clone, Default)]
pub struct CostBasedJobSizer {
    settings: JobSizingSettings,
}

impl CostBasedJobSizer {
    pub fn new(settings: JobSizingSettings) -> Self {
        Self { settings }
    }

    fn estimate(&self, cost: Option<&FunctionCostRecord>) -> (u64, u64) {
        match cost {
            Some(record) => (
                record.invocation_nanos.max(0.0) as u64,
                record.data_output_bytes.max(0.0) as u64,
            ),
            None => (self.settings.default_item_nanos, 0),
        }
    }
}

impl JobSizingStrategy for CostBasedJobSizer {
    fn partition(&self, items: Vec<CostedItem>) -> Vec<Vec<JobItem>> {
        let target = self.settings.target_job_nanos;
        let max_items = self.settings.max_items_per_job.max(1);

        let mut jobs = Vec::new();
        let mut current = Vec::new();
        let mut current_nanos = 0u64;
        for CostedItem { item, cost } in items {
            let (nanos, output_bytes) = self.estimate(cost.as_ref());
            if nanos >= target || output_bytes >= self.settings.isolation_output_bytes {
                jobs.push(vec![item]);
                continue;
            }
            if !current.is_empty()
                && (current_nanos.saturating_add(nanos) > target || current.len() >= max_items)
            {
                jobs.push(mem::take(&mut current));
                current_nanos = 0;
            }
            current.push(item);
            current_nanos = current_nanos.saturating_add(nanos);
        }
        if !current.is_empty() {
            jobs.push(current);
        }
        jobs
    }
}

/// Ignores costs and cuts jobs of a fixed item count.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeJobSizer {
    items_per_job: usize,
}

impl FixedSizeJobSizer {
    pub fn new(items_per_job: usize) -> Self {
        Self {
            items_per_job: items_per_job.max(1),
        }
    }
}

impl JobSizingStrategy for FixedSizeJobSizer {
    fn partition(&self, items: Vec<CostedItem>) -> Vec<Vec<JobItem>> {
        let mut jobs = Vec::new();
        let mut current = Vec::with_capacity(self.items_per_job);
        for costed in items {
            current.push(costed.item);
            if current.len() == self.items_per_job {
                jobs.push(mem::replace(&mut current, Vec::with_capacity(self.items_per_job)));
            }
        }
        if !current.is_empty() {
            jobs.push(current);
        }
        jobs
    }
}
