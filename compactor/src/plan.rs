//! Job selection and the leased job queue.

use data_types::{BlockMeta, TenantId};
use largo_time::{Time, TimeProvider};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

/// A group of input blocks to merge into one output block.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionJob {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Inputs, sorted by min trace id. At least two.
    pub inputs: Vec<BlockMeta>,
}

impl CompactionJob {
    /// Stable identity of the input set, independent of discovery order.
    pub fn key(&self) -> String {
        let mut ids: Vec<String> = self.inputs.iter().map(|m| m.id.to_string()).collect();
        ids.sort();
        format!("{}:{}", self.tenant, ids.join("+"))
    }
}

/// Planner knobs.
#[derive(Debug, Clone, Copy)]
pub struct PlanConfig {
    /// Maximum input blocks per job.
    pub input_blocks_per_job: usize,
    /// Stop growing a job once its combined input size reaches this.
    pub job_target_bytes: u64,
}

/// Form compaction jobs for one tenant's visible blocks.
///
/// Blocks are grouped within a compaction level; a group grows while the
/// next block's trace-id range overlaps the group's combined range, the
/// block budget allows it, and the size target is not exceeded. Groups of
/// one are not worth compacting and are skipped.
pub fn plan_tenant(
    tenant: &TenantId,
    mut blocks: Vec<BlockMeta>,
    config: &PlanConfig,
) -> Vec<CompactionJob> {
    blocks.sort_by(|a, b| {
        (a.compaction_level, a.min_trace_id).cmp(&(b.compaction_level, b.min_trace_id))
    });

    let mut jobs = vec![];
    let mut iter = blocks.into_iter().peekable();
    while let Some(first) = iter.next() {
        let level = first.compaction_level;
        let mut group_max = first.max_trace_id;
        let mut group_bytes = first.size_bytes;
        let mut inputs = vec![first];

        while let Some(next) = iter.peek() {
            let fits = next.compaction_level == level
                && inputs.len() < config.input_blocks_per_job
                && group_bytes + next.size_bytes <= config.job_target_bytes
                && next.min_trace_id <= group_max;
            if !fits {
                break;
            }
            let next = iter.next().expect("peeked");
            group_max = group_max.max(next.max_trace_id);
            group_bytes += next.size_bytes;
            inputs.push(next);
        }

        if inputs.len() >= 2 {
            jobs.push(CompactionJob {
                tenant: tenant.clone(),
                inputs,
            });
        }
    }
    debug!(tenant=%tenant, jobs=jobs.len(), "compaction planning pass");
    jobs
}

#[derive(Debug)]
struct Lease {
    job: CompactionJob,
    worker: String,
    expires: Time,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queued: VecDeque<CompactionJob>,
    leases: HashMap<String, Lease>,
}

/// Hands jobs to workers under expiring leases.
///
/// Only one worker holds a given input set at a time. A crashed worker's
/// lease expires and the job is handed out again; duplicate completions are
/// tolerated because output publication is atomic and a late duplicate
/// output is itself compactable.
#[derive(Debug)]
pub struct JobScheduler {
    time_provider: Arc<dyn TimeProvider>,
    lease_duration: Duration,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    /// Create an empty scheduler.
    pub fn new(time_provider: Arc<dyn TimeProvider>, lease_duration: Duration) -> Self {
        Self {
            time_provider,
            lease_duration,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Enqueue newly planned jobs, skipping input sets already queued or
    /// leased.
    pub fn offer(&self, jobs: Vec<CompactionJob>) {
        let mut state = self.state.lock();
        for job in jobs {
            let key = job.key();
            let known = state.leases.contains_key(&key)
                || state.queued.iter().any(|queued| queued.key() == key);
            if !known {
                state.queued.push_back(job);
            }
        }
    }

    /// Lease the next job to `worker`.
    pub fn acquire(&self, worker: &str) -> Option<CompactionJob> {
        let mut state = self.state.lock();
        let job = state.queued.pop_front()?;
        let expires = self.time_provider.now() + self.lease_duration;
        state.leases.insert(
            job.key(),
            Lease {
                job: job.clone(),
                worker: worker.to_string(),
                expires,
            },
        );
        Some(job)
    }

    /// Report a finished (or failed-and-abandoned) job.
    pub fn complete(&self, job: &CompactionJob) {
        self.state.lock().leases.remove(&job.key());
    }

    /// Requeue jobs whose worker lease expired.
    pub fn release_expired(&self) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            let lease = state.leases.remove(&key).expect("key just listed");
            debug!(worker=%lease.worker, job=%key, "compaction lease expired, rescheduling");
            state.queued.push_back(lease.job);
        }
    }

    /// Queued (not leased) job count.
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{BlockId, CompactionLevel, TimeRange, TraceId};
    use largo_time::MockProvider;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn meta(min: u8, max: u8, level: u32, size: u64) -> BlockMeta {
        BlockMeta {
            tenant: tenant(),
            id: BlockId::new(),
            format_version: data_types::FORMAT_VERSION,
            min_trace_id: TraceId::new([min; 16]),
            max_trace_id: TraceId::new([max; 16]),
            time_range: TimeRange::new(0, 100),
            trace_count: 10,
            span_count: 100,
            size_bytes: size,
            compaction_level: CompactionLevel::new(level),
            dedicated_columns: vec![],
        }
    }

    fn config() -> PlanConfig {
        PlanConfig {
            input_blocks_per_job: 4,
            job_target_bytes: 1_000,
        }
    }

    #[test]
    fn groups_overlapping_same_level_blocks() {
        let jobs = plan_tenant(
            &tenant(),
            vec![
                meta(1, 10, 0, 100),
                meta(5, 15, 0, 100),
                meta(8, 20, 0, 100),
                // gap: does not overlap [1, 20]... 0x30 > 0x20
                meta(0x30, 0x40, 0, 100),
            ],
            &config(),
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].inputs.len(), 3);
    }

    #[test]
    fn does_not_mix_compaction_levels() {
        let jobs = plan_tenant(
            &tenant(),
            vec![
                meta(1, 10, 0, 100),
                meta(2, 9, 1, 100),
                meta(3, 8, 1, 100),
                meta(2, 11, 0, 100),
            ],
            &config(),
        );
        assert_eq!(jobs.len(), 2);
        assert!(jobs
            .iter()
            .all(|j| j.inputs.windows(2).all(|w| w[0].compaction_level == w[1].compaction_level)));
    }

    #[test]
    fn respects_input_count_and_size_budget() {
        let blocks: Vec<BlockMeta> = (0..6).map(|_| meta(1, 10, 0, 100)).collect();
        let jobs = plan_tenant(
            &tenant(),
            blocks,
            &PlanConfig {
                input_blocks_per_job: 3,
                job_target_bytes: 1_000,
            },
        );
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.inputs.len() == 3));

        let blocks: Vec<BlockMeta> = (0..4).map(|_| meta(1, 10, 0, 400)).collect();
        let jobs = plan_tenant(
            &tenant(),
            blocks,
            &PlanConfig {
                input_blocks_per_job: 8,
                job_target_bytes: 1_000,
            },
        );
        // 400+400 fits the target, a third input would exceed it
        assert_eq!(jobs[0].inputs.len(), 2);
    }

    #[test]
    fn single_blocks_are_left_alone() {
        let jobs = plan_tenant(&tenant(), vec![meta(1, 10, 0, 100)], &config());
        assert!(jobs.is_empty());
    }

    #[test]
    fn scheduler_leases_and_expires() {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let scheduler = JobScheduler::new(
            Arc::clone(&time_provider) as _,
            Duration::from_secs(60),
        );

        let job = CompactionJob {
            tenant: tenant(),
            inputs: vec![meta(1, 10, 0, 100), meta(2, 8, 0, 100)],
        };
        scheduler.offer(vec![job.clone()]);
        // double offer of the same input set is ignored
        scheduler.offer(vec![job.clone()]);
        assert_eq!(scheduler.queued(), 1);

        let leased = scheduler.acquire("worker-a").unwrap();
        assert_eq!(leased.key(), job.key());
        assert!(scheduler.acquire("worker-b").is_none());

        // while leased, re-offering is still ignored
        scheduler.offer(vec![job.clone()]);
        assert_eq!(scheduler.queued(), 0);

        // the worker dies; after expiry the job is handed out again
        time_provider.inc(Duration::from_secs(61));
        scheduler.release_expired();
        let re_leased = scheduler.acquire("worker-b").unwrap();
        assert_eq!(re_leased.key(), job.key());

        scheduler.complete(&re_leased);
        scheduler.offer(vec![job.clone()]);
        assert_eq!(scheduler.queued(), 1, "completed jobs can be planned again");
    }
}
