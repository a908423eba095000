use crate::config::FeedbackSettings;
use crate::coverage::{CoverageError, CoverageOracle, PathDiscovery};
use crate::data_model::DataModel;
use crate::metrics::MetricsLog;
use crate::seed_store::{SeedStore, StoreError};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur during corpus bookkeeping.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A seed or the index ordering could not be persisted or reloaded.
    #[error("Seed persistence failed within scheduler: {0}")]
    Store(#[from] StoreError),

    /// The coverage oracle rejected a checkpoint.
    #[error("Coverage oracle failed within scheduler: {0}")]
    Coverage(#[from] CoverageError),
}

/// Source of monotonic time for discovery-interval measurements.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Tunables of the corpus scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Whether coverage feedback drives the corpus at all.
    pub enabled: bool,
    /// A valuable seed is evicted once it has been reused this many times without
    /// producing new coverage.
    pub use_time_limit: u32,
    /// Upper bound on ring seeds replayed per top-level iteration.
    pub reuse_budget_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&FeedbackSettings::default())
    }
}

impl From<&FeedbackSettings> for SchedulerConfig {
    fn from(settings: &FeedbackSettings) -> Self {
        Self {
            enabled: settings.enabled,
            use_time_limit: settings.use_time_limit,
            reuse_budget_limit: settings.seed_pool_reuse_limit,
        }
    }
}

/// A seed held in the valuable ring together with its durable index.
#[derive(Debug, Clone)]
pub struct Seed {
    pub index: u64,
    pub model: DataModel,
}

/// Weight given to a newly discovered input: how long it took to find relative to the
/// running average. Always within `[0, 1]`.
pub fn retention_probability(elapsed_ms: f64, average_ms: f64) -> f64 {
    if !elapsed_ms.is_finite() || !average_ms.is_finite() || average_ms <= 0.0 {
        return 1.0;
    }
    (elapsed_ms / average_ms).clamp(0.0, 1.0)
}

/// Coverage-feedback corpus scheduler.
///
/// Keeps a FIFO work queue of inputs that produced a new path and have not been
/// replayed yet, and a FIFO ring of valuable seeds that produced a new branch. The run
/// controller drives it through two hooks:
///
/// * [`CorpusScheduler::on_output`] after every Output action once the target is quiet.
/// * [`CorpusScheduler::finish_iteration`] once per state-model run.
///
/// Between them, [`CorpusScheduler::current_candidate`] tells the mutation strategy
/// which seed the current sub-iteration works on, and
/// [`CorpusScheduler::sub_iterations_pending`] tells the run controller whether it owes
/// another sub-iteration for the same top-level iteration number.
pub struct CorpusScheduler {
    config: SchedulerConfig,
    store: Box<dyn SeedStore>,
    metrics: MetricsLog,
    clock: Box<dyn Clock>,

    work_queue: VecDeque<DataModel>,
    ring: VecDeque<Seed>,
    index_snapshot: Vec<u64>,
    next_index: u64,

    discovered_paths: u64,
    average_interval_ms: f64,
    last_discovery: Option<Instant>,
    max_branch: u64,

    queue_len_before_iteration: usize,
    reuse_budget: usize,
    last_top_iteration: u64,
    new_path_this_iteration: bool,
    replay_until: Option<u64>,
}

impl CorpusScheduler {
    /// Creates a scheduler using the wall clock.
    pub fn new(config: SchedulerConfig, store: Box<dyn SeedStore>, metrics: MetricsLog) -> Self {
        Self::with_clock(config, store, metrics, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        store: Box<dyn SeedStore>,
        metrics: MetricsLog,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            clock,
            work_queue: VecDeque::new(),
            ring: VecDeque::new(),
            index_snapshot: Vec::new(),
            next_index: 0,
            discovered_paths: 0,
            average_interval_ms: 0.0,
            last_discovery: None,
            max_branch: 0,
            queue_len_before_iteration: 0,
            reuse_budget: 0,
            // Top-level iterations are numbered from 1.
            last_top_iteration: 1,
            new_path_this_iteration: false,
            replay_until: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// `true` while a resumed session re-executes iterations it already recorded.
    pub fn is_replaying(&self, iteration: u64) -> bool {
        self.replay_until.is_some_and(|until| iteration < until)
    }

    /// Starts the discovery clock if no path has been found yet.
    pub fn arm_discovery_clock(&mut self) {
        if self.discovered_paths == 0 {
            self.last_discovery = Some(self.clock.now());
        }
    }

    /// Per-Output bookkeeping, called once the target has quiesced.
    ///
    /// Counts new paths and logs them, tracks the branch high-water mark, and when
    /// feedback is enabled weights `model` and enqueues a clone of it. A new branch also
    /// promotes the clone into the valuable ring under a fresh index and persists it.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Store`] if the new valuable seed cannot be persisted.
    pub fn on_output(
        &mut self,
        iteration: u64,
        model: &mut DataModel,
        discovery: PathDiscovery,
        branch_count: u64,
    ) -> Result<(), SchedulerError> {
        if discovery.is_new_path() {
            self.discovered_paths += 1;
            self.new_path_this_iteration = true;
            self.metrics.record_path(self.discovered_paths);
            info!(
                iteration,
                paths = self.discovered_paths,
                branch = discovery.is_new_branch(),
                "new path"
            );
        }

        if branch_count > self.max_branch {
            self.max_branch = branch_count;
            self.metrics.record_branch(branch_count);
            debug!(iteration, branch_count, "branch high-water mark raised");
        }

        if !self.config.enabled || self.is_replaying(iteration) || !discovery.is_new_path() {
            return Ok(());
        }

        let now = self.clock.now();
        let elapsed_ms = self
            .last_discovery
            .map(|since| now.saturating_duration_since(since).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let n = self.discovered_paths as f64;
        self.average_interval_ms = ((n - 1.0) * self.average_interval_ms + elapsed_ms) / n;
        let p = retention_probability(elapsed_ms, self.average_interval_ms);
        model.set_p(p);
        self.last_discovery = Some(now);

        self.work_queue.push_back(model.clone());
        debug!(
            queue = self.work_queue.len(),
            p,
            avg_ms = self.average_interval_ms,
            "queued new-path input"
        );

        if discovery.is_new_branch() {
            self.promote(model.clone())?;
        }
        Ok(())
    }

    fn promote(&mut self, mut model: DataModel) -> Result<(), SchedulerError> {
        self.next_index += 1;
        let index = self.next_index;
        model.set_use_count(0);
        self.store.save_seed(index, &model)?;
        self.ring.push_back(Seed { index, model });
        info!(index, ring = self.ring.len(), "valuable seed stored");
        Ok(())
    }

    /// Bookkeeping at the end of a state-model run.
    ///
    /// 1. While the sub-iteration budget is open, the work-queue head is consumed. If
    ///    this run found a new path the head is promoted to the valuable ring first.
    /// 2. Otherwise, while the reuse budget is open, the ring head is rotated: its use
    ///    count is bumped (or reset after a new path) and it is dropped once it reaches
    ///    the use-time limit.
    /// 3. When both budgets and the queue are exhausted, the oracle is checkpointed
    ///    with `iteration + 1` and the index snapshot is refreshed and persisted.
    /// 4. On the first run of a new top-level iteration, the queue depth becomes the
    ///    sub-iteration budget, and the reuse budget opens only when the queue is empty.
    ///
    /// Everything is skipped while replaying a resumed session. With feedback disabled
    /// only step 3 runs, so the oracle is checkpointed after every iteration.
    ///
    /// # Errors
    /// Fails if a promoted seed cannot be persisted or the oracle rejects the checkpoint.
    pub fn finish_iteration(
        &mut self,
        iteration: u64,
        oracle: &mut dyn CoverageOracle,
    ) -> Result<(), SchedulerError> {
        if self.is_replaying(iteration) {
            self.new_path_this_iteration = false;
            return Ok(());
        }

        if self.config.enabled {
            self.consume_budget()?;
        }

        // Without feedback the queue and both budgets stay empty, so every iteration
        // still advances the oracle checkpoint.
        if self.queue_len_before_iteration == 0
            && self.reuse_budget == 0
            && self.work_queue.is_empty()
        {
            oracle.checkpoint(iteration + 1)?;
            self.index_snapshot = self.live_indices();
            if self.config.enabled {
                self.store.save_index(&self.index_snapshot)?;
            }
        }

        if self.config.enabled && self.last_top_iteration != iteration {
            self.last_top_iteration = iteration;
            self.queue_len_before_iteration = self.work_queue.len();
            self.reuse_budget = if self.queue_len_before_iteration == 0 {
                self.ring.len().min(self.config.reuse_budget_limit)
            } else {
                0
            };
            self.metrics.record_queue(
                iteration,
                self.queue_len_before_iteration,
                self.reuse_budget,
                self.ring.len(),
            );
            debug!(
                iteration,
                from_queue = self.queue_len_before_iteration,
                from_pool = self.reuse_budget,
                pool = self.ring.len(),
                "sub-iteration budget"
            );
        }

        self.new_path_this_iteration = false;
        Ok(())
    }

    /// Retires the work-queue head, or rotates the ring head while the reuse budget
    /// is open.
    fn consume_budget(&mut self) -> Result<(), SchedulerError> {
        if self.queue_len_before_iteration != 0 {
            if self.new_path_this_iteration {
                if let Some(head) = self.work_queue.front().cloned() {
                    self.promote(head)?;
                }
            }
            self.work_queue.pop_front();
            self.queue_len_before_iteration -= 1;
        } else if self.reuse_budget != 0 {
            if let Some(mut seed) = self.ring.pop_front() {
                let uses = if self.new_path_this_iteration {
                    0
                } else {
                    seed.model.use_count() + 1
                };
                seed.model.set_use_count(uses);
                if uses < self.config.use_time_limit {
                    self.ring.push_back(seed);
                } else {
                    debug!(index = seed.index, uses, "valuable seed retired");
                }
            }
            self.reuse_budget -= 1;
        }
        Ok(())
    }

    /// The seed the next sub-iteration should start from: the work-queue head while
    /// the queue budget is open, else the ring head while the reuse budget is open.
    pub fn current_candidate(&self) -> Option<&DataModel> {
        if self.queue_len_before_iteration > 0 {
            self.work_queue.front()
        } else if self.reuse_budget > 0 {
            self.ring.front().map(|seed| &seed.model)
        } else {
            None
        }
    }

    pub fn sub_iterations_pending(&self) -> bool {
        self.config.enabled && (self.queue_len_before_iteration > 0 || self.reuse_budget > 0)
    }

    /// Rebuilds the valuable ring from `indices`, loading each seed from the store in
    /// order. Iterations below `replay_until` are then treated as replay.
    ///
    /// # Errors
    /// Fails on the first seed that cannot be loaded; the ring is left untouched.
    pub fn resume(&mut self, indices: &[u64], replay_until: u64) -> Result<usize, SchedulerError> {
        let mut ring = VecDeque::with_capacity(indices.len());
        for &index in indices {
            let model = self.store.load_seed(index)?;
            ring.push_back(Seed { index, model });
        }
        self.ring = ring;
        self.index_snapshot = indices.to_vec();
        self.next_index = self
            .next_index
            .max(indices.iter().copied().max().unwrap_or(0));
        self.replay_until = Some(replay_until);
        info!(
            seeds = self.ring.len(),
            replay_until, "resumed valuable seed ring"
        );
        Ok(self.ring.len())
    }

    /// Writes the durable index ordering to the seed store.
    pub fn persist_index_snapshot(&mut self) -> Result<(), SchedulerError> {
        self.store.save_index(&self.index_snapshot)?;
        Ok(())
    }

    pub fn live_indices(&self) -> Vec<u64> {
        self.ring.iter().map(|seed| seed.index).collect()
    }

    pub fn index_snapshot(&self) -> &[u64] {
        &self.index_snapshot
    }

    pub fn ring(&self) -> impl Iterator<Item = &Seed> {
        self.ring.iter()
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    pub fn work_queue_len(&self) -> usize {
        self.work_queue.len()
    }

    pub fn discovered_paths(&self) -> u64 {
        self.discovered_paths
    }

    pub fn max_branch(&self) -> u64 {
        self.max_branch
    }

    pub fn average_interval_ms(&self) -> f64 {
        self.average_interval_ms
    }

    pub fn queue_len_before_iteration(&self) -> usize {
        self.queue_len_before_iteration
    }

    pub fn reuse_budget(&self) -> usize {
        self.reuse_budget
    }
}
