use crate::action::ActionError;
use crate::agent::FaultData;
use crate::config::FuzzerSettings;
use crate::context::RunContext;
use crate::coverage::CoverageError;
use crate::oracle::{
    CHECKPOINT_FILENAME, DefaultFaultOracle, FaultOracle, FaultRecorder, IterationVerdict,
};
use crate::scheduler::SchedulerError;
use crate::seed_store::{DirSeedStore, INDEX_FILENAME, StoreError};
use crate::state_model::StateModel;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Iterations between progress reports.
const PROGRESS_INTERVAL: u64 = 1000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid run configuration: {0}")]
    Config(String),

    #[error("Iteration {iteration} failed: {source}")]
    Action { iteration: u64, source: ActionError },

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Coverage oracle error: {0}")]
    Coverage(#[from] CoverageError),
}

/// Cooperative cancellation flag, checked at every iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The inclusive range of top-level iterations a run covers. `stop == None` runs until
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    pub start: u64,
    pub stop: Option<u64>,
}

impl IterationPlan {
    pub fn new(start: u64, stop: Option<u64>) -> Self {
        Self { start, stop }
    }

    /// Applies the parallel partition first, then `skip-to` inside the partition.
    pub fn from_settings(settings: &FuzzerSettings) -> Result<Self, EngineError> {
        if settings.range_start == 0 {
            return Err(EngineError::Config("iterations are numbered from 1".into()));
        }
        if let Some(stop) = settings.range_stop {
            if stop < settings.range_start {
                return Err(EngineError::Config(format!(
                    "range stop {stop} is before range start {}",
                    settings.range_start
                )));
            }
        }

        let mut plan = Self::new(settings.range_start, settings.range_stop);

        if let Some(parallel) = settings.parallel {
            let stop = settings.range_stop.ok_or_else(|| {
                EngineError::Config("parallel runs need a bounded range".into())
            })?;
            if parallel.total == 0 || parallel.index == 0 || parallel.index > parallel.total {
                return Err(EngineError::Config(format!(
                    "parallel partition {}/{} is out of range",
                    parallel.index, parallel.total
                )));
            }
            let length = stop - settings.range_start + 1;
            let chunk = length / parallel.total;
            if chunk == 0 {
                return Err(EngineError::Config(format!(
                    "{length} iterations cannot be split into {} partitions",
                    parallel.total
                )));
            }
            plan.start = settings.range_start + (parallel.index - 1) * chunk;
            plan.stop = Some(if parallel.index == parallel.total {
                stop
            } else {
                plan.start + chunk - 1
            });
        }

        if let Some(skip_to) = settings.skip_to {
            plan.start = plan.start.max(skip_to);
        }
        Ok(plan)
    }

    /// Never start later than the iteration a resumed session recorded.
    pub fn clamp_start(&mut self, recorded: u64) {
        self.start = self.start.min(recorded.max(1));
    }

    pub fn contains(&self, iteration: u64) -> bool {
        iteration >= self.start && self.stop.is_none_or(|stop| iteration <= stop)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Top-level iterations completed.
    pub iterations: u64,
    /// Corpus replays of a top-level iteration.
    pub sub_iterations: u64,
    pub faults: u64,
    pub discovered_paths: u64,
    pub max_branch: u64,
    pub cancelled: bool,
    pub last_iteration: Option<u64>,
}

/// Run controller: numbers iterations and drives the state model once per iteration,
/// plus once per pending corpus replay.
pub struct Engine {
    plan: IterationPlan,
    oracle: Box<dyn FaultOracle>,
    recorder: Option<FaultRecorder>,
    halt_on_error: bool,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(plan: IterationPlan) -> Self {
        Self {
            plan,
            oracle: Box::new(DefaultFaultOracle),
            recorder: None,
            halt_on_error: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn FaultOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_recorder(mut self, recorder: FaultRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn halt_on_error(mut self, halt: bool) -> Self {
        self.halt_on_error = halt;
        self
    }

    /// A handle that stops the run at the next iteration boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn plan(&self) -> &IterationPlan {
        &self.plan
    }

    /// Restores a prior session from a recorded fault directory: the coverage
    /// checkpoint, the valuable seed ring and the iteration to resume at. Iterations
    /// before that point are replayed without corpus bookkeeping.
    pub fn prepare_resume(&mut self, ctx: &mut RunContext, dir: &Path) -> Result<u64, EngineError> {
        let indices = DirSeedStore::read_index_file(&dir.join(INDEX_FILENAME))?;
        let recorded = ctx
            .coverage
            .load_checkpoint(&dir.join(CHECKPOINT_FILENAME))?
            .unwrap_or(self.plan.start);
        self.plan.clamp_start(recorded);
        let seeds = ctx.scheduler.resume(&indices, recorded)?;
        info!(
            dir = ?dir,
            seeds,
            resume_at = recorded,
            start = self.plan.start,
            "resuming previous session"
        );
        Ok(recorded)
    }

    pub fn run(
        &mut self,
        model: &mut StateModel,
        ctx: &mut RunContext,
    ) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::default();
        let started = Instant::now();
        info!(start = self.plan.start, stop = ?self.plan.stop, model = model.name(), "run starting");

        let mut iteration = self.plan.start;
        'iterations: while self.plan.contains(iteration) {
            let mut sub_iteration = 0u32;
            loop {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'iterations;
                }

                ctx.iteration = iteration;
                ctx.sub_iteration = sub_iteration;
                ctx.agents.iteration_starting(iteration);
                ctx.strategy.iteration_starting(iteration, sub_iteration);

                let outcome = model.run(ctx);
                let monitor_fault = ctx.agents.iteration_finished();
                self.conclude(iteration, outcome, monitor_fault, model, ctx, &mut summary)?;

                if sub_iteration == 0 {
                    summary.iterations += 1;
                } else {
                    summary.sub_iterations += 1;
                }
                summary.last_iteration = Some(iteration);

                if !ctx.scheduler.sub_iterations_pending() {
                    break;
                }
                sub_iteration += 1;
            }

            if iteration % PROGRESS_INTERVAL == 0 {
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    iteration,
                    faults = summary.faults,
                    paths = ctx.scheduler.discovered_paths(),
                    seeds = ctx.scheduler.ring_len(),
                    iter_per_sec = summary.iterations as f64 / elapsed.max(f64::EPSILON),
                    "progress"
                );
            }
            iteration += 1;
        }

        summary.discovered_paths = ctx.scheduler.discovered_paths();
        summary.max_branch = ctx.scheduler.max_branch();
        info!(
            iterations = summary.iterations,
            sub_iterations = summary.sub_iterations,
            faults = summary.faults,
            cancelled = summary.cancelled,
            elapsed = ?started.elapsed(),
            "run finished"
        );
        Ok(summary)
    }

    /// Applies the fault policy to one state-model run.
    fn conclude(
        &self,
        iteration: u64,
        outcome: Result<Vec<String>, ActionError>,
        monitor_fault: Option<FaultData>,
        model: &StateModel,
        ctx: &RunContext,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let mut verdict = IterationVerdict {
            soft_fault: None,
            monitor_fault,
        };

        match outcome {
            Ok(_) => {}
            Err(ActionError::Soft(fault)) => {
                warn!(iteration, error = %fault, "soft fault");
                verdict.soft_fault = Some(fault.to_string());
            }
            Err(e @ (ActionError::Structural(_) | ActionError::Model(_))) => {
                error!(iteration, error = %e, "iteration aborted");
                if self.halt_on_error {
                    return Err(EngineError::Action {
                        iteration,
                        source: e,
                    });
                }
            }
            Err(e) => {
                error!(iteration, error = %e, "run stopped");
                return Err(EngineError::Action {
                    iteration,
                    source: e,
                });
            }
        }

        if verdict.is_clean() {
            return Ok(());
        }
        let inputs = model.data_action_values();
        if let Some(mut report) = self.oracle.examine(iteration, &verdict, &inputs) {
            report.sub_iteration = ctx.sub_iteration;
            summary.faults += 1;
            if let Some(recorder) = &self.recorder {
                recorder.record(
                    &report,
                    ctx.coverage.as_ref(),
                    ctx.scheduler.index_snapshot(),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};
    use crate::agent::{AgentManager, Monitor};
    use crate::config::ParallelSettings;
    use crate::coverage::PathDiscovery;
    use crate::data_model::DataModel;
    use crate::metrics::MetricsLog;
    use crate::scheduler::{CorpusScheduler, SchedulerConfig};
    use crate::seed_store::SeedStore;
    use crate::state::State;
    use crate::test_utils::{ScriptedCoverage, ScriptedPublisher, context_with};
    use crate::watcher::Watcher;
    use std::fs;
    use tempfile::tempdir;

    fn sender() -> StateModel {
        StateModel::new("Test", "S0").with_state(
            State::new("S0").with_action(Action::output(
                "send",
                DataModel::builder("Msg").blob("body", b"ping".to_vec()).build(),
            )),
        )
    }

    fn settings(start: u64, stop: Option<u64>) -> FuzzerSettings {
        FuzzerSettings {
            range_start: start,
            range_stop: stop,
            ..FuzzerSettings::default()
        }
    }

    #[test]
    fn parallel_partitions_cover_range_without_overlap() {
        let mut covered = Vec::new();
        for index in 1..=3 {
            let plan = IterationPlan::from_settings(&FuzzerSettings {
                parallel: Some(ParallelSettings { total: 3, index }),
                ..settings(1, Some(10))
            })
            .unwrap();
            covered.extend(plan.start..=plan.stop.unwrap());
        }
        assert_eq!(covered, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn skip_to_applies_inside_partition() {
        let plan = IterationPlan::from_settings(&FuzzerSettings {
            parallel: Some(ParallelSettings { total: 2, index: 2 }),
            skip_to: Some(8),
            ..settings(1, Some(10))
        })
        .unwrap();
        assert_eq!(plan, IterationPlan::new(8, Some(10)));
    }

    #[test]
    fn invalid_plans_are_config_errors() {
        for bad in [
            settings(0, None),
            settings(5, Some(4)),
            FuzzerSettings {
                parallel: Some(ParallelSettings { total: 2, index: 1 }),
                ..settings(1, None)
            },
            FuzzerSettings {
                parallel: Some(ParallelSettings { total: 2, index: 3 }),
                ..settings(1, Some(10))
            },
            FuzzerSettings {
                parallel: Some(ParallelSettings { total: 5, index: 1 }),
                ..settings(1, Some(3))
            },
        ] {
            assert!(matches!(
                IterationPlan::from_settings(&bad),
                Err(EngineError::Config(_))
            ));
        }
    }

    #[test]
    fn runs_every_iteration_in_range() {
        let publisher = ScriptedPublisher::default();
        let outputs = publisher.outputs();
        let mut ctx = context_with(publisher, ScriptedCoverage::default());
        let mut engine = Engine::new(IterationPlan::new(3, Some(7)));
        let summary = engine.run(&mut sender(), &mut ctx).unwrap();
        assert_eq!(summary.iterations, 5);
        assert_eq!(summary.last_iteration, Some(7));
        assert_eq!(outputs.lock().unwrap().len(), 5);
    }

    #[test]
    fn new_path_earns_a_sub_iteration() {
        let coverage = ScriptedCoverage::default().discover(PathDiscovery::Path, 0);
        let checkpoints = coverage.checkpoints();
        let mut ctx = context_with(ScriptedPublisher::default(), coverage);
        let summary = Engine::new(IterationPlan::new(1, Some(3)))
            .run(&mut sender(), &mut ctx)
            .unwrap();
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.sub_iterations, 1);
        assert_eq!(summary.discovered_paths, 1);
        assert_eq!(*checkpoints.lock().unwrap(), vec![3, 4]);
    }

    struct CancelAfter {
        token: CancelToken,
        iteration: u64,
    }

    impl Watcher for CancelAfter {
        fn state_model_finished(&mut self, _model: &str, iteration: u64) {
            if iteration == self.iteration {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn cancellation_stops_at_iteration_boundary() {
        let mut engine = Engine::new(IterationPlan::new(1, None));
        let token = engine.cancel_token();
        let mut ctx = context_with(ScriptedPublisher::default(), ScriptedCoverage::default())
            .with_watcher(Box::new(CancelAfter {
                token,
                iteration: 3,
            }));
        let summary = engine.run(&mut sender(), &mut ctx).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.iterations, 3);
    }

    #[test]
    fn soft_faults_are_recorded_and_run_continues() {
        let dir = tempdir().unwrap();
        let mut ctx = context_with(
            ScriptedPublisher::default().failing_output(),
            ScriptedCoverage::default(),
        );
        let mut engine = Engine::new(IterationPlan::new(1, Some(2)))
            .with_recorder(FaultRecorder::new(dir.path()));
        let summary = engine.run(&mut sender(), &mut ctx).unwrap();
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.faults, 2);
        assert!(dir.path().join("soft").is_dir());
    }

    struct CrashOn(u64, u64);

    impl Monitor for CrashOn {
        fn name(&self) -> &str {
            "crash"
        }

        fn iteration_starting(&mut self, iteration: u64) {
            self.1 = iteration;
        }

        fn iteration_finished(&mut self) -> bool {
            self.1 == self.0
        }

        fn fault_data(&mut self) -> Option<FaultData> {
            Some(FaultData {
                monitor: "crash".into(),
                description: format!("target died in iteration {}", self.1),
                data: Vec::new(),
            })
        }
    }

    #[test]
    fn monitor_faults_record_the_iteration_inputs() {
        let dir = tempdir().unwrap();
        let mut agents = AgentManager::new();
        agents.add(Box::new(CrashOn(2, 0)));
        let mut ctx = context_with(ScriptedPublisher::default(), ScriptedCoverage::default())
            .with_agents(agents);
        let summary = Engine::new(IterationPlan::new(1, Some(3)))
            .with_recorder(FaultRecorder::new(dir.path()))
            .run(&mut sender(), &mut ctx)
            .unwrap();
        assert_eq!(summary.faults, 1);
        let hash = crate::oracle::input_hash(&[("send".into(), b"ping".to_vec())]);
        let record = dir.path().join("monitor").join(hash).join("2");
        assert_eq!(fs::read(record.join("0.send.bin")).unwrap(), b"ping".to_vec());
    }

    #[test]
    fn sub_iteration_faults_do_not_overwrite_the_first_record() {
        let dir = tempdir().unwrap();
        let mut agents = AgentManager::new();
        agents.add(Box::new(CrashOn(1, 0)));
        let coverage = ScriptedCoverage::default().discover(PathDiscovery::Path, 0);
        let mut ctx = context_with(ScriptedPublisher::default(), coverage).with_agents(agents);
        let summary = Engine::new(IterationPlan::new(1, Some(1)))
            .with_recorder(FaultRecorder::new(dir.path()))
            .run(&mut sender(), &mut ctx)
            .unwrap();
        assert_eq!(summary.sub_iterations, 1);
        assert_eq!(summary.faults, 2);

        let mut records = Vec::new();
        for bucket in fs::read_dir(dir.path().join("monitor")).unwrap() {
            for record in fs::read_dir(bucket.unwrap().path()).unwrap() {
                records.push(record.unwrap().file_name().into_string().unwrap());
            }
        }
        records.sort();
        assert_eq!(records, vec!["1".to_string(), "1.1".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn command_crash_is_reported_after_send_and_receive() {
        use crate::agent::ExitStatusMonitor;
        use crate::command::{CommandPublisher, CommandPublisherConfig, InputDelivery, SharedStatus};
        use crate::coverage::QuiescenceSettings;
        use crate::publisher::Publishers;
        use std::time::Duration;

        let status = SharedStatus::default();
        let target = CommandPublisher::new(
            "target",
            CommandPublisherConfig {
                command: vec!["/bin/sh".into(), "-c".into(), "cat; exit 3".into()],
                input_delivery: InputDelivery::StdIn,
                timeout: Duration::from_secs(5),
                working_dir: None,
            },
            status.clone(),
        );
        let mut agents = AgentManager::new();
        agents.add(Box::new(ExitStatusMonitor::new("exit", status)));
        let mut ctx = RunContext::new(
            Publishers::new().with("primary", Box::new(target)),
            crate::test_utils::scheduler(),
        )
        .with_agents(agents)
        .with_coverage(Box::new(ScriptedCoverage::default()))
        .with_quiescence(QuiescenceSettings::immediate(Duration::from_secs(1)));

        let mut model = StateModel::new("Test", "S0").with_state(
            State::new("S0")
                .with_action(Action::output(
                    "send",
                    DataModel::builder("Msg").blob("body", b"ping".to_vec()).build(),
                ))
                .with_action(Action::input(
                    "recv",
                    DataModel::builder("Reply").blob("body", Vec::new()).build(),
                )),
        );

        let dir = tempdir().unwrap();
        let summary = Engine::new(IterationPlan::new(1, Some(2)))
            .with_recorder(FaultRecorder::new(dir.path()))
            .run(&mut model, &mut ctx)
            .unwrap();

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.faults, 2);
        assert_eq!(model.data_action_count(), 2);
        assert!(dir.path().join("monitor").is_dir());
    }

    #[test]
    fn structural_errors_halt_only_when_configured() {
        let broken = || {
            StateModel::new("Test", "S0")
                .with_state(State::new("S0").with_action(Action::change_state("go", "Nowhere")))
        };
        let mut ctx = context_with(ScriptedPublisher::default(), ScriptedCoverage::default());
        let summary = Engine::new(IterationPlan::new(1, Some(3)))
            .run(&mut broken(), &mut ctx)
            .unwrap();
        assert_eq!(summary.iterations, 3);

        let mut ctx = context_with(ScriptedPublisher::default(), ScriptedCoverage::default());
        let err = Engine::new(IterationPlan::new(1, Some(3)))
            .halt_on_error(true)
            .run(&mut broken(), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, EngineError::Action { iteration: 1, .. }));
    }

    #[test]
    fn fatal_errors_stop_the_run() {
        let mut model = StateModel::new("Test", "S0")
            .with_state(State::new("S0").with_action(Action::new("odd", ActionType::Unknown)));
        let mut ctx = context_with(ScriptedPublisher::default(), ScriptedCoverage::default());
        let err = Engine::new(IterationPlan::new(1, Some(5)))
            .run(&mut model, &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Action {
                source: ActionError::Fatal(_),
                ..
            }
        ));
    }

    #[test]
    fn resume_restores_ring_and_replays_without_bookkeeping() {
        let pool = tempdir().unwrap();
        let fault_dir = tempdir().unwrap();
        let mut store = DirSeedStore::new(pool.path()).unwrap();
        for index in [2u64, 5] {
            let seed = DataModel::builder("Msg")
                .blob("body", vec![index as u8])
                .build();
            store.save_seed(index, &seed).unwrap();
        }
        DirSeedStore::write_index_file(&fault_dir.path().join(INDEX_FILENAME), &[5, 2]).unwrap();

        let scheduler = CorpusScheduler::new(
            SchedulerConfig {
                enabled: true,
                use_time_limit: 10,
                reuse_budget_limit: 3,
            },
            Box::new(DirSeedStore::new(pool.path()).unwrap()),
            MetricsLog::disabled(),
        );
        let coverage = ScriptedCoverage::default().discover(PathDiscovery::PathAndBranch, 4);
        let mut ctx = context_with(ScriptedPublisher::default(), coverage);
        ctx.scheduler = scheduler;

        let mut engine = Engine::new(IterationPlan::new(1, Some(1)));
        // no checkpoint support in the scripted oracle: resume at the planned start
        let resume_at = engine.prepare_resume(&mut ctx, fault_dir.path()).unwrap();
        assert_eq!(resume_at, 1);
        assert_eq!(ctx.scheduler.live_indices(), vec![5, 2]);

        engine.run(&mut sender(), &mut ctx).unwrap();
        // iteration 1 is not below the resume point, so the new branch is kept
        // under the next index after the restored ones
        assert_eq!(ctx.scheduler.live_indices(), vec![5, 2, 6]);
    }

    #[test]
    fn replayed_iterations_skip_corpus_updates() {
        let coverage = ScriptedCoverage::default()
            .discover(PathDiscovery::PathAndBranch, 1)
            .discover(PathDiscovery::PathAndBranch, 2);
        let mut ctx = context_with(ScriptedPublisher::default(), coverage);
        ctx.scheduler.resume(&[], 2).unwrap();
        Engine::new(IterationPlan::new(1, Some(2)))
            .run(&mut sender(), &mut ctx)
            .unwrap();
        assert_eq!(ctx.scheduler.discovered_paths(), 2);
        assert_eq!(ctx.scheduler.ring_len(), 1);
        assert_eq!(ctx.scheduler.max_branch(), 2);
    }
}
