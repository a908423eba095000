use crate::context::RunContext;
use crate::coverage::{CoverageError, CoverageOracle, PathDiscovery, QuiescenceSettings};
use crate::data_model::Variant;
use crate::metrics::MetricsLog;
use crate::publisher::{Publisher, PublisherError, Publishers};
use crate::scheduler::{Clock, CorpusScheduler, SchedulerConfig};
use crate::seed_store::MemorySeedStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub(crate) type Shared<T> = Arc<Mutex<T>>;

/// Publisher double that records what the engine sends and replays canned answers.
#[derive(Default)]
pub(crate) struct ScriptedPublisher {
    outputs: Shared<Vec<Vec<u8>>>,
    inputs: VecDeque<Vec<u8>>,
    calls: Shared<Vec<(String, Vec<Variant>)>>,
    call_result: Option<Variant>,
    properties: Shared<HashMap<String, Variant>>,
    closes: Arc<AtomicUsize>,
    fail_output: bool,
}

impl ScriptedPublisher {
    pub(crate) fn with_input(mut self, bytes: Vec<u8>) -> Self {
        self.inputs.push_back(bytes);
        self
    }

    pub(crate) fn with_call_result(mut self, value: Variant) -> Self {
        self.call_result = Some(value);
        self
    }

    pub(crate) fn with_property(self, name: &str, value: Variant) -> Self {
        self.properties
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
        self
    }

    pub(crate) fn failing_output(mut self) -> Self {
        self.fail_output = true;
        self
    }

    pub(crate) fn outputs(&self) -> Shared<Vec<Vec<u8>>> {
        self.outputs.clone()
    }

    pub(crate) fn calls(&self) -> Shared<Vec<(String, Vec<Variant>)>> {
        self.calls.clone()
    }

    pub(crate) fn properties(&self) -> Shared<HashMap<String, Variant>> {
        self.properties.clone()
    }

    pub(crate) fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl Publisher for ScriptedPublisher {
    fn name(&self) -> &str {
        "scripted"
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn input(&mut self) -> Result<Vec<u8>, PublisherError> {
        self.inputs
            .pop_front()
            .ok_or_else(|| PublisherError::Transport("no scripted input left".into()))
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        if self.fail_output {
            return Err(PublisherError::Transport("connection reset".into()));
        }
        self.outputs.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn call(&mut self, method: &str, args: &[Variant]) -> Result<Option<Variant>, PublisherError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), args.to_vec()));
        Ok(self.call_result.clone())
    }

    fn get_property(&mut self, property: &str) -> Result<Variant, PublisherError> {
        self.properties
            .lock()
            .unwrap()
            .get(property)
            .cloned()
            .ok_or_else(|| PublisherError::UnknownProperty {
                publisher: "scripted".into(),
                property: property.to_string(),
            })
    }

    fn set_property(&mut self, property: &str, value: &Variant) -> Result<(), PublisherError> {
        self.properties
            .lock()
            .unwrap()
            .insert(property.to_string(), value.clone());
        Ok(())
    }
}

/// Coverage double answering each `new_path` from a script, then `None`.
#[derive(Default)]
pub(crate) struct ScriptedCoverage {
    script: VecDeque<(PathDiscovery, u64)>,
    branches: u64,
    busy: bool,
    checkpoints: Shared<Vec<u64>>,
}

impl ScriptedCoverage {
    /// Queues the verdict for the next output; `branches` becomes the cumulative count.
    pub(crate) fn discover(mut self, discovery: PathDiscovery, branches: u64) -> Self {
        self.script.push_back((discovery, branches));
        self
    }

    pub(crate) fn never_quiet(mut self) -> Self {
        self.busy = true;
        self
    }

    pub(crate) fn checkpoints(&self) -> Shared<Vec<u64>> {
        self.checkpoints.clone()
    }
}

impl CoverageOracle for ScriptedCoverage {
    fn is_target_quiescent(&mut self) -> Result<bool, CoverageError> {
        Ok(!self.busy)
    }

    fn new_path(&mut self) -> Result<PathDiscovery, CoverageError> {
        Ok(match self.script.pop_front() {
            Some((discovery, branches)) => {
                self.branches = branches;
                discovery
            }
            None => PathDiscovery::None,
        })
    }

    fn branch_count(&self) -> u64 {
        self.branches
    }

    fn checkpoint(&mut self, next_iteration: u64) -> Result<(), CoverageError> {
        self.checkpoints.lock().unwrap().push(next_iteration);
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub(crate) struct ManualClock {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

pub(crate) fn scheduler() -> CorpusScheduler {
    CorpusScheduler::with_clock(
        SchedulerConfig {
            enabled: true,
            use_time_limit: 10,
            reuse_budget_limit: 3,
        },
        Box::new(MemorySeedStore::new()),
        MetricsLog::disabled(),
        Box::new(ManualClock::new()),
    )
}

/// Context with one scripted publisher, feedback enabled and no waiting.
pub(crate) fn context_with(publisher: ScriptedPublisher, coverage: ScriptedCoverage) -> RunContext {
    RunContext::new(
        Publishers::new().with("primary", Box::new(publisher)),
        scheduler(),
    )
    .with_coverage(Box::new(coverage))
    .with_quiescence(QuiescenceSettings::immediate(Duration::from_secs(1)))
}
