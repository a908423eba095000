use crate::agent::AgentManager;
use crate::coverage::{CoverageOracle, NullCoverage, QuiescenceSettings};
use crate::cracker::{DataCracker, ModelCracker};
use crate::publisher::Publishers;
use crate::scheduler::CorpusScheduler;
use crate::strategy::{MutationStrategy, NoMutation};
use crate::watcher::{Watcher, Watchers};

/// Everything a state-model run needs besides the model itself.
///
/// Fields are public so the executor can borrow disjoint collaborators at once, e.g.
/// a publisher and the scheduler's current candidate.
pub struct RunContext {
    pub iteration: u64,
    pub sub_iteration: u32,
    /// Set until the original data models have been prepared successfully.
    pub need_data_model: bool,
    pub publishers: Publishers,
    pub agents: AgentManager,
    pub coverage: Box<dyn CoverageOracle>,
    pub scheduler: CorpusScheduler,
    pub strategy: Box<dyn MutationStrategy>,
    pub cracker: Box<dyn DataCracker>,
    pub quiescence: QuiescenceSettings,
    pub watchers: Watchers,
}

impl RunContext {
    pub fn new(publishers: Publishers, scheduler: CorpusScheduler) -> Self {
        Self {
            iteration: 1,
            sub_iteration: 0,
            need_data_model: true,
            publishers,
            agents: AgentManager::new(),
            coverage: Box::new(NullCoverage),
            scheduler,
            strategy: Box::new(NoMutation),
            cracker: Box::new(ModelCracker::new()),
            quiescence: QuiescenceSettings::default(),
            watchers: Watchers::new(),
        }
    }

    pub fn with_agents(mut self, agents: AgentManager) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_coverage(mut self, coverage: Box<dyn CoverageOracle>) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn MutationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cracker(mut self, cracker: Box<dyn DataCracker>) -> Self {
        self.cracker = cracker;
        self
    }

    pub fn with_quiescence(mut self, quiescence: QuiescenceSettings) -> Self {
        self.quiescence = quiescence;
        self
    }

    pub fn with_watcher(mut self, watcher: Box<dyn Watcher>) -> Self {
        self.watchers.add(watcher);
        self
    }
}
