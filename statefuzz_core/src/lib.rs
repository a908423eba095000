pub mod action;
pub mod agent;
pub mod bitmap;
pub mod command;
pub mod config;
pub mod context;
pub mod coverage;
pub mod cracker;
pub mod data_model;
pub mod engine;
pub mod metrics;
pub mod oracle;
pub mod publisher;
pub mod scheduler;
pub mod seed_store;
pub mod state;
pub mod state_model;
pub mod strategy;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

pub use action::{Action, ActionError, ActionOutcome, ActionType, DataSet, SoftFault};
pub use agent::{AgentManager, ExitStatusMonitor, FaultData, Monitor};
pub use bitmap::{BitmapCoverage, FileTrace, SharedTrace, TraceSource};
pub use command::{CommandPublisher, ExecutionStatus, SharedStatus};
pub use config::{FeedbackSettings, FuzzerSettings, StatefuzzConfig};
pub use context::RunContext;
pub use coverage::{CoverageError, CoverageOracle, NullCoverage, PathDiscovery};
pub use cracker::{CrackError, DataCracker, ModelCracker};
pub use data_model::{DataModel, DataModelError, Variant};
pub use engine::{CancelToken, Engine, EngineError, IterationPlan, RunSummary};
pub use metrics::MetricsLog;
pub use oracle::{DefaultFaultOracle, FaultOracle, FaultRecorder, FaultReport};
pub use publisher::{Publisher, PublisherError, PublisherRegistry, Publishers};
pub use scheduler::{CorpusScheduler, SchedulerConfig, SchedulerError};
pub use seed_store::{DirSeedStore, MemorySeedStore, SeedStore, StoreError};
pub use state::State;
pub use state_model::StateModel;
pub use strategy::{FeedbackStrategy, MutationStrategy, NoMutation};
pub use watcher::{LogWatcher, Watcher, Watchers};
