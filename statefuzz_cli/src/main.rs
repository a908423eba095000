use statefuzz_core::action::Action;
use statefuzz_core::agent::{AgentManager, ExitStatusMonitor};
use statefuzz_core::bitmap::{BitmapCoverage, FileTrace};
use statefuzz_core::config::StatefuzzConfig;
use statefuzz_core::context::RunContext;
use statefuzz_core::coverage::{CoverageOracle, NullCoverage, QuiescenceSettings};
use statefuzz_core::data_model::DataModel;
use statefuzz_core::engine::{Engine, IterationPlan};
use statefuzz_core::metrics::MetricsLog;
use statefuzz_core::oracle::FaultRecorder;
use statefuzz_core::publisher::{PublisherEnv, PublisherRegistry, Publishers};
use statefuzz_core::scheduler::{CorpusScheduler, SchedulerConfig};
use statefuzz_core::seed_store::{DirSeedStore, MemorySeedStore, SeedStore};
use statefuzz_core::state::State;
use statefuzz_core::state_model::StateModel;
use statefuzz_core::strategy::FeedbackStrategy;
use statefuzz_core::watcher::LogWatcher;

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SAMPLE: &[u8] = b"INIT";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Initial bytes of the single output action.
    #[clap(short, long, value_parser)]
    sample: Option<PathBuf>,
    #[clap(long)]
    target_command: Option<String>,
    /// Stop after this many iterations from the range start.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Fault record directory to resume from.
    #[clap(long, value_parser)]
    resume: Option<PathBuf>,
}

fn load_config(path: Option<PathBuf>) -> Result<StatefuzzConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            StatefuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("statefuzz.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                StatefuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("no configuration file found, using built-in defaults");
                Ok(StatefuzzConfig::default())
            }
        }
    }
}

fn sample_model(sample: Option<&PathBuf>) -> Result<DataModel, anyhow::Error> {
    let bytes = match sample {
        Some(path) => std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read sample {:?}: {}", path, e))?,
        None => DEFAULT_SAMPLE.to_vec(),
    };
    Ok(DataModel::builder("Message").blob("data", bytes).build())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config_file)?;

    let mut fuzzer = config.fuzzer();
    if let Some(iterations) = cli.iterations {
        fuzzer.range_stop = Some(fuzzer.range_start + iterations.saturating_sub(1));
    }
    if let Some(target_cmd) = cli.target_command {
        if config.publisher.command.is_empty() {
            config.publisher.command.push(target_cmd);
        } else {
            config.publisher.command[0] = target_cmd;
        }
    }
    let resume_from = cli.resume.or_else(|| config.feedback.resume_from.clone());
    info!(?config, "effective configuration");

    let env = PublisherEnv::default();
    let publisher = PublisherRegistry::with_builtins().build("primary", &config.publisher, &env)?;

    let mut agents = AgentManager::new();
    agents.add(Box::new(ExitStatusMonitor::new(
        "exit-status",
        env.exit_status.clone(),
    )));

    let coverage: Box<dyn CoverageOracle> = match &config.oracle.trace_file {
        Some(path) => Box::new(BitmapCoverage::new(
            Box::new(FileTrace::new(path, config.oracle.map_size)),
            config.oracle.map_size,
        )),
        None => {
            if config.feedback.enabled {
                warn!("feedback enabled without a trace file, no path will ever be discovered");
            }
            Box::new(NullCoverage)
        }
    };

    let store: Box<dyn SeedStore> = if config.feedback.enabled {
        Box::new(DirSeedStore::new(&config.feedback.seed_pool_dir)?)
    } else {
        Box::new(MemorySeedStore::new())
    };
    let metrics = if config.feedback.enabled {
        MetricsLog::from_settings(&config.feedback)
    } else {
        MetricsLog::disabled()
    };
    if resume_from.is_none() {
        metrics.reset_all();
    }
    let scheduler = CorpusScheduler::new(SchedulerConfig::from(&config.feedback), store, metrics);

    let mut ctx = RunContext::new(Publishers::new().with("primary", publisher), scheduler)
        .with_agents(agents)
        .with_coverage(coverage)
        .with_strategy(Box::new(FeedbackStrategy::new(fuzzer.seed)))
        .with_quiescence(QuiescenceSettings::from(&config.oracle))
        .with_watcher(Box::new(LogWatcher));

    let mut model = StateModel::new("Default", "Initial").with_state(
        State::new("Initial").with_action(Action::output("send", sample_model(cli.sample.as_ref())?)),
    );

    let mut engine = Engine::new(IterationPlan::from_settings(&fuzzer)?)
        .with_recorder(FaultRecorder::new(fuzzer.output_dir.join("faults")))
        .halt_on_error(fuzzer.halt_on_error);
    if let Some(dir) = &resume_from {
        engine.prepare_resume(&mut ctx, dir)?;
    }

    let summary = engine.run(&mut model, &mut ctx)?;
    info!(
        iterations = summary.iterations,
        sub_iterations = summary.sub_iterations,
        faults = summary.faults,
        paths = summary.discovered_paths,
        max_branch = summary.max_branch,
        "fuzzing finished"
    );
    Ok(())
}
