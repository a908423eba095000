use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PublisherSettings {
    #[serde(default = "default_publisher_class")]
    pub class: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_publisher_class() -> String {
    "command".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            class: default_publisher_class(),
            command: Vec::new(),
            input_delivery: ConfigInputDelivery::default(),
            timeout_ms: default_timeout_ms(),
            working_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ParallelSettings {
    pub total: u64,
    /// 1-based partition index.
    pub index: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_range_start")]
    pub range_start: u64,
    #[serde(default)]
    pub range_stop: Option<u64>,
    #[serde(default)]
    pub skip_to: Option<u64>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub parallel: Option<ParallelSettings>,
    #[serde(default)]
    pub halt_on_error: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_range_start() -> u64 {
    1
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./statefuzz_out")
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_stop: None,
            skip_to: None,
            seed: 0,
            parallel: None,
            halt_on_error: false,
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FeedbackSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_use_time_limit")]
    pub use_time_limit: u32,
    #[serde(default = "default_seed_pool_reuse_limit")]
    pub seed_pool_reuse_limit: usize,
    #[serde(default = "default_seed_pool_dir")]
    pub seed_pool_dir: PathBuf,
    #[serde(default = "default_path_log")]
    pub path_log: PathBuf,
    #[serde(default = "default_branch_log")]
    pub branch_log: PathBuf,
    #[serde(default = "default_queue_log")]
    pub queue_log: PathBuf,
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
}

fn default_use_time_limit() -> u32 {
    10
}

fn default_seed_pool_reuse_limit() -> usize {
    3
}

pub fn default_seed_pool_dir() -> PathBuf {
    PathBuf::from("./statefuzz_out/seedpool")
}

fn default_path_log() -> PathBuf {
    PathBuf::from("/tmp/statefuzz_path.csv")
}

fn default_branch_log() -> PathBuf {
    PathBuf::from("/tmp/statefuzz_branch.csv")
}

fn default_queue_log() -> PathBuf {
    PathBuf::from("/tmp/statefuzz_queue.csv")
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            use_time_limit: default_use_time_limit(),
            seed_pool_reuse_limit: default_seed_pool_reuse_limit(),
            seed_pool_dir: default_seed_pool_dir(),
            path_log: default_path_log(),
            branch_log: default_branch_log(),
            queue_log: default_queue_log(),
            resume_from: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_quiescence_timeout_ms")]
    pub quiescence_timeout_ms: u64,
    /// Shared trace bitmap written by the instrumented target.
    #[serde(default)]
    pub trace_file: Option<PathBuf>,
    #[serde(default = "default_map_size")]
    pub map_size: usize,
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_quiescence_timeout_ms() -> u64 {
    30_000
}

pub fn default_map_size() -> usize {
    1 << 21
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            quiescence_timeout_ms: default_quiescence_timeout_ms(),
            trace_file: None,
            map_size: default_map_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StatefuzzConfig {
    #[serde(default)]
    pub fuzzer: Option<FuzzerSettings>,
    #[serde(default)]
    pub publisher: PublisherSettings,
    #[serde(default)]
    pub feedback: FeedbackSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
}

impl StatefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: StatefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn fuzzer(&self) -> FuzzerSettings {
        self.fuzzer.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_yields_defaults() {
        let config: StatefuzzConfig = toml::from_str("").unwrap();
        let fuzzer = config.fuzzer();
        assert_eq!(fuzzer.range_start, 1);
        assert!(fuzzer.range_stop.is_none());
        assert!(!config.feedback.enabled);
        assert_eq!(config.feedback.use_time_limit, 10);
        assert_eq!(config.feedback.seed_pool_reuse_limit, 3);
        assert_eq!(config.oracle.settle_delay_ms, 100);
        assert_eq!(config.oracle.poll_interval_ms, 10);
        assert_eq!(config.oracle.quiescence_timeout_ms, 30_000);
        assert_eq!(config.publisher.class, "command");
    }

    #[test]
    fn load_full_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[fuzzer]
range-start = 10
range-stop = 500
skip-to = 20
seed = 7
parallel = {{ total = 4, index = 2 }}
halt-on-error = true

[publisher]
command = ["./target", "--in"]
input-delivery = {{ file = {{ template = "{{}}" }} }}
timeout-ms = 500

[feedback]
enabled = true
use-time-limit = 4
seed-pool-dir = "/tmp/pool"
resume-from = "/tmp/faults/1"

[oracle]
quiescence-timeout-ms = 250
trace-file = "/dev/shm/trace"
"#
        )
        .unwrap();

        let config = StatefuzzConfig::load_from_file(file.path()).unwrap();
        let fuzzer = config.fuzzer();
        assert_eq!(fuzzer.range_start, 10);
        assert_eq!(fuzzer.range_stop, Some(500));
        assert_eq!(fuzzer.skip_to, Some(20));
        assert_eq!(
            fuzzer.parallel,
            Some(ParallelSettings { total: 4, index: 2 })
        );
        assert!(fuzzer.halt_on_error);
        assert_eq!(config.publisher.command, vec!["./target", "--in"]);
        assert_eq!(
            config.publisher.input_delivery,
            ConfigInputDelivery::File {
                template: "{}".into()
            }
        );
        assert!(config.feedback.enabled);
        assert_eq!(config.feedback.use_time_limit, 4);
        assert_eq!(
            config.feedback.resume_from,
            Some(PathBuf::from("/tmp/faults/1"))
        );
        assert_eq!(config.oracle.quiescence_timeout_ms, 250);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<StatefuzzConfig, _> = toml::from_str("[feedback]\nbogus = 1\n");
        assert!(result.is_err());
    }
}
