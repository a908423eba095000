use crate::agent::FaultData;
use crate::coverage::CoverageOracle;
use crate::seed_store::{DirSeedStore, INDEX_FILENAME, StoreError};
use md5;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Severity assigned to faults reported by a monitor.
const DEFAULT_MONITOR_SEVERITY: u8 = 10;
/// Severity assigned to soft faults raised by the executor itself.
const DEFAULT_SOFT_SEVERITY: u8 = 1;

pub const CHECKPOINT_FILENAME: &str = "checkpoint.bin";
pub const DESCRIPTION_FILENAME: &str = "description.txt";

/// What went wrong in one iteration, as seen by the run controller.
#[derive(Debug, Clone, Default)]
pub struct IterationVerdict {
    /// Description of the soft fault that aborted the iteration, if any.
    pub soft_fault: Option<String>,
    /// First fault reported by the agent's monitors.
    pub monitor_fault: Option<FaultData>,
}

impl IterationVerdict {
    pub fn is_clean(&self) -> bool {
        self.soft_fault.is_none() && self.monitor_fault.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Soft,
    Monitor,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::Soft => "soft",
            FaultKind::Monitor => "monitor",
        })
    }
}

/// A fault worth reproducing, with the data that triggered it.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub iteration: u64,
    /// Sub-iteration of `iteration` that produced the fault; 0 for the first pass.
    pub sub_iteration: u32,
    pub kind: FaultKind,
    /// A human-readable description of the fault.
    pub description: String,
    /// MD5 of the concatenated triggering inputs, used to bucket duplicates.
    pub input_hash: String,
    /// `(action name, serialized value)` of every data action in the iteration.
    pub inputs: Vec<(String, Vec<u8>)>,
    /// Named evidence attached by the reporting monitor.
    pub monitor_data: Vec<(String, Vec<u8>)>,
    pub severity: u8,
}

/// A `FaultOracle` decides whether an iteration's outcome is a reportable fault.
pub trait FaultOracle: Send {
    /// Examines the verdict for `iteration`.
    ///
    /// # Arguments
    /// * `iteration`: The top-level iteration the verdict belongs to.
    /// * `verdict`: Soft fault and monitor fault observed during the iteration.
    /// * `inputs`: The iteration's executed data actions and their serialized values.
    ///
    /// # Returns
    /// `Some(FaultReport)` if the iteration should be recorded.
    fn examine(
        &self,
        iteration: u64,
        verdict: &IterationVerdict,
        inputs: &[(String, Vec<u8>)],
    ) -> Option<FaultReport>;
}

/// Reports monitor faults first, then soft faults.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFaultOracle;

pub fn input_hash(inputs: &[(String, Vec<u8>)]) -> String {
    let mut context = md5::Context::new();
    for (_, bytes) in inputs {
        context.consume(bytes);
    }
    format!("{:x}", context.compute())
}

impl FaultOracle for DefaultFaultOracle {
    fn examine(
        &self,
        iteration: u64,
        verdict: &IterationVerdict,
        inputs: &[(String, Vec<u8>)],
    ) -> Option<FaultReport> {
        let (kind, description, monitor_data, severity) =
            match (&verdict.monitor_fault, &verdict.soft_fault) {
                (Some(fault), _) => (
                    FaultKind::Monitor,
                    format!("{}: {}", fault.monitor, fault.description),
                    fault.data.clone(),
                    DEFAULT_MONITOR_SEVERITY,
                ),
                (None, Some(soft)) => (
                    FaultKind::Soft,
                    soft.clone(),
                    Vec::new(),
                    DEFAULT_SOFT_SEVERITY,
                ),
                (None, None) => return None,
            };
        Some(FaultReport {
            iteration,
            sub_iteration: 0,
            kind,
            description,
            input_hash: input_hash(inputs),
            inputs: inputs.to_vec(),
            monitor_data,
            severity,
        })
    }
}

/// Writes fault reports under `<root>/<kind>/<input hash>/<iteration>/`, or
/// `<iteration>.<sub>/` for faults found in a sub-iteration.
///
/// Next to the inputs, each record carries the coverage checkpoint and the valuable
/// seed ordering, so a later session can resume from it.
#[derive(Debug, Clone)]
pub struct FaultRecorder {
    root: PathBuf,
}

impl FaultRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record(
        &self,
        report: &FaultReport,
        coverage: &dyn CoverageOracle,
        index_snapshot: &[u64],
    ) -> Result<PathBuf, StoreError> {
        let leaf = match report.sub_iteration {
            0 => report.iteration.to_string(),
            sub => format!("{}.{}", report.iteration, sub),
        };
        let dir = self
            .root
            .join(report.kind.to_string())
            .join(&report.input_hash)
            .join(leaf);
        fs::create_dir_all(&dir)?;

        for (position, (action, bytes)) in report.inputs.iter().enumerate() {
            let action = file_component(action);
            fs::write(dir.join(format!("{position}.{action}.bin")), bytes)?;
        }
        for (name, bytes) in &report.monitor_data {
            let name = file_component(name);
            fs::write(dir.join(format!("monitor.{name}")), bytes)?;
        }
        fs::write(
            dir.join(DESCRIPTION_FILENAME),
            format!(
                "iteration: {}\nsub-iteration: {}\nseverity: {}\n\n{}\n",
                report.iteration, report.sub_iteration, report.severity, report.description
            ),
        )?;
        if let Err(e) = coverage.save_checkpoint(&dir.join(CHECKPOINT_FILENAME)) {
            warn!(dir = ?dir, error = %e, "fault recorded without coverage checkpoint");
        }
        DirSeedStore::write_index_file(&dir.join(INDEX_FILENAME), index_snapshot)?;

        info!(
            iteration = report.iteration,
            sub_iteration = report.sub_iteration,
            kind = %report.kind,
            hash = %report.input_hash,
            "fault recorded"
        );
        Ok(dir)
    }
}

/// Keeps ASCII alphanumerics, `-` and `_`; anything else becomes `_`.
fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::NullCoverage;
    use tempfile::tempdir;

    fn inputs() -> Vec<(String, Vec<u8>)> {
        vec![
            ("send".to_string(), vec![0xFF, 0xFE]),
            ("ack".to_string(), vec![0xFD]),
        ]
    }

    #[test]
    fn clean_iteration_is_not_reported() {
        let verdict = IterationVerdict::default();
        assert!(verdict.is_clean());
        assert!(DefaultFaultOracle.examine(3, &verdict, &inputs()).is_none());
    }

    #[test]
    fn monitor_fault_outranks_soft_fault() {
        let verdict = IterationVerdict {
            soft_fault: Some("crack failed".into()),
            monitor_fault: Some(FaultData {
                monitor: "exit".into(),
                description: "segfault".into(),
                data: vec![("core".into(), b"dump".to_vec())],
            }),
        };
        let report = DefaultFaultOracle.examine(7, &verdict, &inputs()).unwrap();
        assert_eq!(report.kind, FaultKind::Monitor);
        assert_eq!(report.description, "exit: segfault");
        assert_eq!(report.severity, DEFAULT_MONITOR_SEVERITY);
        assert_eq!(report.monitor_data.len(), 1);
        assert_eq!(report.input_hash, format!("{:x}", md5::compute([0xFFu8, 0xFE, 0xFD])));
    }

    #[test]
    fn recorder_writes_inputs_description_and_index() {
        let dir = tempdir().unwrap();
        let recorder = FaultRecorder::new(dir.path());
        let verdict = IterationVerdict {
            soft_fault: Some("transport reset".into()),
            monitor_fault: None,
        };
        let report = DefaultFaultOracle.examine(12, &verdict, &inputs()).unwrap();
        let written = recorder.record(&report, &NullCoverage, &[4, 9]).unwrap();

        assert!(written.starts_with(dir.path().join("soft")));
        assert_eq!(fs::read(written.join("0.send.bin")).unwrap(), vec![0xFF, 0xFE]);
        assert_eq!(fs::read(written.join("1.ack.bin")).unwrap(), vec![0xFD]);
        let description = fs::read_to_string(written.join(DESCRIPTION_FILENAME)).unwrap();
        assert!(description.contains("transport reset"));
        assert_eq!(
            DirSeedStore::read_index_file(&written.join(INDEX_FILENAME)).unwrap(),
            vec![4, 9]
        );
    }

    #[test]
    fn names_cannot_escape_the_record_directory() {
        let dir = tempdir().unwrap();
        let recorder = FaultRecorder::new(dir.path().join("faults"));
        let verdict = IterationVerdict {
            soft_fault: None,
            monitor_fault: Some(FaultData {
                monitor: "exit".into(),
                description: "crash".into(),
                data: vec![("../../stolen".into(), b"log".to_vec())],
            }),
        };
        let inputs = vec![("../x/y".to_string(), b"payload".to_vec())];
        let report = DefaultFaultOracle.examine(1, &verdict, &inputs).unwrap();
        let written = recorder.record(&report, &NullCoverage, &[]).unwrap();

        assert_eq!(fs::read(written.join("0.___x_y.bin")).unwrap(), b"payload");
        assert_eq!(fs::read(written.join("monitor.______stolen")).unwrap(), b"log");
        assert!(!dir.path().join("stolen").exists());
        assert!(!dir.path().join("faults").join("x").exists());
        assert_eq!(file_component("Send-Ack_2"), "Send-Ack_2");
    }

    #[test]
    fn sub_iterations_get_their_own_record() {
        let dir = tempdir().unwrap();
        let recorder = FaultRecorder::new(dir.path());
        let verdict = IterationVerdict {
            soft_fault: Some("reset".into()),
            monitor_fault: None,
        };
        let mut first = DefaultFaultOracle.examine(5, &verdict, &inputs()).unwrap();
        let first_dir = recorder.record(&first, &NullCoverage, &[]).unwrap();
        first.sub_iteration = 2;
        first.inputs[0].1 = vec![0x01];
        let second_dir = recorder.record(&first, &NullCoverage, &[]).unwrap();

        assert!(first_dir.ends_with("5"));
        assert!(second_dir.ends_with("5.2"));
        assert_eq!(fs::read(first_dir.join("0.send.bin")).unwrap(), vec![0xFF, 0xFE]);
        assert_eq!(fs::read(second_dir.join("0.send.bin")).unwrap(), vec![0x01]);
    }
}
