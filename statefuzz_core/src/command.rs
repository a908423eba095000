use crate::config::{ConfigInputDelivery, PublisherSettings};
use crate::data_model::Variant;
use crate::publisher::{Publisher, PublisherError};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    #[default]
    Ok,
    Timeout,
    Crash(String),
    Other(String),
}

impl ExecutionStatus {
    /// Whether a monitor should report this status as a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, ExecutionStatus::Crash(_) | ExecutionStatus::Timeout)
    }
}

/// Last execution status of a command publisher, readable by monitors.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus(Arc<Mutex<ExecutionStatus>>);

impl SharedStatus {
    pub fn get(&self) -> ExecutionStatus {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, status: ExecutionStatus) {
        match self.0.lock() {
            Ok(mut guard) => *guard = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    /// Records the outcome of one execution. A crash or timeout stays in place until
    /// the next `set`, so later clean runs in the same iteration cannot hide it.
    pub fn record(&self, status: ExecutionStatus) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.is_fault() {
            *guard = status;
        }
    }
}

pub enum InputDelivery {
    StdIn,
    File(String),
}

impl From<&ConfigInputDelivery> for InputDelivery {
    fn from(value: &ConfigInputDelivery) -> Self {
        match value {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template.clone()),
        }
    }
}

pub struct CommandPublisherConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Runs the target once per output, feeding it the serialized data model.
///
/// The child's stdout becomes the next `input()`. Crashes and timeouts do not fail the
/// output; they are recorded in the shared status for a monitor to report.
pub struct CommandPublisher {
    name: String,
    config: CommandPublisherConfig,
    status: SharedStatus,
    last_stdout: Option<Vec<u8>>,
    last_exit_code: Option<i32>,
}

impl CommandPublisher {
    pub fn new(name: impl Into<String>, config: CommandPublisherConfig, status: SharedStatus) -> Self {
        Self {
            name: name.into(),
            config,
            status,
            last_stdout: None,
            last_exit_code: None,
        }
    }

    pub fn from_settings(
        name: &str,
        settings: &PublisherSettings,
        status: SharedStatus,
    ) -> Result<Self, PublisherError> {
        if settings.command.is_empty() {
            return Err(PublisherError::Transport(
                "command publisher needs a non-empty command".into(),
            ));
        }
        Ok(Self::new(
            name,
            CommandPublisherConfig {
                command: settings.command.clone(),
                input_delivery: InputDelivery::from(&settings.input_delivery),
                timeout: Duration::from_millis(settings.timeout_ms),
                working_dir: settings.working_dir.clone(),
            },
            status,
        ))
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    fn run_and_wait_with_timeout(
        mut child: Child,
        timeout: Duration,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        warn!(?timeout, "target timed out, killing");
                        if let Err(e) = child.kill() {
                            return Err(ExecutionStatus::Other(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}",
                    )));
                }
            }
        }
    }

    fn describe_exit(status: ExitStatus) -> ExecutionStatus {
        if status.success() {
            return ExecutionStatus::Ok;
        }
        if let Some(code) = status.code() {
            return ExecutionStatus::Crash(format!("Exited with code {code}"));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExecutionStatus::Crash(format!("Terminated by signal {signal}"));
            }
        }
        ExecutionStatus::Crash("Exited abnormally".to_string())
    }

    fn spawn_writer<W: Write + Send + 'static>(
        mut sink: W,
        data: Vec<u8>,
    ) -> JoinHandle<io::Result<()>> {
        std::thread::spawn(move || sink.write_all(&data))
    }

    fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = source.read_to_end(&mut buffer);
            buffer
        })
    }

    fn execute(&mut self, data: &[u8]) -> Result<ExecutionStatus, PublisherError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| PublisherError::Transport("empty command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        // Held until the child exits.
        let mut _input_file: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(data)?;
                file.flush()?;
                let path = file.path().to_str().ok_or_else(|| {
                    PublisherError::Transport("Temp file path is not valid UTF-8".into())
                })?;
                for part in arg_template.replace("{}", path).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                _input_file = Some(file);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            PublisherError::Transport(format!(
                "Failed to spawn command '{:?}': {}",
                self.config.command, e
            ))
        })?;
        let reader = child.stdout.take().map(Self::spawn_reader);
        // Fed from its own thread so a target that never reads stdin still hits the
        // timeout instead of blocking the write.
        let writer = match self.config.input_delivery {
            InputDelivery::StdIn => child
                .stdin
                .take()
                .map(|stdin| Self::spawn_writer(stdin, data.to_vec())),
            InputDelivery::File(_) => None,
        };

        let status = match Self::run_and_wait_with_timeout(child, self.config.timeout) {
            Ok(exit) => {
                self.last_exit_code = exit.code();
                Self::describe_exit(exit)
            }
            Err(status) => {
                self.last_exit_code = None;
                status
            }
        };
        // A killed target may leave descendants holding the pipes open.
        if status != ExecutionStatus::Timeout {
            if let Some(handle) = writer {
                match handle.join() {
                    Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                        warn!(error = %e, "failed to write target stdin");
                    }
                    Ok(Err(e)) => debug!(error = %e, "target exited before reading all input"),
                    _ => {}
                }
            }
        }
        self.last_stdout = match (&status, reader) {
            (ExecutionStatus::Timeout, _) | (_, None) => None,
            (_, Some(handle)) => handle.join().ok(),
        };
        Ok(status)
    }
}

impl Publisher for CommandPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&mut self) -> Result<Vec<u8>, PublisherError> {
        self.last_stdout
            .take()
            .ok_or_else(|| PublisherError::Transport("no target output to read".into()))
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        let status = self.execute(data)?;
        debug!(publisher = %self.name, ?status, bytes = data.len(), "command executed");
        self.status.record(status);
        Ok(())
    }

    fn get_property(&mut self, property: &str) -> Result<Variant, PublisherError> {
        match property {
            "exit-code" => Ok(self
                .last_exit_code
                .map(|c| Variant::Int(c as i64))
                .unwrap_or(Variant::Null)),
            "status" => Ok(Variant::Str(format!("{:?}", self.status.get()))),
            _ => Err(PublisherError::UnknownProperty {
                publisher: self.name.clone(),
                property: property.to_string(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::{ExitStatusMonitor, Monitor};

    fn shell(script: &str, timeout: Duration) -> CommandPublisher {
        CommandPublisher::new(
            "cmd",
            CommandPublisherConfig {
                command: vec!["/bin/sh".into(), "-c".into(), script.into()],
                input_delivery: InputDelivery::StdIn,
                timeout,
                working_dir: None,
            },
            SharedStatus::default(),
        )
    }

    #[test]
    fn stdout_becomes_next_input() {
        let mut publisher = shell("cat", Duration::from_secs(5));
        publisher.output(b"ping").unwrap();
        assert_eq!(publisher.status().get(), ExecutionStatus::Ok);
        assert_eq!(publisher.input().unwrap(), b"ping".to_vec());
        assert!(publisher.input().is_err());
    }

    #[test]
    fn non_zero_exit_is_recorded_as_crash() {
        let mut publisher = shell("cat >/dev/null; exit 3", Duration::from_secs(5));
        publisher.output(b"x").unwrap();
        assert_eq!(
            publisher.status().get(),
            ExecutionStatus::Crash("Exited with code 3".into())
        );
        assert_eq!(publisher.get_property("exit-code").unwrap(), Variant::Int(3));
    }

    #[test]
    fn crash_survives_later_actions_in_the_iteration() {
        let mut publisher = shell("cat; exit 3", Duration::from_secs(5));
        let mut monitor = ExitStatusMonitor::new("exit", publisher.status());

        monitor.iteration_starting(1);
        publisher.start().unwrap();
        publisher.output(b"ping").unwrap();
        publisher.start().unwrap();
        assert_eq!(publisher.input().unwrap(), b"ping".to_vec());
        publisher.close().unwrap();

        assert!(monitor.iteration_finished());
        assert_eq!(
            monitor.fault_data().unwrap().description,
            "Exited with code 3"
        );

        monitor.iteration_starting(2);
        assert_eq!(publisher.status().get(), ExecutionStatus::Ok);
    }

    #[test]
    fn clean_output_does_not_hide_earlier_crash() {
        let mut publisher = shell(r#"if [ "$(cat)" = boom ]; then exit 3; fi"#, Duration::from_secs(5));
        publisher.output(b"boom").unwrap();
        publisher.output(b"fine").unwrap();
        assert_eq!(
            publisher.status().get(),
            ExecutionStatus::Crash("Exited with code 3".into())
        );
    }

    #[test]
    fn target_ignoring_large_stdin_still_times_out() {
        let mut publisher = shell("exec sleep 5", Duration::from_millis(200));
        let started = Instant::now();
        publisher.output(&vec![b'A'; 1 << 20]).unwrap();
        assert_eq!(publisher.status().get(), ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn hung_target_is_killed() {
        let mut publisher = shell("exec sleep 5", Duration::from_millis(100));
        publisher.output(b"").unwrap();
        assert_eq!(publisher.status().get(), ExecutionStatus::Timeout);
    }

    #[test]
    fn file_delivery_substitutes_path() {
        let mut publisher = CommandPublisher::new(
            "cmd",
            CommandPublisherConfig {
                command: vec!["/bin/cat".into()],
                input_delivery: InputDelivery::File("{}".into()),
                timeout: Duration::from_secs(5),
                working_dir: None,
            },
            SharedStatus::default(),
        );
        publisher.output(b"from-file").unwrap();
        assert_eq!(publisher.input().unwrap(), b"from-file".to_vec());
    }

    #[test]
    fn missing_binary_is_a_transport_error() {
        let mut publisher = CommandPublisher::new(
            "cmd",
            CommandPublisherConfig {
                command: vec!["./this_command_does_not_exist_ever_12345.sh".into()],
                input_delivery: InputDelivery::StdIn,
                timeout: Duration::from_secs(1),
                working_dir: None,
            },
            SharedStatus::default(),
        );
        assert!(matches!(
            publisher.output(b""),
            Err(PublisherError::Transport(msg)) if msg.contains("Failed to spawn command")
        ));
    }
}
