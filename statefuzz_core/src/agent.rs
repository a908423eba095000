use crate::command::{ExecutionStatus, SharedStatus};
use crate::data_model::Variant;
use tracing::{debug, info};

/// Evidence collected by a monitor that detected a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultData {
    pub monitor: String,
    pub description: String,
    pub data: Vec<(String, Vec<u8>)>,
}

/// Contract the engine requires of a monitor. Everything has a no-op default so a
/// monitor only implements the hooks it cares about.
pub trait Monitor: Send {
    fn name(&self) -> &str;

    fn iteration_starting(&mut self, _iteration: u64) {}

    /// Returns `true` when the monitor saw a fault during the iteration.
    fn iteration_finished(&mut self) -> bool {
        false
    }

    fn fault_data(&mut self) -> Option<FaultData> {
        None
    }

    fn message(&mut self, _name: &str, _value: &Variant) -> Option<Variant> {
        None
    }
}

/// Fans engine events out to every attached monitor.
#[derive(Default)]
pub struct AgentManager {
    monitors: Vec<Box<dyn Monitor>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, monitor: Box<dyn Monitor>) {
        info!(monitor = monitor.name(), "attached monitor");
        self.monitors.push(monitor);
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn iteration_starting(&mut self, iteration: u64) {
        for monitor in self.monitors.iter_mut() {
            monitor.iteration_starting(iteration);
        }
    }

    /// Finishes the iteration on every monitor and returns the first fault reported.
    pub fn iteration_finished(&mut self) -> Option<FaultData> {
        let mut fault = None;
        for monitor in self.monitors.iter_mut() {
            if monitor.iteration_finished() && fault.is_none() {
                fault = Some(monitor.fault_data().unwrap_or_else(|| FaultData {
                    monitor: monitor.name().to_string(),
                    description: "fault detected".into(),
                    data: Vec::new(),
                }));
            }
        }
        fault
    }

    /// Delivers a message to every monitor and returns the first reply.
    pub fn message(&mut self, name: &str, value: &Variant) -> Option<Variant> {
        debug!(name, %value, "agent message");
        let mut reply = None;
        for monitor in self.monitors.iter_mut() {
            let answer = monitor.message(name, value);
            if reply.is_none() {
                reply = answer;
            }
        }
        reply
    }
}

/// Reports a fault when the command publisher's last run crashed or hung.
pub struct ExitStatusMonitor {
    name: String,
    status: SharedStatus,
    last: ExecutionStatus,
}

impl ExitStatusMonitor {
    pub fn new(name: impl Into<String>, status: SharedStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last: ExecutionStatus::Ok,
        }
    }
}

impl Monitor for ExitStatusMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn iteration_starting(&mut self, _iteration: u64) {
        self.status.set(ExecutionStatus::Ok);
        self.last = ExecutionStatus::Ok;
    }

    fn iteration_finished(&mut self) -> bool {
        self.last = self.status.get();
        self.last.is_fault()
    }

    fn fault_data(&mut self) -> Option<FaultData> {
        let description = match &self.last {
            ExecutionStatus::Crash(desc) => desc.clone(),
            ExecutionStatus::Timeout => "target timed out".to_string(),
            _ => return None,
        };
        Some(FaultData {
            monitor: self.name.clone(),
            description,
            data: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Monitor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn message(&mut self, name: &str, value: &Variant) -> Option<Variant> {
            (name == "Action.Call").then(|| value.clone())
        }
    }

    #[test]
    fn message_returns_first_reply() {
        let mut agents = AgentManager::new();
        agents.add(Box::new(ExitStatusMonitor::new("exit", SharedStatus::default())));
        agents.add(Box::new(Echo));
        let reply = agents.message("Action.Call", &Variant::Str("Reset".into()));
        assert_eq!(reply, Some(Variant::Str("Reset".into())));
        assert_eq!(agents.message("Other", &Variant::Null), None);
    }

    #[test]
    fn exit_status_monitor_reports_crash() {
        let status = SharedStatus::default();
        let mut agents = AgentManager::new();
        agents.add(Box::new(ExitStatusMonitor::new("exit", status.clone())));

        agents.iteration_starting(1);
        assert_eq!(agents.iteration_finished(), None);

        agents.iteration_starting(2);
        status.set(ExecutionStatus::Crash("Terminated by signal 11".into()));
        let fault = agents.iteration_finished().unwrap();
        assert_eq!(fault.monitor, "exit");
        assert_eq!(fault.description, "Terminated by signal 11");

        agents.iteration_starting(3);
        assert_eq!(agents.iteration_finished(), None);
    }
}
