use crate::command::{CommandPublisher, SharedStatus};
use crate::config::PublisherSettings;
use crate::data_model::Variant;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Name of the pseudo-publisher that routes `Call` actions to the agent channel
/// instead of a transport.
pub const AGENT_PUBLISHER: &str = "agent";

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Publisher '{publisher}' does not support method '{method}'")]
    UnknownMethod { publisher: String, method: String },

    #[error("Publisher '{publisher}' has no property '{property}'")]
    UnknownProperty { publisher: String, property: String },

    #[error("No publisher class registered as '{0}'")]
    UnknownClass(String),
}

impl From<std::io::Error> for PublisherError {
    fn from(err: std::io::Error) -> Self {
        PublisherError::Transport(err.to_string())
    }
}

/// Transport abstraction the action executor drives.
///
/// Lifecycle calls default to no-ops so simple transports only implement the data
/// path. Every method may fail with a transport-level error, which the executor turns
/// into a soft fault for the current iteration.
pub trait Publisher: Send {
    fn name(&self) -> &str;

    fn set_iteration(&mut self, _iteration: u64) {}

    fn start(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn open(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn accept(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn input(&mut self) -> Result<Vec<u8>, PublisherError>;

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError>;

    fn call(&mut self, method: &str, _args: &[Variant]) -> Result<Option<Variant>, PublisherError> {
        Err(PublisherError::UnknownMethod {
            publisher: self.name().to_string(),
            method: method.to_string(),
        })
    }

    fn get_property(&mut self, property: &str) -> Result<Variant, PublisherError> {
        Err(PublisherError::UnknownProperty {
            publisher: self.name().to_string(),
            property: property.to_string(),
        })
    }

    fn set_property(&mut self, property: &str, _value: &Variant) -> Result<(), PublisherError> {
        Err(PublisherError::UnknownProperty {
            publisher: self.name().to_string(),
            property: property.to_string(),
        })
    }
}

/// Accepts every output and never produces input.
#[derive(Debug)]
pub struct NullPublisher {
    name: String,
    outputs: usize,
}

impl NullPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: 0,
        }
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }
}

impl Publisher for NullPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&mut self) -> Result<Vec<u8>, PublisherError> {
        Ok(Vec::new())
    }

    fn output(&mut self, _data: &[u8]) -> Result<(), PublisherError> {
        self.outputs += 1;
        Ok(())
    }
}

/// The named publishers of one test. The first one added is the primary publisher.
#[derive(Default)]
pub struct Publishers {
    entries: Vec<(String, Box<dyn Publisher>)>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, publisher: Box<dyn Publisher>) -> Self {
        self.add(name, publisher);
        self
    }

    pub fn add(&mut self, name: impl Into<String>, publisher: Box<dyn Publisher>) {
        self.entries.push((name.into(), publisher));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Resolves a publisher by name. `None` and the agent channel resolve to the
    /// primary publisher.
    pub fn resolve(&mut self, name: Option<&str>) -> Option<&mut dyn Publisher> {
        let entry = match name {
            None | Some(AGENT_PUBLISHER) => self.entries.first_mut(),
            Some(wanted) => self.entries.iter_mut().find(|(n, _)| n == wanted),
        };
        entry.map(|(_, publisher)| publisher.as_mut() as &mut dyn Publisher)
    }

    pub fn set_iteration(&mut self, iteration: u64) {
        for (_, publisher) in self.entries.iter_mut() {
            publisher.set_iteration(iteration);
        }
    }

    /// Closes every publisher. Failures are logged and do not stop the sweep.
    pub fn close_all(&mut self) -> usize {
        let mut failures = 0;
        for (name, publisher) in self.entries.iter_mut() {
            if let Err(e) = publisher.close() {
                warn!(publisher = %name, error = %e, "failed to close publisher");
                failures += 1;
            }
        }
        failures
    }
}

/// Handles shared between a publisher and the collaborators that observe it.
#[derive(Debug, Clone, Default)]
pub struct PublisherEnv {
    pub exit_status: SharedStatus,
}

pub type PublisherFactory =
    fn(&str, &PublisherSettings, &PublisherEnv) -> Result<Box<dyn Publisher>, PublisherError>;

/// Name-keyed factory map, populated at startup.
pub struct PublisherRegistry {
    factories: HashMap<String, PublisherFactory>,
}

impl Default for PublisherRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PublisherRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("null", |name, _, _| Ok(Box::new(NullPublisher::new(name))));
        registry.register("command", |name, settings, env| {
            Ok(Box::new(CommandPublisher::from_settings(
                name,
                settings,
                env.exit_status.clone(),
            )?))
        });
        registry
    }

    pub fn register(&mut self, class: impl Into<String>, factory: PublisherFactory) {
        self.factories.insert(class.into(), factory);
    }

    pub fn classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(
        &self,
        name: &str,
        settings: &PublisherSettings,
        env: &PublisherEnv,
    ) -> Result<Box<dyn Publisher>, PublisherError> {
        let factory = self
            .factories
            .get(settings.class.as_str())
            .ok_or_else(|| PublisherError::UnknownClass(settings.class.clone()))?;
        factory(name, settings, env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults_to_primary() {
        let mut publishers = Publishers::new()
            .with("primary", Box::new(NullPublisher::new("primary")))
            .with("side", Box::new(NullPublisher::new("side")));

        assert_eq!(publishers.resolve(None).unwrap().name(), "primary");
        assert_eq!(
            publishers.resolve(Some(AGENT_PUBLISHER)).unwrap().name(),
            "primary"
        );
        assert_eq!(publishers.resolve(Some("side")).unwrap().name(), "side");
        assert!(publishers.resolve(Some("missing")).is_none());
    }

    #[test]
    fn default_call_and_property_are_unsupported() {
        let mut publisher = NullPublisher::new("n");
        assert!(matches!(
            publisher.call("reset", &[]),
            Err(PublisherError::UnknownMethod { .. })
        ));
        assert!(matches!(
            publisher.get_property("mtu"),
            Err(PublisherError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn registry_builds_registered_classes_only() {
        let registry = PublisherRegistry::with_builtins();
        assert_eq!(registry.classes(), vec!["command", "null"]);

        let settings = PublisherSettings {
            class: "null".into(),
            ..PublisherSettings::default()
        };
        let publisher = registry
            .build("main", &settings, &PublisherEnv::default())
            .unwrap();
        assert_eq!(publisher.name(), "main");

        let settings = PublisherSettings {
            class: "tcp".into(),
            ..PublisherSettings::default()
        };
        assert!(matches!(
            registry.build("main", &settings, &PublisherEnv::default()),
            Err(PublisherError::UnknownClass(c)) if c == "tcp"
        ));
    }
}
