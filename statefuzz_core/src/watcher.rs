use tracing::{debug, trace};

/// A `Watcher` is notified as the state machine walks through a run.
///
/// Every hook has a no-op default so implementations only override what they need.
/// Watchers observe; they cannot alter control flow.
pub trait Watcher: Send {
    fn state_model_starting(&mut self, _model: &str, _iteration: u64) {}

    fn state_model_finished(&mut self, _model: &str, _iteration: u64) {}

    fn state_starting(&mut self, _state: &str) {}

    fn state_finished(&mut self, _state: &str) {}

    fn state_changing(&mut self, _from: &str, _to: &str) {}

    fn action_starting(&mut self, _action: &str) {}

    /// `ok` is `false` when the action ended in an error.
    fn action_finished(&mut self, _action: &str, _ok: bool) {}
}

/// Fans every notification out to the registered watchers, in registration order.
#[derive(Default)]
pub struct Watchers {
    inner: Vec<Box<dyn Watcher>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, watcher: Box<dyn Watcher>) {
        self.inner.push(watcher);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Watcher for Watchers {
    fn state_model_starting(&mut self, model: &str, iteration: u64) {
        self.inner
            .iter_mut()
            .for_each(|w| w.state_model_starting(model, iteration));
    }

    fn state_model_finished(&mut self, model: &str, iteration: u64) {
        self.inner
            .iter_mut()
            .for_each(|w| w.state_model_finished(model, iteration));
    }

    fn state_starting(&mut self, state: &str) {
        self.inner.iter_mut().for_each(|w| w.state_starting(state));
    }

    fn state_finished(&mut self, state: &str) {
        self.inner.iter_mut().for_each(|w| w.state_finished(state));
    }

    fn state_changing(&mut self, from: &str, to: &str) {
        self.inner
            .iter_mut()
            .for_each(|w| w.state_changing(from, to));
    }

    fn action_starting(&mut self, action: &str) {
        self.inner.iter_mut().for_each(|w| w.action_starting(action));
    }

    fn action_finished(&mut self, action: &str, ok: bool) {
        self.inner
            .iter_mut()
            .for_each(|w| w.action_finished(action, ok));
    }
}

/// Emits state machine progress as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWatcher;

impl Watcher for LogWatcher {
    fn state_model_starting(&mut self, model: &str, iteration: u64) {
        debug!(model, iteration, "state model starting");
    }

    fn state_starting(&mut self, state: &str) {
        trace!(state, "state starting");
    }

    fn state_changing(&mut self, from: &str, to: &str) {
        debug!(from, to, "state change");
    }

    fn action_finished(&mut self, action: &str, ok: bool) {
        trace!(action, ok, "action finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Watcher for Recorder {
        fn state_starting(&mut self, state: &str) {
            self.0.lock().unwrap().push(format!("state:{state}"));
        }

        fn state_changing(&mut self, from: &str, to: &str) {
            self.0.lock().unwrap().push(format!("{from}->{to}"));
        }
    }

    #[test]
    fn fan_out_reaches_every_watcher_in_order() {
        let first = Recorder::default();
        let second = Recorder::default();
        let mut watchers = Watchers::new();
        watchers.add(Box::new(first.clone()));
        watchers.add(Box::new(LogWatcher));
        watchers.add(Box::new(second.clone()));
        assert_eq!(watchers.len(), 3);

        watchers.state_starting("Initial");
        watchers.state_changing("Initial", "Next");
        watchers.action_finished("send", true);

        let expected = vec!["state:Initial".to_string(), "Initial->Next".to_string()];
        assert_eq!(*first.0.lock().unwrap(), expected);
        assert_eq!(*second.0.lock().unwrap(), expected);
    }
}
