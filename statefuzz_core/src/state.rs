use crate::action::{Action, ActionError, ActionOutcome, ActionSite};
use crate::context::RunContext;
use crate::state_model::StateScope;
use crate::watcher::Watcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// Every action ran without requesting a state change.
    Finished,
    ChangeState(String),
}

/// A named, ordered list of actions.
#[derive(Debug, Clone)]
pub struct State {
    pub name: String,
    pub actions: Vec<Action>,
    run_count: u32,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            run_count: 0,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn add_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// How often the state was entered in the current iteration.
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub(crate) fn reset_run_count(&mut self) {
        self.run_count = 0;
    }

    /// Runs the actions in order until one requests a state change or fails.
    pub fn run(
        &mut self,
        scope: &mut StateScope<'_>,
        ctx: &mut RunContext,
    ) -> Result<StateOutcome, ActionError> {
        self.run_count += 1;
        ctx.watchers.state_starting(&self.name);

        let site = ActionSite {
            state: &self.name,
            run_count: self.run_count,
        };
        let mut outcome = StateOutcome::Finished;
        for action in self.actions.iter_mut() {
            if let ActionOutcome::ChangeState(target) = action.run(site, scope, ctx)? {
                outcome = StateOutcome::ChangeState(target);
                break;
            }
        }

        ctx.watchers.state_finished(&self.name);
        Ok(outcome)
    }
}
