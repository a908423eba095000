use crate::action::{ActionError, ActionId, BoundModel, DataSet};
use crate::context::RunContext;
use crate::cracker::DataCracker;
use crate::data_model::{DataModel, NodeId};
use crate::state::{State, StateOutcome};
use crate::watcher::Watcher;
use std::fs;
use tracing::{debug, warn};

/// Index of a data model slot in a [`ModelStore`].
pub type SlotId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRole {
    Model,
    Parameter(String),
    Result,
}

/// One data model owned by an action.
///
/// `declared` is the model as written in the state model, `original` the pristine
/// data-bound template prepared before the first iteration, and `working` the copy
/// that actions mutate during an iteration.
#[derive(Debug, Clone)]
pub struct ModelSlot {
    pub owner: ActionId,
    pub role: SlotRole,
    action: String,
    data_set: Option<DataSet>,
    declared: DataModel,
    original: Option<DataModel>,
    working: DataModel,
}

impl ModelSlot {
    pub fn original(&self) -> Option<&DataModel> {
        self.original.as_ref()
    }

    pub fn working(&self) -> &DataModel {
        &self.working
    }

    fn prepare(&mut self, cracker: &dyn DataCracker) -> Result<(), ActionError> {
        let mut model = self.declared.clone();
        if let Some(data_set) = &self.data_set {
            let candidates = data_set.candidates();
            if !candidates.is_empty() {
                let mut last_error = None;
                let mut cracked = false;
                for path in candidates {
                    debug!(action = %self.action, file = ?path, "trying to crack sample");
                    let attempt = fs::read(path)
                        .map_err(|e| e.to_string())
                        .and_then(|bytes| cracker.crack(&mut model, &bytes).map_err(|e| e.to_string()));
                    match attempt {
                        Ok(()) => {
                            cracked = true;
                            break;
                        }
                        Err(e) => {
                            debug!(file = ?path, error = %e, "cracking failed, trying next file");
                            last_error = Some((path, e));
                        }
                    }
                }
                if !cracked {
                    return Err(ActionError::Structural(match (candidates.len(), last_error) {
                        (1, Some((path, e))) => format!(
                            "Failed to crack '{}' into '{}': {}",
                            path.display(),
                            model.name(),
                            e
                        ),
                        _ => format!(
                            "Failed to crack any of the files specified by action '{}'",
                            self.action
                        ),
                    }));
                }
            }
            model.apply_fields(&data_set.fields)?;
        }
        // force the serialized value so every clone starts materialized
        model.value();
        self.original = Some(model);
        Ok(())
    }

    fn reset(&mut self) {
        self.working = self
            .original
            .clone()
            .unwrap_or_else(|| self.declared.clone());
    }
}

/// Arena of every action-owned data model in a state model.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    slots: Vec<ModelSlot>,
}

impl ModelStore {
    pub(crate) fn insert(
        &mut self,
        owner: ActionId,
        role: SlotRole,
        bound: BoundModel,
        action: &str,
    ) -> SlotId {
        let mut declared = bound.model;
        declared.set_action(action);
        self.slots.push(ModelSlot {
            owner,
            role,
            action: action.to_string(),
            data_set: bound.data_set,
            working: declared.clone(),
            declared,
            original: None,
        });
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: SlotId) -> Option<&ModelSlot> {
        self.slots.get(slot)
    }

    pub fn working(&self, slot: SlotId) -> Option<&DataModel> {
        self.slots.get(slot).map(|s| &s.working)
    }

    pub fn working_mut(&mut self, slot: SlotId) -> Result<&mut DataModel, ActionError> {
        self.slots
            .get_mut(slot)
            .map(|s| &mut s.working)
            .ok_or_else(|| ActionError::Structural(format!("Data model slot {slot} does not exist")))
    }

    pub fn original(&self, slot: SlotId) -> Option<&DataModel> {
        self.slots.get(slot).and_then(|s| s.original.as_ref())
    }

    /// Cracks sample data into every slot and snapshots the originals. Stops at the
    /// first slot that cannot be prepared.
    pub fn prepare_all(&mut self, cracker: &dyn DataCracker) -> Result<(), ActionError> {
        for slot in self.slots.iter_mut() {
            slot.prepare(cracker)?;
        }
        Ok(())
    }

    /// Rebinds every working copy to a fresh clone of its original.
    pub fn reset_all(&mut self) {
        self.slots.iter_mut().for_each(ModelSlot::reset);
    }
}

/// Path index over states, actions and their data models.
///
/// Every element is addressed as `State.Action.Model.element...`. Queries may use `*`
/// for exactly one segment and `**` for any number of segments.
#[derive(Debug, Clone, Default)]
pub struct Document {
    states: Vec<String>,
    entries: Vec<(String, SlotId)>,
}

fn glob_match(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| glob_match(rest, &path[skip..])),
        Some((segment, rest)) => match path.split_first() {
            Some((head, tail)) => (*segment == "*" || segment == head) && glob_match(rest, tail),
            None => false,
        },
    }
}

impl Document {
    fn register_state(&mut self, name: &str) {
        self.states.push(name.to_string());
    }

    fn register_slot(&mut self, state: &str, action: &str, slot: SlotId) {
        self.entries.push((format!("{state}.{action}"), slot));
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.iter().any(|s| s == name)
    }

    pub fn state_names(&self) -> &[String] {
        &self.states
    }

    pub fn state_position(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s == name)
    }

    /// Every element matching `pattern`, in document order.
    pub fn select(&self, store: &ModelStore, pattern: &str) -> Vec<(SlotId, NodeId)> {
        let pattern: Vec<&str> = pattern.split('.').collect();
        let mut matches = Vec::new();
        for (prefix, slot) in &self.entries {
            let Some(model) = store.working(*slot) else {
                continue;
            };
            for id in 0..model.len() as NodeId {
                let path = format!("{prefix}.{}", model.full_name(id));
                let segments: Vec<&str> = path.split('.').collect();
                if glob_match(&pattern, &segments) {
                    matches.push((*slot, id));
                }
            }
        }
        matches
    }

    /// Copies the value of the single element selected by `value_path` into every
    /// element selected by `set_path`. Nothing is written unless both selections are
    /// valid. Returns the number of elements written.
    pub fn slurp(
        &self,
        store: &mut ModelStore,
        value_path: &str,
        set_path: &str,
    ) -> Result<usize, ActionError> {
        let source = match self.select(store, value_path).as_slice() {
            [] => {
                return Err(ActionError::Structural(format!(
                    "Slurp value path returned no values [{value_path}]"
                )));
            }
            [single] => *single,
            many => {
                return Err(ActionError::Structural(format!(
                    "Slurp value path returned {} values [{value_path}]",
                    many.len()
                )));
            }
        };
        let value = store
            .working(source.0)
            .and_then(|model| model.leaf_bytes(source.1))
            .ok_or_else(|| {
                ActionError::Structural(format!(
                    "Slurp value path did not select a data element [{value_path}]"
                ))
            })?;

        let targets = self.select(store, set_path);
        if targets.is_empty() {
            return Err(ActionError::Structural(format!(
                "Slurp set path returned no values [{set_path}]"
            )));
        }
        let all_leaves = targets
            .iter()
            .all(|(slot, id)| store.working(*slot).is_some_and(|m| m.is_leaf(*id)));
        if !all_leaves {
            return Err(ActionError::Structural(format!(
                "Slurp set path did not select only data elements [{set_path}]"
            )));
        }

        for (slot, id) in &targets {
            let model = store.working_mut(*slot)?;
            debug!(target = %model.full_name(*id), "slurp");
            model.set_leaf_bytes(*id, &value)?;
        }
        Ok(targets.len())
    }
}

/// The parts of a state model an action may touch while it runs.
pub struct StateScope<'a> {
    pub store: &'a mut ModelStore,
    pub document: &'a Document,
    pub data_actions: &'a mut Vec<ActionId>,
}

/// A named graph of states with one initial state.
#[derive(Debug, Clone)]
pub struct StateModel {
    name: String,
    initial: String,
    states: Vec<State>,
    store: ModelStore,
    document: Document,
    data_actions: Vec<ActionId>,
}

impl StateModel {
    pub fn new(name: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: initial.into(),
            states: Vec::new(),
            store: ModelStore::default(),
            document: Document::default(),
            data_actions: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.add_state(state);
        self
    }

    /// Adds a state and moves its actions' data models into the model store.
    pub fn add_state(&mut self, mut state: State) {
        let state_index = self.states.len();
        self.document.register_state(&state.name);
        for (index, action) in state.actions.iter_mut().enumerate() {
            let id = ActionId {
                state: state_index,
                index,
            };
            let first = self.store.len();
            action.bind_models(id, &mut self.store);
            for slot in first..self.store.len() {
                self.document.register_slot(&state.name, &action.name, slot);
            }
        }
        self.states.push(state);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Data actions executed in the current iteration, in execution order.
    pub fn data_actions(&self) -> &[ActionId] {
        &self.data_actions
    }

    pub fn data_action_count(&self) -> usize {
        self.data_actions.len()
    }

    /// `(action name, serialized working model)` for every executed data action.
    pub fn data_action_values(&self) -> Vec<(String, Vec<u8>)> {
        self.data_actions
            .iter()
            .filter_map(|id| {
                let action = self.states.get(id.state)?.actions.get(id.index)?;
                let slot = action.model_slot().or(action.result_slot())?;
                let model = self.store.working(slot)?;
                Some((action.name.clone(), model.value().to_vec()))
            })
            .collect()
    }

    /// Runs one iteration and returns the names of the states visited, in order.
    ///
    /// Corpus bookkeeping and closing every publisher happen on every exit path.
    pub fn run(&mut self, ctx: &mut RunContext) -> Result<Vec<String>, ActionError> {
        ctx.watchers.state_model_starting(&self.name, ctx.iteration);
        ctx.publishers.set_iteration(ctx.iteration);
        self.data_actions.clear();

        let walked = self.walk(ctx);

        let bookkeeping = ctx
            .scheduler
            .finish_iteration(ctx.iteration, ctx.coverage.as_mut());
        let close_failures = ctx.publishers.close_all();
        if close_failures > 0 {
            debug!(close_failures, "publishers failed to close");
        }
        ctx.watchers.state_model_finished(&self.name, ctx.iteration);

        match (walked, bookkeeping) {
            (Ok(path), Ok(())) => Ok(path),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(bookkeeping)) => {
                warn!(error = %bookkeeping, "corpus bookkeeping failed after an aborted iteration");
                Err(e)
            }
        }
    }

    fn walk(&mut self, ctx: &mut RunContext) -> Result<Vec<String>, ActionError> {
        if ctx.need_data_model {
            self.store.prepare_all(ctx.cracker.as_ref())?;
            ctx.need_data_model = false;
        }
        self.store.reset_all();
        self.states.iter_mut().for_each(State::reset_run_count);

        let mut current = self.document.state_position(&self.initial).ok_or_else(|| {
            ActionError::Structural(format!(
                "Initial state '{}' not found in state model '{}'",
                self.initial, self.name
            ))
        })?;

        let StateModel {
            states,
            store,
            document,
            data_actions,
            ..
        } = self;
        let mut scope = StateScope {
            store,
            document,
            data_actions,
        };
        let mut path = Vec::new();

        loop {
            let state = &mut states[current];
            path.push(state.name.clone());
            let requested = match state.run(&mut scope, ctx)? {
                StateOutcome::Finished => return Ok(path),
                StateOutcome::ChangeState(requested) => requested,
            };

            let target = ctx
                .strategy
                .select_state_on_change(&requested, scope.document.state_names());
            let next = scope.document.state_position(&target).ok_or_else(|| {
                ActionError::Structural(format!(
                    "Unable to locate state '{target}' selected by strategy '{}'",
                    ctx.strategy.name()
                ))
            })?;
            if target == requested {
                debug!(state = %target, "changing to state");
            } else {
                debug!(state = %target, requested = %requested, "changing state mutated");
            }
            ctx.watchers.state_changing(&states[current].name, &target);
            current = next;
        }
    }
}
