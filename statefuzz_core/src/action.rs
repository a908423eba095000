use crate::context::RunContext;
use crate::coverage::{CoverageError, wait_for_quiescence};
use crate::cracker::{CrackError, DataCracker};
use crate::data_model::{DataModel, DataModelError, Variant};
use crate::publisher::{AGENT_PUBLISHER, Publisher, PublisherError, Publishers};
use crate::scheduler::SchedulerError;
use crate::state_model::{ModelStore, SlotId, SlotRole, StateScope};
use crate::watcher::Watcher;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// What a single protocol step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Start,
    Stop,
    Open,
    Connect,
    Close,
    Accept,
    Input,
    Output,
    Call,
    GetProperty,
    SetProperty,
    ChangeState,
    Slurp,
    /// A type no handler exists for. Running it stops the whole run.
    Unknown,
}

impl ActionType {
    /// Whether a successful run is recorded in the state model's executed data actions.
    pub fn is_data_action(self) -> bool {
        matches!(
            self,
            ActionType::Input
                | ActionType::Output
                | ActionType::Call
                | ActionType::GetProperty
                | ActionType::SetProperty
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::Start => "start",
            ActionType::Stop => "stop",
            ActionType::Open => "open",
            ActionType::Connect => "connect",
            ActionType::Close => "close",
            ActionType::Accept => "accept",
            ActionType::Input => "input",
            ActionType::Output => "output",
            ActionType::Call => "call",
            ActionType::GetProperty => "getProperty",
            ActionType::SetProperty => "setProperty",
            ActionType::ChangeState => "changeState",
            ActionType::Slurp => "slurp",
            ActionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Position of an action inside its state model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActionId {
    pub state: usize,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    File(PathBuf),
    /// Alternates, tried in order until one cracks.
    Files(Vec<PathBuf>),
    /// No sample file; only field overrides apply.
    Fields,
}

/// Sample data bound to a data model before the first iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    pub source: DataSource,
    pub fields: Vec<(String, Variant)>,
}

impl DataSet {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: DataSource::File(path.into()),
            fields: Vec::new(),
        }
    }

    pub fn files<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            source: DataSource::Files(paths.into_iter().map(Into::into).collect()),
            fields: Vec::new(),
        }
    }

    pub fn fields() -> Self {
        Self {
            source: DataSource::Fields,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, path: impl Into<String>, value: Variant) -> Self {
        self.fields.push((path.into(), value));
        self
    }

    /// Sample files to try, in order.
    pub fn candidates(&self) -> &[PathBuf] {
        match &self.source {
            DataSource::File(path) => std::slice::from_ref(path),
            DataSource::Files(paths) => paths,
            DataSource::Fields => &[],
        }
    }
}

/// A data model together with the data set it is prepared from, before the owning
/// action is added to a state model.
#[derive(Debug, Clone)]
pub(crate) struct BoundModel {
    pub(crate) model: DataModel,
    pub(crate) data_set: Option<DataSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    In,
    Out,
    InOut,
}

/// Argument of a `Call` action. Follows the same original/working discipline as the
/// action's own data model.
#[derive(Debug, Clone)]
pub struct ActionParameter {
    pub name: String,
    pub direction: ParamDirection,
    pending: Option<BoundModel>,
    slot: Option<SlotId>,
}

impl ActionParameter {
    pub fn new(name: impl Into<String>, direction: ParamDirection, model: DataModel) -> Self {
        Self {
            name: name.into(),
            direction,
            pending: Some(BoundModel {
                model,
                data_set: None,
            }),
            slot: None,
        }
    }

    pub fn data(mut self, data_set: DataSet) -> Self {
        if let Some(pending) = self.pending.as_mut() {
            pending.data_set = Some(data_set);
        }
        self
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }
}

/// Read-only view handed to guard and hook expressions.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionScope<'a> {
    pub action: &'a str,
    pub state: &'a str,
    pub state_run_count: u32,
    pub iteration: u64,
}

pub trait Expression: Send + Sync {
    fn evaluate(&self, scope: &ExpressionScope<'_>) -> Variant;
}

impl<F> Expression for F
where
    F: Fn(&ExpressionScope<'_>) -> Variant + Send + Sync,
{
    fn evaluate(&self, scope: &ExpressionScope<'_>) -> Variant {
        self(scope)
    }
}

#[derive(Clone)]
pub struct Script(Arc<dyn Expression>);

impl Script {
    pub fn new(expression: impl Expression + 'static) -> Self {
        Self(Arc::new(expression))
    }

    pub fn evaluate(&self, scope: &ExpressionScope<'_>) -> Variant {
        self.0.evaluate(scope)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Script(..)")
    }
}

/// Where an action is running: the owning state's name and how often it was entered
/// in this iteration.
#[derive(Debug, Clone, Copy)]
pub struct ActionSite<'a> {
    pub state: &'a str,
    pub run_count: u32,
}

/// Recoverable, iteration-scoped failure.
#[derive(Error, Debug)]
pub enum SoftFault {
    #[error("Action '{action}' could not crack data into '{model}': {source}")]
    Crack {
        action: String,
        model: String,
        source: CrackError,
    },

    #[error("Action '{action}' transport failure: {source}")]
    Transport {
        action: String,
        source: PublisherError,
    },

    #[error("Action '{action}' left the target busy: {source}")]
    Hang {
        action: String,
        source: CoverageError,
    },
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Soft fault: {0}")]
    Soft(#[from] SoftFault),

    /// A broken reference in the model, or a path query that selects the wrong nodes.
    #[error("{0}")]
    Structural(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Data model error: {0}")]
    Model(#[from] DataModelError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Coverage oracle error: {0}")]
    Coverage(CoverageError),
}

impl ActionError {
    pub fn is_soft(&self) -> bool {
        matches!(self, ActionError::Soft(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    /// The guard evaluated to something other than `true`.
    Skipped,
    ChangeState(String),
}

/// One step of a state.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub kind: ActionType,
    pub publisher: Option<String>,
    pub when: Option<Script>,
    pub on_start: Option<Script>,
    pub on_complete: Option<Script>,
    /// Target state of a `ChangeState` action.
    pub reference: Option<String>,
    pub method: Option<String>,
    pub property: Option<String>,
    pub value_path: Option<String>,
    pub set_path: Option<String>,
    pub parameters: Vec<ActionParameter>,

    id: ActionId,
    pending_model: Option<BoundModel>,
    pending_result: Option<DataModel>,
    model_slot: Option<SlotId>,
    result_slot: Option<SlotId>,

    started: bool,
    finished: bool,
    error: bool,
}

impl Action {
    pub fn new(name: impl Into<String>, kind: ActionType) -> Self {
        Self {
            name: name.into(),
            kind,
            publisher: None,
            when: None,
            on_start: None,
            on_complete: None,
            reference: None,
            method: None,
            property: None,
            value_path: None,
            set_path: None,
            parameters: Vec::new(),
            id: ActionId::default(),
            pending_model: None,
            pending_result: None,
            model_slot: None,
            result_slot: None,
            started: false,
            finished: false,
            error: false,
        }
    }

    pub fn output(name: impl Into<String>, model: DataModel) -> Self {
        Self::new(name, ActionType::Output).model(model)
    }

    pub fn input(name: impl Into<String>, model: DataModel) -> Self {
        Self::new(name, ActionType::Input).model(model)
    }

    pub fn change_state(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut action = Self::new(name, ActionType::ChangeState);
        action.reference = Some(target.into());
        action
    }

    pub fn call(name: impl Into<String>, method: impl Into<String>) -> Self {
        let mut action = Self::new(name, ActionType::Call);
        action.method = Some(method.into());
        action
    }

    pub fn slurp(
        name: impl Into<String>,
        value_path: impl Into<String>,
        set_path: impl Into<String>,
    ) -> Self {
        let mut action = Self::new(name, ActionType::Slurp);
        action.value_path = Some(value_path.into());
        action.set_path = Some(set_path.into());
        action
    }

    pub fn model(mut self, model: DataModel) -> Self {
        let data_set = self.pending_model.take().and_then(|p| p.data_set);
        self.pending_model = Some(BoundModel { model, data_set });
        self
    }

    /// Binds sample data to the action's data model. Call after [`Action::model`].
    pub fn data(mut self, data_set: DataSet) -> Self {
        if let Some(pending) = self.pending_model.as_mut() {
            pending.data_set = Some(data_set);
        }
        self
    }

    pub fn publisher(mut self, name: impl Into<String>) -> Self {
        self.publisher = Some(name.into());
        self
    }

    pub fn when(mut self, guard: impl Expression + 'static) -> Self {
        self.when = Some(Script::new(guard));
        self
    }

    pub fn on_start(mut self, hook: impl Expression + 'static) -> Self {
        self.on_start = Some(Script::new(hook));
        self
    }

    pub fn on_complete(mut self, hook: impl Expression + 'static) -> Self {
        self.on_complete = Some(Script::new(hook));
        self
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn parameter(mut self, parameter: ActionParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn result(mut self, model: DataModel) -> Self {
        self.pending_result = Some(model);
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn model_slot(&self) -> Option<SlotId> {
        self.model_slot
    }

    pub fn result_slot(&self) -> Option<SlotId> {
        self.result_slot
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn errored(&self) -> bool {
        self.error
    }

    /// Moves every pending data model into `store`, binding the returned slots.
    pub(crate) fn bind_models(&mut self, id: ActionId, store: &mut ModelStore) {
        self.id = id;
        if let Some(bound) = self.pending_model.take() {
            let slot = store.insert(id, SlotRole::Model, bound, &self.name);
            self.model_slot = Some(slot);
        }
        for parameter in self.parameters.iter_mut() {
            if let Some(bound) = parameter.pending.take() {
                let role = SlotRole::Parameter(parameter.name.clone());
                parameter.slot = Some(store.insert(id, role, bound, &self.name));
            }
        }
        if let Some(model) = self.pending_result.take() {
            let bound = BoundModel {
                model,
                data_set: None,
            };
            self.result_slot = Some(store.insert(id, SlotRole::Result, bound, &self.name));
        }
    }

    fn expression_scope<'a>(&'a self, site: ActionSite<'a>, iteration: u64) -> ExpressionScope<'a> {
        ExpressionScope {
            action: &self.name,
            state: site.state,
            state_run_count: site.run_count,
            iteration,
        }
    }

    /// Runs the action once.
    ///
    /// A guard that does not evaluate to `true` skips the action. Output actions
    /// report coverage to the corpus scheduler even when the send itself failed.
    pub fn run(
        &mut self,
        site: ActionSite<'_>,
        scope: &mut StateScope<'_>,
        ctx: &mut RunContext,
    ) -> Result<ActionOutcome, ActionError> {
        trace!(action = %self.name, kind = %self.kind, "run");

        if let Some(guard) = &self.when {
            let value = guard.evaluate(&self.expression_scope(site, ctx.iteration));
            match value.as_bool() {
                Some(true) => {}
                Some(false) => {
                    debug!(action = %self.name, "guard returned false");
                    return Ok(ActionOutcome::Skipped);
                }
                None => {
                    debug!(action = %self.name, %value, "guard did not return a boolean");
                    return Ok(ActionOutcome::Skipped);
                }
            }
        }

        if let Some(name) = self.publisher.as_deref() {
            if name != AGENT_PUBLISHER && !ctx.publishers.contains(name) {
                return Err(ActionError::Structural(format!(
                    "Action '{}' publisher '{}' was not found",
                    self.name, name
                )));
            }
        }

        self.started = true;
        self.finished = false;
        self.error = false;

        ctx.watchers.action_starting(&self.name);
        if let Some(hook) = &self.on_start {
            hook.evaluate(&self.expression_scope(site, ctx.iteration));
        }
        ctx.scheduler.arm_discovery_clock();

        let mut result = self.dispatch(scope, ctx);
        if result.is_ok() && self.kind.is_data_action() {
            scope.data_actions.push(self.id);
        }

        if self.kind == ActionType::Output {
            if let Err(e) = self.record_output(scope, ctx) {
                match &result {
                    Ok(_) => result = Err(e),
                    Err(first) => {
                        warn!(action = %self.name, error = %e, first = %first, "output bookkeeping failed")
                    }
                }
            }
        }

        self.finished = true;
        self.error = result.is_err();

        if let Some(hook) = &self.on_complete {
            hook.evaluate(&self.expression_scope(site, ctx.iteration));
        }
        ctx.watchers.action_finished(&self.name, result.is_ok());
        result
    }

    fn require_model(&self) -> Result<SlotId, ActionError> {
        self.model_slot.ok_or_else(|| {
            ActionError::Structural(format!("Action '{}' has no data model", self.name))
        })
    }

    fn transport(&self) -> impl Fn(PublisherError) -> SoftFault + '_ {
        |source| SoftFault::Transport {
            action: self.name.clone(),
            source,
        }
    }

    fn resolve<'p>(&self, publishers: &'p mut Publishers) -> Result<&'p mut dyn Publisher, ActionError> {
        publishers.resolve(self.publisher.as_deref()).ok_or_else(|| {
            ActionError::Structural(format!(
                "Action '{}' has no publisher to run against",
                self.name
            ))
        })
    }

    fn dispatch(
        &self,
        scope: &mut StateScope<'_>,
        ctx: &mut RunContext,
    ) -> Result<ActionOutcome, ActionError> {
        let transport = self.transport();
        let RunContext {
            publishers,
            agents,
            coverage,
            scheduler,
            strategy,
            cracker,
            ..
        } = ctx;

        match self.kind {
            ActionType::Start => {
                self.resolve(publishers)?.start().map_err(&transport)?;
            }
            ActionType::Stop => {
                let publisher = self.resolve(publishers)?;
                publisher.close().map_err(&transport)?;
                publisher.stop().map_err(&transport)?;
            }
            ActionType::Open | ActionType::Connect => {
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                publisher.open().map_err(&transport)?;
            }
            ActionType::Close => {
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                publisher.close().map_err(&transport)?;
            }
            ActionType::Accept => {
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                publisher.open().map_err(&transport)?;
                publisher.accept().map_err(&transport)?;
            }
            ActionType::Input => {
                let slot = self.require_model()?;
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                publisher.open().map_err(&transport)?;
                let bytes = publisher.input().map_err(&transport)?;
                self.crack_into(scope.store, slot, &bytes, &**cracker)?;
            }
            ActionType::Output => {
                coverage.clear_trace().map_err(ActionError::Coverage)?;
                let slot = self.require_model()?;
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                publisher.open().map_err(&transport)?;
                let working = scope.store.working_mut(slot)?;
                strategy.mutate(&self.name, working, scheduler.current_candidate())?;
                publisher.output(working.value()).map_err(&transport)?;
            }
            ActionType::Call => {
                let method = self.method.as_deref().ok_or_else(|| {
                    ActionError::Structural(format!("Action '{}' names no method", self.name))
                })?;
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                let returned = if self.publisher.as_deref() == Some(AGENT_PUBLISHER) {
                    agents.message("Action.Call", &Variant::Str(method.to_string()))
                } else {
                    let args = self.call_arguments(scope.store)?;
                    publisher.call(method, &args).map_err(&transport)?
                };
                if let (Some(slot), Some(value)) = (self.result_slot, returned) {
                    let bytes = value.to_bytes().ok_or_else(|| {
                        ActionError::Structural(format!(
                            "Unable to convert result of method '{method}' to bytes"
                        ))
                    })?;
                    self.crack_into(scope.store, slot, &bytes, &**cracker)?;
                }
            }
            ActionType::GetProperty => {
                let property = self.require_property()?;
                let slot = self.require_model()?;
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                let value = publisher.get_property(property).map_err(&transport)?;
                match value.to_bytes() {
                    Some(bytes) => self.crack_into(scope.store, slot, &bytes, &**cracker)?,
                    None => {
                        let working = scope.store.working_mut(slot)?;
                        if let Some(&leaf) = working.leaf_ids().first() {
                            working.set_leaf_value(leaf, &value)?;
                        }
                    }
                }
            }
            ActionType::SetProperty => {
                let property = self.require_property()?;
                let slot = self.require_model()?;
                let publisher = self.resolve(publishers)?;
                publisher.start().map_err(&transport)?;
                let value = Variant::Bytes(scope.store.working_mut(slot)?.value().to_vec());
                publisher
                    .set_property(property, &value)
                    .map_err(&transport)?;
            }
            ActionType::ChangeState => {
                let target = self.reference.as_deref().ok_or_else(|| {
                    ActionError::Structural(format!(
                        "Action '{}' names no state to change to",
                        self.name
                    ))
                })?;
                if !scope.document.has_state(target) {
                    return Err(ActionError::Structural(format!(
                        "Unable to locate state '{}' provided to action '{}'",
                        target, self.name
                    )));
                }
                debug!(action = %self.name, target, "changing state");
                return Ok(ActionOutcome::ChangeState(target.to_string()));
            }
            ActionType::Slurp => {
                let (Some(value_path), Some(set_path)) =
                    (self.value_path.as_deref(), self.set_path.as_deref())
                else {
                    return Err(ActionError::Structural(format!(
                        "Slurp action '{}' needs both a value path and a set path",
                        self.name
                    )));
                };
                let copied = scope.document.slurp(scope.store, value_path, set_path)?;
                debug!(action = %self.name, copied, "slurp");
            }
            ActionType::Unknown => {
                return Err(ActionError::Fatal(format!(
                    "Action '{}' fell into the unknown action type handler",
                    self.name
                )));
            }
        }
        Ok(ActionOutcome::Completed)
    }

    fn require_property(&self) -> Result<&str, ActionError> {
        self.property.as_deref().ok_or_else(|| {
            ActionError::Structural(format!("Action '{}' names no property", self.name))
        })
    }

    fn call_arguments(&self, store: &mut ModelStore) -> Result<Vec<Variant>, ActionError> {
        let mut args = Vec::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            let Some(slot) = parameter.slot else {
                continue;
            };
            if parameter.direction == ParamDirection::Out {
                continue;
            }
            args.push(Variant::Bytes(store.working_mut(slot)?.value().to_vec()));
        }
        Ok(args)
    }

    fn crack_into(
        &self,
        store: &mut ModelStore,
        slot: SlotId,
        bytes: &[u8],
        cracker: &dyn DataCracker,
    ) -> Result<(), ActionError> {
        let working = store.working_mut(slot)?;
        cracker.crack(working, bytes).map_err(|source| SoftFault::Crack {
            action: self.name.clone(),
            model: working.name().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Waits for the target to settle, then feeds the coverage verdict for the model
    /// just sent to the corpus scheduler.
    fn record_output(
        &self,
        scope: &mut StateScope<'_>,
        ctx: &mut RunContext,
    ) -> Result<(), ActionError> {
        let hang = match wait_for_quiescence(ctx.coverage.as_mut(), &ctx.quiescence) {
            Ok(_) => None,
            Err(e @ CoverageError::QuiescenceTimeout { .. }) => {
                warn!(action = %self.name, error = %e, "target did not quiesce");
                Some(e)
            }
            Err(e) => return Err(ActionError::Coverage(e)),
        };

        let discovery = ctx.coverage.new_path().map_err(ActionError::Coverage)?;
        let branches = ctx.coverage.branch_count();
        let slot = self.require_model()?;
        let working = scope.store.working_mut(slot)?;
        ctx.scheduler
            .on_output(ctx.iteration, working, discovery, branches)?;

        match hang {
            Some(source) => Err(SoftFault::Hang {
                action: self.name.clone(),
                source,
            }
            .into()),
            None => Ok(()),
        }
    }
}
