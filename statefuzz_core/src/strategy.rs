use crate::data_model::{DataModel, DataModelError, ElementKind, NodeId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use tracing::trace;

/// Largest delta added to a leaf by a single mutation.
const MAX_DELTA: u8 = 15;

/// A `MutationStrategy` decides how each Output action's data model is altered before
/// it is sent, and may redirect state transitions.
///
/// The run controller notifies the strategy at the start of every state-model run, so
/// implementations can derive their randomness from the iteration number and replay
/// any iteration deterministically.
pub trait MutationStrategy: Send {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Called before every state-model run.
    ///
    /// # Arguments
    /// * `iteration`: The top-level iteration number.
    /// * `sub_iteration`: Zero for the first run of `iteration`, then counting up for
    ///   each corpus replay of the same iteration.
    fn iteration_starting(&mut self, _iteration: u64, _sub_iteration: u32) {}

    /// Lets the strategy pick a different target when a state requests a change.
    ///
    /// # Arguments
    /// * `requested`: The state named by the ChangeState action.
    /// * `states`: Every state of the running state model, in declaration order.
    ///
    /// # Returns
    /// The name of the state to enter. The default follows the request.
    fn select_state_on_change(&mut self, requested: &str, _states: &[String]) -> String {
        requested.to_string()
    }

    /// Mutates `model` in place right before it is output.
    ///
    /// # Arguments
    /// * `action`: Name of the Output action that owns `model`.
    /// * `model`: The action's working copy.
    /// * `candidate`: The corpus seed the current sub-iteration replays, if any.
    ///
    /// # Errors
    /// Returns a [`DataModelError`] if the model cannot be written.
    fn mutate(
        &mut self,
        action: &str,
        model: &mut DataModel,
        candidate: Option<&DataModel>,
    ) -> Result<(), DataModelError>;
}

/// Sends every model unchanged. Useful for control runs and replay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMutation;

impl MutationStrategy for NoMutation {
    fn name(&self) -> &str {
        "none"
    }

    fn mutate(
        &mut self,
        _action: &str,
        _model: &mut DataModel,
        _candidate: Option<&DataModel>,
    ) -> Result<(), DataModelError> {
        Ok(())
    }
}

/// Adds a small random delta to one random leaf, with wrapping.
///
/// Number leaves are bumped as integers so the value keeps its width; byte leaves get
/// one byte bumped, and an empty byte leaf grows a single byte first.
pub fn mutate_leaf<R: Rng + ?Sized>(
    model: &mut DataModel,
    rng: &mut R,
) -> Result<Option<NodeId>, DataModelError> {
    let leaves = model.leaf_ids();
    if leaves.is_empty() {
        return Ok(None);
    }
    let id = leaves[rng.random_range(0..leaves.len())];
    let delta = rng.random_range(1u8..=MAX_DELTA);

    let current = model.leaf_bytes(id).unwrap_or_default();
    let byte_pick = if current.is_empty() {
        0
    } else {
        rng.random_range(0..current.len())
    };

    model.with_element_mut(id, |element| match &mut element.kind {
        ElementKind::Block { .. } => {}
        ElementKind::Number { size, value, .. } => {
            let bits = u32::from(*size).min(8) * 8;
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            *value = value.wrapping_add(u64::from(delta)) & mask;
        }
        ElementKind::Str { value, .. } => {
            let mut bytes = std::mem::take(value).into_bytes();
            bump_byte(&mut bytes, byte_pick, delta);
            *value = String::from_utf8_lossy(&bytes).into_owned();
        }
        ElementKind::Blob { value, .. } => bump_byte(value, byte_pick, delta),
    })?;
    Ok(Some(id))
}

fn bump_byte(bytes: &mut Vec<u8>, index: usize, delta: u8) {
    if bytes.is_empty() {
        bytes.push(0);
    }
    let index = index.min(bytes.len() - 1);
    bytes[index] = bytes[index].wrapping_add(delta);
}

/// Coverage-guided strategy.
///
/// When the scheduler hands out a candidate for the same data model, the candidate
/// replaces the working copy before mutation, so the corpus is what actually gets
/// explored. The candidate's retention weight then decides whether a second leaf is
/// mutated on top.
#[derive(Debug, Clone)]
pub struct FeedbackStrategy {
    seed: u64,
    rng: ChaCha8Rng,
    state_switch_probability: f64,
}

impl FeedbackStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            state_switch_probability: 0.0,
        }
    }

    /// Probability of jumping to a random state instead of the requested one.
    pub fn with_state_switch_probability(mut self, probability: f64) -> Self {
        self.state_switch_probability = probability.clamp(0.0, 1.0);
        self
    }

    fn iteration_seed(&self, iteration: u64, sub_iteration: u32) -> u64 {
        self.seed
            ^ iteration.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ u64::from(sub_iteration).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
    }
}

impl MutationStrategy for FeedbackStrategy {
    fn name(&self) -> &str {
        "feedback"
    }

    fn iteration_starting(&mut self, iteration: u64, sub_iteration: u32) {
        self.rng = ChaCha8Rng::seed_from_u64(self.iteration_seed(iteration, sub_iteration));
    }

    fn select_state_on_change(&mut self, requested: &str, states: &[String]) -> String {
        if states.is_empty() || self.state_switch_probability <= 0.0 {
            return requested.to_string();
        }
        if self.rng.random_bool(self.state_switch_probability) {
            let pick = &states[self.rng.random_range(0..states.len())];
            trace!(requested, pick = %pick, "state change redirected");
            return pick.clone();
        }
        requested.to_string()
    }

    fn mutate(
        &mut self,
        action: &str,
        model: &mut DataModel,
        candidate: Option<&DataModel>,
    ) -> Result<(), DataModelError> {
        let mut extra_probability = 0.0;
        if let Some(seed) = candidate.filter(|c| c.name() == model.name()) {
            *model = seed.clone();
            model.set_action(action);
            extra_probability = seed.p().unwrap_or(0.0).clamp(0.0, 1.0);
        }

        let mutated = mutate_leaf(model, &mut self.rng)?;
        trace!(action, ?mutated, "leaf mutated");
        if extra_probability > 0.0 && self.rng.random_bool(extra_probability) {
            mutate_leaf(model, &mut self.rng)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> DataModel {
        DataModel::builder("Msg")
            .number("kind", 1, true, 0xff)
            .blob("body", Vec::new())
            .build()
    }

    #[test]
    fn no_mutation_leaves_model_alone() {
        let mut m = model();
        let before = m.value().to_vec();
        NoMutation.mutate("out", &mut m, None).unwrap();
        assert_eq!(m.value(), before.as_slice());
    }

    #[test]
    fn mutate_leaf_changes_value_and_wraps_numbers() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..32 {
            let mut m = model();
            let before = m.value().to_vec();
            mutate_leaf(&mut m, &mut rng).unwrap();
            assert_ne!(m.value(), before.as_slice());
            // the one-byte number never widens
            assert!(m.value().len() <= before.len() + 1);
        }
    }

    #[test]
    fn same_iteration_replays_identically() {
        let mut a = FeedbackStrategy::new(42);
        let mut b = FeedbackStrategy::new(42);
        a.iteration_starting(9, 1);
        b.iteration_starting(9, 1);
        let (mut ma, mut mb) = (model(), model());
        a.mutate("out", &mut ma, None).unwrap();
        b.mutate("out", &mut mb, None).unwrap();
        assert_eq!(ma.value(), mb.value());
    }

    #[test]
    fn matching_candidate_is_adopted() {
        let mut strategy = FeedbackStrategy::new(1);
        strategy.iteration_starting(3, 0);
        let mut candidate = DataModel::builder("Msg")
            .number("kind", 1, true, 0x10)
            .blob("body", vec![0xAA; 8])
            .build();
        candidate.set_action("older");
        let mut working = model();
        strategy
            .mutate("out", &mut working, Some(&candidate))
            .unwrap();
        assert_eq!(working.action(), Some("out"));
        assert_eq!(working.value().len(), 9);

        let other = DataModel::builder("Other").blob("x", vec![1; 20]).build();
        let mut working = model();
        strategy.mutate("out", &mut working, Some(&other)).unwrap();
        assert!(working.value().len() <= 2);
    }

    #[test]
    fn state_switching_respects_probability() {
        let states = vec!["A".to_string(), "B".to_string()];
        let mut never = FeedbackStrategy::new(0);
        for _ in 0..16 {
            assert_eq!(never.select_state_on_change("B", &states), "B");
        }
        let mut always = FeedbackStrategy::new(0).with_state_switch_probability(1.0);
        for _ in 0..16 {
            let pick = always.select_state_on_change("B", &states);
            assert!(states.contains(&pick));
        }
        assert_eq!(always.select_state_on_change("B", &[]), "B");
    }
}
