//! Declarative saga definitions.
//!
//! ```rust,ignore
//! let definition = SagaBuilder::<OrderData>::new("order")
//!     .initial_state("Initial")
//!     .state("Initial", |s| {
//!         s.when("OrderCreated", |r| r.transition_to("PaymentPending"))
//!     })
//!     .state("PaymentPending", |s| {
//!         s.compensation_fn("Refund", |data| { data.refunded = true; Ok(()) })
//!             .when("PaymentProcessed", |r| r.transition_to("Complete").finalize())
//!     })
//!     .build()?;
//! ```

use async_trait::async_trait;
use herald_common::{HeraldError, Message, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Bounds required of saga-local data.
pub trait SagaData:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

impl<T> SagaData for T where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

/// Mutable view handed to a rule's action: the saga-local data plus the
/// ability to register extra compensations by name.
pub struct SagaContext<'a, D> {
    pub data: &'a mut D,
    pub(crate) pending_compensations: Vec<String>,
}

impl<'a, D> SagaContext<'a, D> {
    /// Push a compensation registered in the definition onto the instance
    /// stack when the surrounding transition commits.
    pub fn push_compensation(&mut self, name: impl Into<String>) {
        self.pending_compensations.push(name.into());
    }
}

/// Side effect run when a transition rule fires.
#[async_trait]
pub trait SagaAction<D: SagaData>: Send + Sync {
    async fn run(&self, ctx: &mut SagaContext<'_, D>, event: &Message) -> Result<()>;
}

/// Undo action for one step, executed during a compensation run.
#[async_trait]
pub trait Compensation<D: SagaData>: Send + Sync {
    async fn compensate(&self, data: &mut D) -> Result<()>;
}

struct FnAction<F>(F);

#[async_trait]
impl<D, F> SagaAction<D> for FnAction<F>
where
    D: SagaData,
    F: Fn(&mut SagaContext<'_, D>, &Message) -> Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut SagaContext<'_, D>, event: &Message) -> Result<()> {
        (self.0)(ctx, event)
    }
}

struct FnCompensation<F>(F);

#[async_trait]
impl<D, F> Compensation<D> for FnCompensation<F>
where
    D: SagaData,
    F: Fn(&mut D) -> Result<()> + Send + Sync,
{
    async fn compensate(&self, data: &mut D) -> Result<()> {
        (self.0)(data)
    }
}

type Guard<D> = Arc<dyn Fn(&D, &Message) -> bool + Send + Sync>;

pub(crate) struct Branch<D: SagaData> {
    pub then: Option<Arc<dyn SagaAction<D>>>,
    pub target: String,
    pub finalize: bool,
}

pub(crate) struct TransitionRule<D: SagaData> {
    pub event_type: String,
    pub guard: Option<Guard<D>>,
    pub branch: Branch<D>,
    /// Taken when the guard evaluates false.
    pub otherwise: Option<Branch<D>>,
}

pub(crate) struct StateDefinition<D: SagaData> {
    pub rules: Vec<TransitionRule<D>>,
    pub compensation: Option<String>,
    pub timeout: Option<Duration>,
}

/// Immutable, validated saga shape shared by every instance.
pub struct SagaDefinition<D: SagaData> {
    name: String,
    initial_state: String,
    states: HashMap<String, StateDefinition<D>>,
    compensations: HashMap<String, Arc<dyn Compensation<D>>>,
}

impl<D: SagaData> SagaDefinition<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub(crate) fn state(&self, name: &str) -> Option<&StateDefinition<D>> {
        self.states.get(name)
    }

    pub(crate) fn compensation(&self, name: &str) -> Option<Arc<dyn Compensation<D>>> {
        self.compensations.get(name).cloned()
    }

    pub fn has_compensation(&self, name: &str) -> bool {
        self.compensations.contains_key(name)
    }

    /// Timeout of a state, when one is declared.
    pub fn timeout_of(&self, state: &str) -> Option<Duration> {
        self.states.get(state).and_then(|s| s.timeout)
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SagaBuilder<D: SagaData> {
    name: String,
    initial_state: Option<String>,
    states: Vec<(String, StateBuilder<D>)>,
}

impl<D: SagaData> SagaBuilder<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_state: None,
            states: Vec::new(),
        }
    }

    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    /// Declare a state. Rules are evaluated in declaration order.
    pub fn state(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(StateBuilder<D>) -> StateBuilder<D>,
    ) -> Self {
        let name = name.into();
        self.states.push((name, configure(StateBuilder::new())));
        self
    }

    pub fn build(self) -> Result<SagaDefinition<D>> {
        let initial_state = self.initial_state.ok_or_else(|| {
            HeraldError::Validation(format!("saga '{}' declares no initial state", self.name))
        })?;

        let mut states = HashMap::new();
        let mut compensations: HashMap<String, Arc<dyn Compensation<D>>> = HashMap::new();
        for (name, builder) in self.states {
            if states.contains_key(&name) {
                return Err(HeraldError::Validation(format!(
                    "saga '{}' declares state '{}' twice",
                    self.name, name
                )));
            }
            let (definition, compensation) = builder.build(&self.name, &name)?;
            if let Some((comp_name, action)) = compensation {
                compensations.insert(comp_name, action);
            }
            states.insert(name, definition);
        }

        if !states.contains_key(&initial_state) {
            return Err(HeraldError::Validation(format!(
                "saga '{}' initial state '{}' is not declared",
                self.name, initial_state
            )));
        }

        // Every transition must land on a declared state or finalize there.
        for (name, state) in &states {
            for rule in &state.rules {
                for branch in
                    std::iter::once(&rule.branch).chain(rule.otherwise.as_ref())
                {
                    if !branch.finalize && !states.contains_key(&branch.target) {
                        return Err(HeraldError::Validation(format!(
                            "saga '{}' state '{}' transitions to undeclared state '{}'",
                            self.name, name, branch.target
                        )));
                    }
                }
            }
        }

        Ok(SagaDefinition {
            name: self.name,
            initial_state,
            states,
            compensations,
        })
    }
}

pub struct StateBuilder<D: SagaData> {
    rules: Vec<(String, RuleBuilder<D>)>,
    compensation: Option<(String, Arc<dyn Compensation<D>>)>,
    timeout: Option<Duration>,
}

impl<D: SagaData> StateBuilder<D> {
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            compensation: None,
            timeout: None,
        }
    }

    /// Register this state's compensation. It is pushed onto the instance
    /// stack whenever the state is entered.
    pub fn compensation<C>(mut self, name: impl Into<String>, action: C) -> Self
    where
        C: Compensation<D> + 'static,
    {
        self.compensation = Some((name.into(), Arc::new(action)));
        self
    }

    pub fn compensation_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut D) -> Result<()> + Send + Sync + 'static,
    {
        self.compensation(name, FnCompensation(f))
    }

    /// Fail the instance when no rule fires within the window.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare a transition rule for an event type.
    pub fn when(
        mut self,
        event_type: impl Into<String>,
        configure: impl FnOnce(RuleBuilder<D>) -> RuleBuilder<D>,
    ) -> Self {
        self.rules
            .push((event_type.into(), configure(RuleBuilder::new())));
        self
    }

    fn build(
        self,
        saga: &str,
        state: &str,
    ) -> Result<(StateDefinition<D>, Option<(String, Arc<dyn Compensation<D>>)>)> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for (event_type, rule) in self.rules {
            rules.push(rule.build(saga, state, event_type)?);
        }
        Ok((
            StateDefinition {
                rules,
                compensation: self.compensation.as_ref().map(|(name, _)| name.clone()),
                timeout: self.timeout,
            },
            self.compensation,
        ))
    }
}

pub struct RuleBuilder<D: SagaData> {
    guard: Option<Guard<D>>,
    then: Option<Arc<dyn SagaAction<D>>>,
    target: Option<String>,
    finalize: bool,
    otherwise_then: Option<Arc<dyn SagaAction<D>>>,
    otherwise_target: Option<String>,
    otherwise_finalize: bool,
    _marker: PhantomData<fn() -> D>,
}

impl<D: SagaData> RuleBuilder<D> {
    fn new() -> Self {
        Self {
            guard: None,
            then: None,
            target: None,
            finalize: false,
            otherwise_then: None,
            otherwise_target: None,
            otherwise_finalize: false,
            _marker: PhantomData,
        }
    }

    /// Fire only when the predicate holds; otherwise the else branch (when
    /// declared) or the next rule is tried.
    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&D, &Message) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(predicate));
        self
    }

    pub fn then<A>(mut self, action: A) -> Self
    where
        A: SagaAction<D> + 'static,
    {
        self.then = Some(Arc::new(action));
        self
    }

    pub fn then_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut SagaContext<'_, D>, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.then(FnAction(f))
    }

    pub fn transition_to(mut self, state: impl Into<String>) -> Self {
        self.target = Some(state.into());
        self
    }

    /// Mark the transition target terminal: entering it completes the saga.
    pub fn finalize(mut self) -> Self {
        self.finalize = true;
        self
    }

    pub fn otherwise_then_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SagaContext<'_, D>, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.otherwise_then = Some(Arc::new(FnAction(f)));
        self
    }

    pub fn otherwise_transition_to(mut self, state: impl Into<String>) -> Self {
        self.otherwise_target = Some(state.into());
        self
    }

    pub fn otherwise_finalize(mut self) -> Self {
        self.otherwise_finalize = true;
        self
    }

    fn build(self, saga: &str, state: &str, event_type: String) -> Result<TransitionRule<D>> {
        let target = self.target.ok_or_else(|| {
            HeraldError::Validation(format!(
                "saga '{}' state '{}' rule for '{}' has no transition target",
                saga, state, event_type
            ))
        })?;
        let otherwise = match (self.otherwise_target, self.otherwise_then) {
            (Some(target), then) => Some(Branch {
                then,
                target,
                finalize: self.otherwise_finalize,
            }),
            (None, Some(_)) => {
                return Err(HeraldError::Validation(format!(
                    "saga '{}' state '{}' rule for '{}' has an else action but no else target",
                    saga, state, event_type
                )))
            }
            (None, None) => None,
        };
        if otherwise.is_some() && self.guard.is_none() {
            return Err(HeraldError::Validation(format!(
                "saga '{}' state '{}' rule for '{}' has an else branch but no guard",
                saga, state, event_type
            )));
        }
        Ok(TransitionRule {
            event_type,
            guard: self.guard,
            branch: Branch {
                then: self.then,
                target,
                finalize: self.finalize,
            },
            otherwise,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Data {
        total: u32,
    }

    #[test]
    fn builder_validates_initial_state() {
        let result = SagaBuilder::<Data>::new("s")
            .state("Only", |s| s.when("E", |r| r.transition_to("Only")))
            .build();
        assert!(matches!(result, Err(HeraldError::Validation(_))));
    }

    #[test]
    fn builder_rejects_undeclared_targets() {
        let result = SagaBuilder::<Data>::new("s")
            .initial_state("A")
            .state("A", |s| s.when("E", |r| r.transition_to("Missing")))
            .build();
        assert!(matches!(result, Err(HeraldError::Validation(_))));
    }

    #[test]
    fn finalizing_targets_need_no_declaration() {
        let definition = SagaBuilder::<Data>::new("s")
            .initial_state("A")
            .state("A", |s| s.when("E", |r| r.transition_to("Done").finalize()))
            .build()
            .unwrap();
        assert_eq!(definition.initial_state(), "A");
        assert!(definition.state("A").is_some());
        assert!(definition.state("Done").is_none());
    }

    #[test]
    fn else_branch_requires_a_guard() {
        let result = SagaBuilder::<Data>::new("s")
            .initial_state("A")
            .state("A", |s| {
                s.when("E", |r| {
                    r.transition_to("A").otherwise_transition_to("A")
                })
            })
            .build();
        assert!(matches!(result, Err(HeraldError::Validation(_))));
    }

    #[test]
    fn compensations_are_registered_by_name() {
        let definition = SagaBuilder::<Data>::new("s")
            .initial_state("A")
            .state("A", |s| {
                s.compensation_fn("Undo", |_data| Ok(()))
                    .when("E", |r| r.transition_to("A"))
            })
            .build()
            .unwrap();
        assert!(definition.has_compensation("Undo"));
        assert!(!definition.has_compensation("Other"));
    }
}
