//! Event application and compensation runs.

use chrono::Utc;
use herald_common::{HeraldError, Message, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::definition::{Branch, SagaContext, SagaData, SagaDefinition};
use crate::instance::SagaInstance;
use crate::store::SagaStore;

/// How a compensation run treats a failing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationStrategy {
    /// Stop at the first error; the remaining stack stays on the instance.
    StopOnFirstError,
    /// Run the whole stack and collect every error.
    ContinueOnError,
}

impl Default for CompensationStrategy {
    fn default() -> Self {
        CompensationStrategy::StopOnFirstError
    }
}

/// Aggregated outcome of a compensation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationReport {
    /// Names executed successfully, in execution (LIFO) order.
    pub executed: Vec<String>,
    /// (name, error) pairs for every failure.
    pub errors: Vec<(String, String)>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Observable result of feeding one event (or a failure) to a saga.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaProgress {
    Transitioned {
        from: String,
        to: String,
    },
    Completed {
        final_state: String,
    },
    Failed {
        reason: String,
        compensation: CompensationReport,
    },
    /// Terminal instance, unmatched event, or a guard that did not hold.
    Ignored,
}

pub struct SagaOrchestrator<D: SagaData> {
    definition: Arc<SagaDefinition<D>>,
    store: Arc<dyn SagaStore<D>>,
    strategy: CompensationStrategy,
}

impl<D: SagaData> SagaOrchestrator<D> {
    pub fn new(definition: Arc<SagaDefinition<D>>, store: Arc<dyn SagaStore<D>>) -> Self {
        Self {
            definition,
            store,
            strategy: CompensationStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: CompensationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn definition(&self) -> &SagaDefinition<D> {
        &self.definition
    }

    /// Apply one event to the instance correlated by `correlation_id`,
    /// creating the instance when the event targets the initial state.
    /// Rules are evaluated in declaration order; the first firing rule wins.
    pub async fn handle_event(
        &self,
        correlation_id: Uuid,
        event: &Message,
    ) -> Result<SagaProgress> {
        let saga_name = self.definition.name();
        let mut instance = match self.store.load(saga_name, correlation_id).await? {
            Some(instance) if instance.is_terminal() => {
                debug!(
                    saga = %saga_name,
                    correlation_id = %correlation_id,
                    event = %event.message_type,
                    "Event ignored by terminal saga"
                );
                return Ok(SagaProgress::Ignored);
            }
            Some(instance) => instance,
            None => {
                let initial = self.definition.initial_state();
                let handles = self
                    .definition
                    .state(initial)
                    .map(|s| s.rules.iter().any(|r| r.event_type == event.message_type))
                    .unwrap_or(false);
                if !handles {
                    return Ok(SagaProgress::Ignored);
                }
                let mut instance =
                    SagaInstance::new(saga_name, correlation_id, initial, D::default());
                if let Some(state) = self.definition.state(initial) {
                    if let Some(compensation) = &state.compensation {
                        instance.compensations.push(compensation.clone());
                    }
                }
                instance
            }
        };

        let state = self
            .definition
            .state(&instance.current_state)
            .ok_or_else(|| {
                HeraldError::fatal(
                    "handle_event",
                    format!("saga {} / {}", saga_name, correlation_id),
                    format!("instance is in undeclared state '{}'", instance.current_state),
                )
            })?;

        let mut fired: Option<(Option<Arc<dyn crate::definition::SagaAction<D>>>, String, bool)> =
            None;
        for rule in &state.rules {
            if rule.event_type != event.message_type {
                continue;
            }
            let branch: Option<&Branch<D>> = match &rule.guard {
                None => Some(&rule.branch),
                Some(guard) if guard(&instance.data, event) => Some(&rule.branch),
                Some(_) => rule.otherwise.as_ref(),
            };
            if let Some(branch) = branch {
                fired = Some((branch.then.clone(), branch.target.clone(), branch.finalize));
                break;
            }
        }

        let Some((action, target, finalize)) = fired else {
            debug!(
                saga = %saga_name,
                correlation_id = %correlation_id,
                state = %instance.current_state,
                event = %event.message_type,
                "No rule fired"
            );
            return Ok(SagaProgress::Ignored);
        };

        // Run the action; an action error fails the saga and compensates.
        let mut registered = Vec::new();
        if let Some(action) = action {
            let mut ctx = SagaContext {
                data: &mut instance.data,
                pending_compensations: Vec::new(),
            };
            if let Err(e) = action.run(&mut ctx, event).await {
                let reason = format!(
                    "action for '{}' in state '{}' failed: {}",
                    event.message_type, instance.current_state, e
                );
                warn!(saga = %saga_name, correlation_id = %correlation_id, error = %e, "Saga action failed");
                return self.fail_instance(instance, &reason).await;
            }
            registered = ctx.pending_compensations;
        }
        for name in &registered {
            if !self.definition.has_compensation(name) {
                return Err(HeraldError::Validation(format!(
                    "action registered unknown compensation '{}'",
                    name
                )));
            }
        }
        instance.compensations.extend(registered);

        let from = instance.current_state.clone();
        let now = Utc::now();
        instance.current_state = target.clone();
        instance.state_entered_at = now;
        instance.updated_at = now;
        if let Some(entered) = self.definition.state(&target) {
            if let Some(compensation) = &entered.compensation {
                instance.compensations.push(compensation.clone());
            }
        }
        if finalize {
            instance.completed = true;
        }
        self.store.save(&instance).await?;

        info!(
            saga = %saga_name,
            correlation_id = %correlation_id,
            from = %from,
            to = %target,
            completed = finalize,
            "Saga advanced"
        );
        Ok(if finalize {
            SagaProgress::Completed { final_state: target }
        } else {
            SagaProgress::Transitioned { from, to: target }
        })
    }

    /// Fail the instance: mark Failed and unwind its compensation stack in
    /// LIFO order. Terminal instances are left untouched.
    pub async fn fail(&self, correlation_id: Uuid, reason: &str) -> Result<SagaProgress> {
        let saga_name = self.definition.name();
        let instance = self
            .store
            .load(saga_name, correlation_id)
            .await?
            .ok_or_else(|| {
                HeraldError::NotFound(format!("saga {} / {}", saga_name, correlation_id))
            })?;
        if instance.is_terminal() {
            return Ok(SagaProgress::Ignored);
        }
        self.fail_instance(instance, reason).await
    }

    async fn fail_instance(
        &self,
        mut instance: SagaInstance<D>,
        reason: &str,
    ) -> Result<SagaProgress> {
        let report = self.run_compensations(&mut instance).await;

        instance.failed = true;
        instance.failure_reason = Some(reason.to_string());
        instance.updated_at = Utc::now();
        self.store.save(&instance).await?;

        if report.is_clean() {
            info!(
                saga = %instance.saga_name,
                correlation_id = %instance.correlation_id,
                reason = %reason,
                compensated = report.executed.len(),
                "Saga failed, compensation complete"
            );
        } else {
            error!(
                saga = %instance.saga_name,
                correlation_id = %instance.correlation_id,
                reason = %reason,
                errors = ?report.errors,
                "Saga failed and compensation reported errors"
            );
        }
        Ok(SagaProgress::Failed {
            reason: reason.to_string(),
            compensation: report,
        })
    }

    async fn run_compensations(&self, instance: &mut SagaInstance<D>) -> CompensationReport {
        let mut report = CompensationReport::default();
        while let Some(name) = instance.compensations.pop() {
            let Some(action) = self.definition.compensation(&name) else {
                report
                    .errors
                    .push((name, "compensation not registered".to_string()));
                if self.strategy == CompensationStrategy::StopOnFirstError {
                    break;
                }
                continue;
            };
            match action.compensate(&mut instance.data).await {
                Ok(()) => report.executed.push(name),
                Err(e) => {
                    report.errors.push((name, e.to_string()));
                    if self.strategy == CompensationStrategy::StopOnFirstError {
                        break;
                    }
                }
            }
        }
        report
    }

    /// Fail every active instance whose state timeout elapsed. Returns the
    /// number of instances failed.
    pub async fn expire_timeouts(&self, limit: usize) -> Result<usize> {
        let active = self.store.list_active(self.definition.name(), limit).await?;
        let now = Utc::now();
        let mut expired = 0;
        for instance in active {
            let Some(timeout) = self.definition.timeout_of(&instance.current_state) else {
                continue;
            };
            let deadline = instance.state_entered_at + to_chrono(timeout);
            if now >= deadline {
                let reason = format!("state '{}' timed out", instance.current_state);
                self.fail(instance.correlation_id, &reason).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
