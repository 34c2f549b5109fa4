//! Ordered step execution with reverse-order compensation.
//!
//! The runner executes steps one after another. Forward progress stops on
//! the first error, on a benign halt, on cancellation or when the build
//! deadline passes. Every step whose `run` started then has its `cleanup`
//! invoked in reverse order, and the same unwind follows a completed run.
//!
//! A running step is never dropped midway: a provider request that already
//! took effect must reach the context so cleanup can undo it. The build
//! deadline is checked between steps here and caps every wait inside a step
//! through [`StepEnv::deadline_after`].

use std::collections::BTreeSet;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cloud::CloudApi;
use crate::context::{BuildContext, ContextField};
use crate::error::{BuildError, CleanupFailure};
use crate::steps::{Step, StepAction, StepEnv, StepName};

/// Raised when a step reads a slot that no earlier step writes.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("step {step} reads {field} but no earlier step writes it")]
pub struct OrderingError {
    /// Step with the unsatisfied read.
    pub step: StepName,
    /// Slot that is never produced in time.
    pub field: ContextField,
}

/// How forward execution ended.
#[derive(Debug)]
pub enum RunOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// Every step ran.
    Completed,
    /// A step asked the build to stop early.
    Halted {
        /// Step that halted.
        step: StepName,
    },
    /// A step failed, or the build was cancelled or timed out before it.
    Failed {
        /// Step that failed or was about to run.
        step: StepName,
        /// Primary cause.
        error: BuildError<E>,
    },
}

/// Everything the runner observed during one build.
#[derive(Debug)]
pub struct RunReport<E>
where
    E: std::error::Error + 'static,
{
    /// Steps whose `run` started, in order.
    pub executed: Vec<StepName>,
    /// How forward execution ended.
    pub outcome: RunOutcome<E>,
    /// Steps whose cleanup also failed, in cleanup order.
    pub cleanup_errors: Vec<CleanupFailure<E>>,
}

/// Ordered list of steps for one build.
pub struct Pipeline<C>
where
    C: CloudApi + Send + Sync,
{
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C> Pipeline<C>
where
    C: CloudApi + Send + Sync,
{
    /// Creates a pipeline running `steps` in order.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step<C>>>) -> Self {
        Self { steps }
    }

    /// Returns the step names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<StepName> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Checks that every slot a step reads is written by an earlier step.
    ///
    /// # Errors
    ///
    /// Returns [`OrderingError`] naming the first unsatisfied read.
    pub fn verify_ordering(&self) -> Result<(), OrderingError> {
        let mut produced = BTreeSet::new();
        for step in &self.steps {
            if let Some(field) = step
                .reads()
                .iter()
                .find(|field| !produced.contains(*field))
            {
                return Err(OrderingError {
                    step: step.name(),
                    field: *field,
                });
            }
            produced.extend(step.writes().iter().copied());
        }
        Ok(())
    }

    /// Runs the steps, then unwinds every executed step in reverse.
    pub async fn run(
        &self,
        ctx: &mut BuildContext,
        env: &StepEnv<'_, C>,
    ) -> RunReport<C::Error> {
        let started = Instant::now();
        let cancel = env.poller.cancel_token();
        let mut executed: Vec<&dyn Step<C>> = Vec::new();
        let mut outcome = RunOutcome::Completed;

        for step in &self.steps {
            let name = step.name();
            if cancel.is_cancelled() {
                outcome = RunOutcome::Failed {
                    step: name,
                    error: BuildError::Cancelled,
                };
                break;
            }
            if env.build_expired() {
                outcome = RunOutcome::Failed {
                    step: name,
                    error: build_timeout(started),
                };
                break;
            }

            executed.push(step.as_ref());
            info!(step = %name, "running step");
            match step.run(ctx, env).await {
                Ok(StepAction::Continue) => {}
                Ok(StepAction::Halt) => {
                    info!(step = %name, "step halted the build");
                    outcome = RunOutcome::Halted { step: name };
                    break;
                }
                Err(err) => {
                    error!(step = %name, error = %err, "step failed");
                    outcome = RunOutcome::Failed {
                        step: name,
                        error: err,
                    };
                    break;
                }
            }
        }

        let mut cleanup_errors = Vec::new();
        for step in executed.iter().rev() {
            if let Err(err) = step.cleanup(ctx, env).await {
                warn!(step = %step.name(), error = %err, "cleanup failed");
                cleanup_errors.push(CleanupFailure {
                    step: step.name(),
                    error: err,
                });
            }
        }

        RunReport {
            executed: executed.iter().map(|step| step.name()).collect(),
            outcome,
            cleanup_errors,
        }
    }
}

fn build_timeout<E>(started: Instant) -> BuildError<E>
where
    E: std::error::Error + 'static,
{
    BuildError::PollTimeout {
        waiting_for: String::from("the build to finish"),
        waited: started.elapsed(),
    }
}
