//! Ordered step execution with reverse-order cleanup.
//!
//! A [`Pipeline`] runs its steps one after another against a shared state.
//! The first step that halts stops forward progress; cancellation is checked
//! between steps. Afterwards every step whose forward action began is
//! cleaned up in reverse order, whatever the outcome, so resources created
//! along the way are always released. Cleanup problems are collected as
//! [`CleanupWarning`]s and never start another unwind.

use std::future::{Future, ready};
use std::pin::Pin;

use tracing::{info, warn};

use crate::cancel::CancelLatch;

/// Future returned by [`Step::run`].
pub type StepFuture<'a, E> = Pin<Box<dyn Future<Output = StepAction<E>> + Send + 'a>>;

/// Future returned by [`Step::cleanup`]; resolves to the problems met while
/// tearing down, empty when everything was released.
pub type CleanupFuture<'a> = Pin<Box<dyn Future<Output = Vec<String>> + Send + 'a>>;

/// What a forward action asks the runner to do next.
#[derive(Debug, Eq, PartialEq)]
pub enum StepAction<E> {
    /// Proceed to the next step.
    Continue,
    /// Stop and unwind with `E`.
    Halt(E),
}

/// Why cleanup is running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Unwind {
    /// Every step completed.
    Completed,
    /// A step halted.
    Halted,
    /// The cancellation latch was set.
    Cancelled,
}

impl Unwind {
    /// Returns `true` when the run did not complete.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// One pipeline stage.
pub trait Step<S: Send, E: Send>: Send {
    /// Short name used in logs and outcome records.
    fn name(&self) -> &'static str;

    /// Forward action.
    fn run<'a>(&'a mut self, state: &'a mut S) -> StepFuture<'a, E>;

    /// Compensating action. Runs once for every step whose forward action
    /// began and must only touch what the step itself created.
    fn cleanup<'a>(&'a mut self, _state: &'a mut S, _unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(ready(Vec::new()))
    }
}

/// Per-step progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepStatus {
    /// The forward action never started.
    NotRun,
    /// The forward action is in progress.
    Running,
    /// The forward action returned [`StepAction::Continue`].
    Completed,
    /// The forward action halted.
    Failed,
    /// The forward action halted while cancellation was requested.
    Cancelled,
}

/// Final status of a step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepRecord {
    /// Step name.
    pub name: &'static str,
    /// Status after the run.
    pub status: StepStatus,
}

/// Problem met while cleaning up a step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupWarning {
    /// Step whose cleanup reported the problem.
    pub step: &'static str,
    /// Human readable description.
    pub message: String,
}

/// How the forward pass ended.
#[derive(Debug, Eq, PartialEq)]
pub enum PipelineStatus<E> {
    /// Every step completed.
    Completed,
    /// A step halted with an error.
    Halted(E),
    /// Cancellation stopped the run, possibly interrupting a step that then
    /// halted with the carried error.
    Cancelled(Option<E>),
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct PipelineOutcome<E> {
    /// Forward pass result.
    pub status: PipelineStatus<E>,
    /// Status of every step, in pipeline order.
    pub steps: Vec<StepRecord>,
    /// Names of the steps cleaned up, in the order cleanup ran.
    pub cleanup_order: Vec<&'static str>,
    /// Problems reported by cleanups.
    pub warnings: Vec<CleanupWarning>,
}

/// Fixed sequence of steps sharing state `S` and failing with `E`.
pub struct Pipeline<S, E> {
    steps: Vec<Box<dyn Step<S, E>>>,
}

impl<S: Send, E: Send> Default for Pipeline<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send, E: Send> Pipeline<S, E> {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Appends a step.
    pub fn push(&mut self, step: impl Step<S, E> + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Names of the steps, in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs the forward pass and then unwinds.
    pub async fn run(&mut self, state: &mut S, cancel: &CancelLatch) -> PipelineOutcome<E> {
        let mut records: Vec<StepRecord> = self
            .steps
            .iter()
            .map(|step| StepRecord {
                name: step.name(),
                status: StepStatus::NotRun,
            })
            .collect();
        let mut started = 0_usize;
        let mut status = PipelineStatus::Completed;

        for (step, record) in self.steps.iter_mut().zip(records.iter_mut()) {
            if cancel.is_cancelled() {
                info!(step = record.name, "cancelled before step");
                status = PipelineStatus::Cancelled(None);
                break;
            }
            record.status = StepStatus::Running;
            started += 1;
            info!(step = record.name, "running step");
            match step.run(state).await {
                StepAction::Continue => record.status = StepStatus::Completed,
                StepAction::Halt(err) => {
                    if cancel.is_cancelled() {
                        record.status = StepStatus::Cancelled;
                        status = PipelineStatus::Cancelled(Some(err));
                    } else {
                        record.status = StepStatus::Failed;
                        status = PipelineStatus::Halted(err);
                    }
                    break;
                }
            }
        }

        let unwind = match status {
            PipelineStatus::Completed => Unwind::Completed,
            PipelineStatus::Halted(_) => Unwind::Halted,
            PipelineStatus::Cancelled(_) => Unwind::Cancelled,
        };

        let mut cleanup_order = Vec::with_capacity(started);
        let mut warnings = Vec::new();
        for step in self.steps.iter_mut().take(started).rev() {
            let name = step.name();
            cleanup_order.push(name);
            for message in step.cleanup(state, unwind).await {
                warn!(step = name, %message, "cleanup problem");
                warnings.push(CleanupWarning { step: name, message });
            }
        }

        PipelineOutcome {
            status,
            steps: records,
            cleanup_order,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests;
