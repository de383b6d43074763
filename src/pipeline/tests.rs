//! Unit tests for the step pipeline.

use rstest::rstest;

use super::*;

#[derive(Default)]
struct Journal {
    entries: Vec<String>,
}

struct Recording {
    name: &'static str,
    halt: bool,
    cancel_during: Option<CancelLatch>,
    cleanup_problem: Option<&'static str>,
}

impl Recording {
    fn ok(name: &'static str) -> Self {
        Self {
            name,
            halt: false,
            cancel_during: None,
            cleanup_problem: None,
        }
    }

    fn halting(name: &'static str) -> Self {
        Self {
            halt: true,
            ..Self::ok(name)
        }
    }
}

impl Step<Journal, String> for Recording {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run<'a>(&'a mut self, state: &'a mut Journal) -> StepFuture<'a, String> {
        Box::pin(async move {
            state.entries.push(format!("run:{}", self.name));
            if let Some(latch) = &self.cancel_during {
                latch.cancel();
            }
            if self.halt {
                StepAction::Halt(format!("{} failed", self.name))
            } else {
                StepAction::Continue
            }
        })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut Journal, unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(async move {
            state
                .entries
                .push(format!("cleanup:{}:{unwind:?}", self.name));
            self.cleanup_problem
                .map(|problem| vec![problem.to_owned()])
                .unwrap_or_default()
        })
    }
}

fn pipeline(steps: Vec<Recording>) -> Pipeline<Journal, String> {
    let mut pipeline = Pipeline::new();
    for step in steps {
        pipeline.push(step);
    }
    pipeline
}

#[rstest]
#[tokio::test]
async fn completed_run_still_cleans_up_in_reverse() {
    let mut pipeline = pipeline(vec![Recording::ok("a"), Recording::ok("b"), Recording::ok("c")]);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &CancelLatch::new()).await;

    assert_eq!(outcome.status, PipelineStatus::Completed);
    assert_eq!(outcome.cleanup_order, vec!["c", "b", "a"]);
    assert!(outcome
        .steps
        .iter()
        .all(|record| record.status == StepStatus::Completed));
    assert_eq!(
        journal.entries.last().map(String::as_str),
        Some("cleanup:a:Completed")
    );
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
#[tokio::test]
async fn halting_at_step_k_unwinds_k_to_one(#[case] k: usize) {
    let names = ["s1", "s2", "s3", "s4"];
    let steps = names
        .iter()
        .enumerate()
        .map(|(index, &name)| {
            if index + 1 == k {
                Recording::halting(name)
            } else {
                Recording::ok(name)
            }
        })
        .collect();
    let mut pipeline = pipeline(steps);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &CancelLatch::new()).await;

    let halted = names.get(k - 1).copied().expect("k within range");
    assert_eq!(outcome.status, PipelineStatus::Halted(format!("{halted} failed")));
    let expected: Vec<&str> = names.iter().take(k).rev().copied().collect();
    assert_eq!(outcome.cleanup_order, expected);
    for (index, record) in outcome.steps.iter().enumerate() {
        let expected_status = match (index + 1).cmp(&k) {
            std::cmp::Ordering::Less => StepStatus::Completed,
            std::cmp::Ordering::Equal => StepStatus::Failed,
            std::cmp::Ordering::Greater => StepStatus::NotRun,
        };
        assert_eq!(record.status, expected_status, "step {}", record.name);
    }
    let ran: Vec<&String> = journal
        .entries
        .iter()
        .filter(|entry| entry.starts_with("run:"))
        .collect();
    assert_eq!(ran.len(), k);
    assert!(journal
        .entries
        .iter()
        .filter(|entry| entry.starts_with("cleanup:"))
        .all(|entry| entry.ends_with(":Halted")));
}

#[rstest]
#[tokio::test]
async fn cancellation_between_steps_stops_forward_progress() {
    let latch = CancelLatch::new();
    let mut first = Recording::ok("first");
    first.cancel_during = Some(latch.clone());
    let mut pipeline = pipeline(vec![first, Recording::ok("second")]);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &latch).await;

    assert_eq!(outcome.status, PipelineStatus::Cancelled(None));
    assert_eq!(outcome.cleanup_order, vec!["first"]);
    assert_eq!(
        journal.entries,
        vec![String::from("run:first"), String::from("cleanup:first:Cancelled")]
    );
}

#[rstest]
#[tokio::test]
async fn halt_observed_during_cancellation_is_recorded_as_cancelled() {
    let latch = CancelLatch::new();
    let mut step = Recording::halting("interrupted");
    step.cancel_during = Some(latch.clone());
    let mut pipeline = pipeline(vec![Recording::ok("before"), step]);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &latch).await;

    assert_eq!(
        outcome.status,
        PipelineStatus::Cancelled(Some(String::from("interrupted failed")))
    );
    assert_eq!(
        outcome.steps.last().map(|record| record.status),
        Some(StepStatus::Cancelled)
    );
    assert_eq!(outcome.cleanup_order, vec!["interrupted", "before"]);
}

#[rstest]
#[tokio::test]
async fn cleanup_problems_become_warnings_without_stopping_unwind() {
    let mut noisy = Recording::ok("noisy");
    noisy.cleanup_problem = Some("could not delete key");
    let mut pipeline = pipeline(vec![Recording::ok("first"), noisy, Recording::halting("last")]);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &CancelLatch::new()).await;

    assert_eq!(outcome.cleanup_order, vec!["last", "noisy", "first"]);
    assert_eq!(
        outcome.warnings,
        vec![CleanupWarning {
            step: "noisy",
            message: String::from("could not delete key"),
        }]
    );
}

#[rstest]
#[tokio::test]
async fn pre_cancelled_run_starts_nothing() {
    let latch = CancelLatch::new();
    latch.cancel();
    let mut pipeline = pipeline(vec![Recording::ok("only")]);
    let mut journal = Journal::default();
    let outcome = pipeline.run(&mut journal, &latch).await;

    assert_eq!(outcome.status, PipelineStatus::Cancelled(None));
    assert!(outcome.cleanup_order.is_empty());
    assert!(journal.entries.is_empty());
}
