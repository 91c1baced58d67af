//! Ordered, named pipeline stages
//!
//! A [`StepSequence`] runs its stages in insertion order against a shared
//! context and stops at the first stage that reports `false`. Stages own
//! their error handling: a stage that catches its own failure and returns
//! `true` counts as a success.

use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Boxed async stage body borrowing the run context
pub type StageFn<C> = Box<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, bool> + Send + Sync>;

/// A stage together with the name it is logged under
pub struct Step<C> {
    name: String,
    run: StageFn<C>,
}

impl<C> Step<C> {
    /// Stage name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<C> std::fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Outcome of one sequence run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    /// Whether every stage returned `true`
    pub success: bool,
    /// Wall time of the whole run
    pub elapsed: Duration,
}

/// Stages executed in order with short-circuit on failure
pub struct StepSequence<C> {
    steps: Vec<Step<C>>,
}

impl<C> Default for StepSequence<C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C: Send> StepSequence<C> {
    /// Empty sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    ///
    /// ```
    /// use audiobook_downloader::converter::steps::StepSequence;
    /// use futures_util::FutureExt;
    ///
    /// let mut steps = StepSequence::<u32>::new();
    /// steps.add("Increment", |n: &mut u32| async move { *n += 1; true }.boxed());
    /// assert_eq!(steps.len(), 1);
    /// ```
    pub fn add<F>(&mut self, name: impl Into<String>, stage: F)
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            run: Box::new(stage),
        });
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no stage was added
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stage names in execution order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    /// Run every stage in order, stopping at the first `false`.
    pub async fn run(&self, ctx: &mut C) -> StepResult {
        let start = Instant::now();

        for step in &self.steps {
            info!(step = %step.name, "Begin step");
            let step_start = Instant::now();
            let ok = (step.run)(&mut *ctx).await;
            debug!(
                step = %step.name,
                success = ok,
                elapsed_ms = step_start.elapsed().as_millis() as u64,
                "End step"
            );

            if !ok {
                return StepResult {
                    success: false,
                    elapsed: start.elapsed(),
                };
            }
        }

        StepResult {
            success: true,
            elapsed: start.elapsed(),
        }
    }
}

impl<C> std::fmt::Debug for StepSequence<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.steps.iter().map(|s| &s.name)).finish()
    }
}
