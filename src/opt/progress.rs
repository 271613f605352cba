//! Progress reporting shared by the search loops

use std::fmt;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// Why a search loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every step of the budget was spent
    BudgetExhausted,
    /// The time limit passed
    Deadline,
    /// Too many steps in a row without a better plan
    NoImprovement,
    /// Nothing was left to try
    Exhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::BudgetExhausted => "budget spent",
            StopReason::Deadline => "time limit",
            StopReason::NoImprovement => "no improvement",
            StopReason::Exhausted => "no candidates left",
        };
        f.write_str(text)
    }
}

/// Where a search currently stands
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Steps done so far
    pub step: usize,
    pub budget: usize,
    /// Cheapest plan so far; infinite until one is feasible
    pub best_cost: f32,
    /// Search-specific state, e.g. memo statistics or the temperature
    pub detail: Option<String>,
}

impl ProgressState {
    pub fn new(step: usize, budget: usize, best_cost: f32) -> Self {
        Self {
            step,
            budget,
            best_cost,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// One-line summary next to the bar
    pub fn message(&self) -> String {
        let best = if self.best_cost.is_finite() {
            format!("best {:.3e}", self.best_cost)
        } else {
            "no feasible plan yet".to_string()
        };
        match &self.detail {
            Some(detail) => format!("{} | {}", best, detail),
            None => best,
        }
    }
}

/// Summary handed over when a search ends
#[derive(Debug, Clone)]
pub struct FinishInfo {
    pub elapsed: Duration,
    pub steps: usize,
    pub budget: usize,
    pub reason: StopReason,
    /// `None` when no plan was feasible
    pub best_cost: Option<f32>,
    /// e.g. "Graph search"
    pub task_name: String,
}

impl FinishInfo {
    pub fn new(
        elapsed: Duration,
        steps: usize,
        budget: usize,
        reason: StopReason,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            elapsed,
            steps,
            budget,
            reason,
            best_cost: None,
            task_name: task_name.into(),
        }
    }

    pub fn with_best_cost(mut self, cost: f32) -> Self {
        self.best_cost = cost.is_finite().then_some(cost);
        self
    }

    /// Stopped before spending its budget
    pub fn converged(&self) -> bool {
        self.reason != StopReason::BudgetExhausted
    }

    fn summary(&self, elapsed: Duration) -> String {
        let outcome = match self.best_cost {
            Some(cost) => format!("best {:.3e}", cost),
            None => "no feasible plan".to_string(),
        };
        format!(
            "{} in {}: {} after {}/{} steps ({})",
            self.task_name,
            format_duration(elapsed),
            outcome,
            self.steps,
            self.budget,
            self.reason
        )
    }
}

/// Receives progress events from a search loop.
///
/// # Example
///
/// ```ignore
/// let mut progress = IndicatifProgress::new();
/// progress.start(100, "Local search");
/// for step in 0..100 {
///     progress.update(&ProgressState::new(step + 1, 100, best_cost));
/// }
/// progress.finish(&FinishInfo::new(elapsed, 100, 100, StopReason::BudgetExhausted, "Local search"));
/// ```
pub trait SearchProgress: Send {
    fn start(&mut self, budget: usize, task_name: &str);

    fn update(&mut self, state: &ProgressState);

    fn finish(&mut self, info: &FinishInfo);

    /// The search ended with an error
    fn abort(&mut self);
}

/// Cargo-style progress bar on stderr:
///
/// ```text
///    Searching [======>                 ] 25/100 best 1.2e-3 | memo 340 entries, 1021 hits
///     Finished Graph search in 1.23s: best 1.1e-3 after 50/100 steps (no improvement)
/// ```
pub struct IndicatifProgress {
    pb: Option<ProgressBar>,
    start_time: Option<Instant>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            pb: None,
            start_time: None,
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchProgress for IndicatifProgress {
    fn start(&mut self, budget: usize, task_name: &str) {
        self.start_time = Some(Instant::now());

        let pb = ProgressBar::new(budget as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{prefix:>12.cyan.bold} [{bar:24}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_prefix("Searching");
        pb.set_message(task_name.to_string());
        self.pb = Some(pb);
    }

    fn update(&mut self, state: &ProgressState) {
        if let Some(ref pb) = self.pb {
            pb.set_message(state.message());
            pb.set_position(state.step as u64);
        }
    }

    fn finish(&mut self, info: &FinishInfo) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
            let elapsed = self.start_time.map_or(info.elapsed, |t| t.elapsed());
            eprintln!("{:>12} {}", "\x1b[1;32mFinished\x1b[0m", info.summary(elapsed));
        }
    }

    fn abort(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.abandon();
        }
    }
}

/// Reports nothing; for tests and library callers without a terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl NoOpProgress {
    pub fn new() -> Self {
        Self
    }
}

impl SearchProgress for NoOpProgress {
    fn start(&mut self, _budget: usize, _task_name: &str) {}
    fn update(&mut self, _state: &ProgressState) {}
    fn finish(&mut self, _info: &FinishInfo) {}
    fn abort(&mut self) {}
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}
