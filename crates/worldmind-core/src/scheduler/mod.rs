//! Wave scheduler: dependency-aware task selection.
//!
//! Computes the next wave of task ids from the task list, the completed
//! set, the execution strategy, and the parallelism cap. An empty wave
//! signals mission convergence. A sliding-window oscillation detector
//! forces convergence when identical waves repeat without progress.

pub mod node;

use std::collections::VecDeque;

use crate::mission::model::{ExecutionStrategy, FailureStrategy, Task, TaskStatus};

/// Compute the next wave.
///
/// A task is ready when it is not completed, every dependency is completed,
/// and it is not a terminal failure. Ordering follows the original planning
/// order; tasks are never reordered across waves.
///
/// - `Sequential`: at most one task, the first ready by planning order.
/// - `Parallel`: the first `max_parallel` ready tasks, stable-ordered.
pub fn next_wave(
    tasks: &[Task],
    completed: &[String],
    strategy: ExecutionStrategy,
    max_parallel: usize,
) -> Vec<String> {
    let cap = max_parallel.max(1);
    let is_completed = |id: &str| completed.iter().any(|c| c == id);

    let ready = tasks.iter().filter(|t| {
        !is_completed(&t.id)
            && !is_excluded(t)
            && t.dependencies.iter().all(|dep| is_completed(dep))
    });

    let take = match strategy {
        ExecutionStrategy::Sequential => 1,
        ExecutionStrategy::Parallel => cap,
    };

    ready.take(take).map(|t| t.id.clone()).collect()
}

/// Whether a task must never be scheduled again.
///
/// Terminal failures are excluded, as is any failed escalate-on-failure
/// task whose retry budget is spent (it can only escalate, never run).
fn is_excluded(task: &Task) -> bool {
    if task.is_terminal_failure() {
        return true;
    }
    task.status == TaskStatus::Failed
        && task.on_failure == FailureStrategy::Escalate
        && task.iteration >= task.max_iterations
}

// ---------------------------------------------------------------------------
// Oscillation detection
// ---------------------------------------------------------------------------

/// Outcome of observing one scheduled wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oscillation {
    /// No repetition observed.
    None,
    /// The window repeated once; the caller should insert a cooldown before
    /// dispatching.
    Repeating,
    /// Repetition crossed the threshold; the caller must emit an empty wave
    /// and converge.
    Detected,
}

/// Sliding-window detector for repeating wave patterns.
///
/// Keeps the last `window` wave fingerprints (sorted id lists). When the two
/// halves of the window are identical and the wave count has passed the
/// threshold, the mission is cycling without progress and must converge.
#[derive(Debug)]
pub struct OscillationDetector {
    window: usize,
    threshold: u32,
    fingerprints: VecDeque<Vec<String>>,
    repeats: u32,
}

impl OscillationDetector {
    /// Create a detector. `window` must be an even number >= 4 (validated at
    /// config load).
    pub fn new(window: usize, threshold: u32) -> Self {
        Self {
            window: window.max(4),
            threshold,
            fingerprints: VecDeque::new(),
            repeats: 0,
        }
    }

    /// Observe a scheduled wave and report whether the schedule oscillates.
    pub fn observe(&mut self, wave: &[String], wave_count: u32) -> Oscillation {
        let mut fingerprint: Vec<String> = wave.to_vec();
        fingerprint.sort_unstable();

        self.fingerprints.push_back(fingerprint);
        while self.fingerprints.len() > self.window {
            self.fingerprints.pop_front();
        }

        if self.fingerprints.len() < self.window {
            return Oscillation::None;
        }

        let half = self.window / 2;
        let halves_match = (0..half).all(|i| self.fingerprints[i] == self.fingerprints[i + half]);

        if !halves_match {
            self.repeats = 0;
            return Oscillation::None;
        }

        self.repeats += 1;
        if wave_count > self.threshold {
            Oscillation::Detected
        } else {
            Oscillation::Repeating
        }
    }

    /// How many consecutive window repetitions have been seen.
    pub fn repeats(&self) -> u32 {
        self.repeats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::model::AgentKind;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, AgentKind::Coder, format!("work for {id}"));
        t.dependencies = deps.iter().map(|d| (*d).to_owned()).collect();
        t
    }

    fn ids(wave: &[String]) -> Vec<&str> {
        wave.iter().map(String::as_str).collect()
    }

    #[test]
    fn only_dependency_free_tasks_are_ready() {
        let tasks = vec![
            task("TASK-001", &[]),
            task("TASK-002", &["TASK-001"]),
            task("TASK-003", &["TASK-001", "TASK-002"]),
        ];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4);
        assert_eq!(ids(&wave), vec!["TASK-001"]);
    }

    #[test]
    fn completed_dependencies_unblock() {
        let tasks = vec![
            task("TASK-001", &[]),
            task("TASK-002", &["TASK-001"]),
            task("TASK-003", &["TASK-001"]),
        ];
        let completed = vec!["TASK-001".to_owned()];

        let wave = next_wave(&tasks, &completed, ExecutionStrategy::Parallel, 4);
        assert_eq!(ids(&wave), vec!["TASK-002", "TASK-003"]);
    }

    #[test]
    fn sequential_emits_single_task() {
        let tasks = vec![task("TASK-001", &[]), task("TASK-002", &[])];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Sequential, 4);
        assert_eq!(ids(&wave), vec!["TASK-001"]);
    }

    #[test]
    fn parallel_respects_cap_with_stable_order() {
        let tasks = vec![
            task("TASK-001", &[]),
            task("TASK-002", &[]),
            task("TASK-003", &[]),
            task("TASK-004", &[]),
        ];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 2);
        assert_eq!(ids(&wave), vec!["TASK-001", "TASK-002"]);
    }

    #[test]
    fn all_completed_yields_empty_wave() {
        let tasks = vec![task("TASK-001", &[])];
        let completed = vec!["TASK-001".to_owned()];

        let wave = next_wave(&tasks, &completed, ExecutionStrategy::Parallel, 4);
        assert!(wave.is_empty());
    }

    #[test]
    fn blocked_by_failed_dependency_yields_empty_wave() {
        let mut failed = task("TASK-001", &[]);
        failed.status = TaskStatus::Failed;
        failed.iteration = failed.max_iterations;
        let tasks = vec![failed, task("TASK-002", &["TASK-001"])];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4);
        assert!(wave.is_empty(), "dependent of a terminal failure never runs");
    }

    #[test]
    fn exhausted_escalate_task_is_never_emitted() {
        let mut t = task("TASK-001", &[]);
        t.status = TaskStatus::Failed;
        t.on_failure = FailureStrategy::Escalate;
        t.iteration = t.max_iterations;
        let tasks = vec![t];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4);
        assert!(wave.is_empty());
    }

    #[test]
    fn failed_task_with_retries_left_is_rescheduled() {
        let mut t = task("TASK-001", &[]);
        t.status = TaskStatus::Failed;
        t.iteration = 1;
        let tasks = vec![t];

        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4);
        assert_eq!(ids(&wave), vec!["TASK-001"]);
    }

    // -- oscillation --------------------------------------------------------

    fn wave_of(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn detector_needs_full_window() {
        let mut det = OscillationDetector::new(4, 6);
        let w = wave_of(&["TASK-001"]);

        assert_eq!(det.observe(&w, 1), Oscillation::None);
        assert_eq!(det.observe(&w, 2), Oscillation::None);
        assert_eq!(det.observe(&w, 3), Oscillation::None);
    }

    #[test]
    fn repeating_window_below_threshold_requests_cooldown() {
        let mut det = OscillationDetector::new(4, 6);
        let w = wave_of(&["TASK-001", "TASK-002"]);

        det.observe(&w, 1);
        det.observe(&w, 2);
        det.observe(&w, 3);
        assert_eq!(det.observe(&w, 4), Oscillation::Repeating);
        assert_eq!(det.repeats(), 1);
    }

    #[test]
    fn repetition_past_threshold_is_detected() {
        let mut det = OscillationDetector::new(4, 6);
        let w = wave_of(&["TASK-001", "TASK-002"]);

        let mut last = Oscillation::None;
        for count in 1..=8 {
            last = det.observe(&w, count);
        }
        assert_eq!(last, Oscillation::Detected);
    }

    #[test]
    fn fingerprint_ignores_wave_ordering() {
        let mut det = OscillationDetector::new(4, 2);
        let a = wave_of(&["TASK-001", "TASK-002"]);
        let b = wave_of(&["TASK-002", "TASK-001"]);

        det.observe(&a, 1);
        det.observe(&b, 2);
        det.observe(&a, 3);
        assert_eq!(det.observe(&b, 4), Oscillation::Detected);
    }

    #[test]
    fn progress_resets_detection() {
        let mut det = OscillationDetector::new(4, 2);
        let a = wave_of(&["TASK-001"]);
        let b = wave_of(&["TASK-002"]);

        det.observe(&a, 1);
        det.observe(&a, 2);
        det.observe(&a, 3);
        // A different wave breaks the repeating halves.
        assert_eq!(det.observe(&b, 4), Oscillation::None);
        assert_eq!(det.repeats(), 0);
    }
}
