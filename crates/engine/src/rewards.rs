//! Bookkeeping for rewards that do not come from taps: timed tasks and quizzes.

use crowntap_protocol::UserInfo;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RewardError {
    #[error("task {0} was never started")]
    NotStarted(String),

    #[error("task {id} becomes claimable in {remaining:?}")]
    NotReady { id: String, remaining: Duration },

    #[error("{0} is already completed")]
    AlreadyCompleted(String),

    #[error("{0} is already being submitted")]
    InProgress(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TaskState {
    Running { started: Instant, points: f64 },
    Claiming { started: Instant, points: f64 },
    Completed,
}

#[derive(Debug)]
pub struct RewardBoard {
    claim_delay: Duration,
    tasks: HashMap<String, TaskState>,
    answered: HashSet<String>,
    answering: HashSet<String>,
}

impl RewardBoard {
    pub fn new(claim_delay: Duration) -> Self {
        Self {
            claim_delay,
            tasks: HashMap::new(),
            answered: HashSet::new(),
            answering: HashSet::new(),
        }
    }

    /// Merges the authority's history. Never un-completes anything.
    pub fn hydrate(&mut self, info: &UserInfo) {
        for id in &info.tasks_completed {
            self.tasks.insert(id.clone(), TaskState::Completed);
        }
        for q in &info.quiz_history {
            self.answered.insert(q.quiz_id.clone());
        }
    }

    pub fn is_task_completed(&self, id: &str) -> bool {
        matches!(self.tasks.get(id), Some(TaskState::Completed))
    }

    pub fn is_quiz_answered(&self, id: &str) -> bool {
        self.answered.contains(id)
    }

    pub fn completed_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|s| matches!(s, TaskState::Completed))
            .count()
    }

    pub fn answered_quizzes(&self) -> usize {
        self.answered.len()
    }

    /// (Re)starts the countdown. Starting a running task resets its timer.
    pub fn start_task(&mut self, id: &str, points: f64, now: Instant) -> Result<(), RewardError> {
        match self.tasks.get(id) {
            Some(TaskState::Completed) => Err(RewardError::AlreadyCompleted(id.to_string())),
            Some(TaskState::Claiming { .. }) => Err(RewardError::InProgress(id.to_string())),
            _ => {
                let points = if points.is_finite() { points.max(0.0) } else { 0.0 };
                self.tasks
                    .insert(id.to_string(), TaskState::Running { started: now, points });
                Ok(())
            }
        }
    }

    /// Reserves the task for a claim and returns its points.
    pub fn begin_claim(&mut self, id: &str, now: Instant) -> Result<f64, RewardError> {
        let state = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| RewardError::NotStarted(id.to_string()))?;
        match *state {
            TaskState::Completed => Err(RewardError::AlreadyCompleted(id.to_string())),
            TaskState::Claiming { .. } => Err(RewardError::InProgress(id.to_string())),
            TaskState::Running { started, points } => {
                let ready_at = started + self.claim_delay;
                if now < ready_at {
                    return Err(RewardError::NotReady {
                        id: id.to_string(),
                        remaining: ready_at - now,
                    });
                }
                *state = TaskState::Claiming { started, points };
                Ok(points)
            }
        }
    }

    /// A failed claim stays claimable.
    pub fn finish_claim(&mut self, id: &str, recorded: bool) {
        if let Some(state) = self.tasks.get_mut(id) {
            if let TaskState::Claiming { started, points } = *state {
                *state = if recorded {
                    TaskState::Completed
                } else {
                    TaskState::Running { started, points }
                };
            }
        }
    }

    pub fn begin_quiz(&mut self, id: &str) -> Result<(), RewardError> {
        if self.answered.contains(id) {
            return Err(RewardError::AlreadyCompleted(id.to_string()));
        }
        if !self.answering.insert(id.to_string()) {
            return Err(RewardError::InProgress(id.to_string()));
        }
        Ok(())
    }

    pub fn finish_quiz(&mut self, id: &str, recorded: bool) {
        self.answering.remove(id);
        if recorded {
            self.answered.insert(id.to_string());
        }
    }
}
