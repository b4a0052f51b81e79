use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable per-user partition key for persisted client state and all remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `GET /user-info/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub points: f64,
    #[serde(default)]
    pub quiz_history: Vec<QuizRecord>,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizRecord {
    pub quiz_id: String,
    #[serde(default)]
    pub points_earned: f64,
}

/// `PUT /user-info/update-points/{id}` request body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePoints {
    pub points_to_add: f64,
}

/// Authority's new total, returned by the update-points call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointsTotal {
    pub points: f64,
}

/// `POST /user-info/submit-quiz`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSubmission {
    #[serde(rename = "userID")]
    pub user_id: UserIdentity,
    #[serde(rename = "quizId")]
    pub quiz_id: String,
    #[serde(rename = "pointsEarned")]
    pub points_earned: f64,
}

/// `POST /user-info`: creates the user record, or appends completed tasks to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "userID")]
    pub user_id: UserIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "tasksCompleted", default)]
    pub tasks_completed: Vec<String>,
    #[serde(rename = "taskHistory", default)]
    pub task_history: Vec<TaskHistoryEntry>,
}

impl UserRecord {
    pub fn create(user_id: UserIdentity, username: Option<String>) -> Self {
        Self {
            user_id,
            username,
            tasks_completed: Vec::new(),
            task_history: Vec::new(),
        }
    }

    pub fn task_completed(user_id: UserIdentity, entry: TaskHistoryEntry) -> Self {
        Self {
            user_id,
            username: None,
            tasks_completed: vec![entry.task_id.clone()],
            task_history: vec![entry],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub points_earned: f64,
    /// RFC 3339 timestamp.
    pub completed_at: String,
}

pub mod routes {
    pub const USER_INFO: &str = "/user-info";
    pub const SUBMIT_QUIZ: &str = "/user-info/submit-quiz";

    /// `segment` must already be percent-encoded.
    pub fn user_info(segment: &str) -> String {
        format!("{USER_INFO}/{segment}")
    }

    pub fn update_points(segment: &str) -> String {
        format!("{USER_INFO}/update-points/{segment}")
    }
}
