//! Client side of the points authority.

use async_trait::async_trait;
use crowntap_protocol::{
    routes, PointsTotal, QuizSubmission, UpdatePoints, UserIdentity, UserInfo, UserRecord,
};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authority returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unreadable authority response: {0}")]
    Decode(String),

    #[error("authority did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

/// Remote authority for balances and reward history.
///
/// `add_points` must be safe to resubmit with the same or a larger delta after a
/// failed attempt; the client does not deduplicate.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// `Ok(None)` when the user does not exist yet.
    async fn fetch_user(&self, id: &UserIdentity) -> Result<Option<UserInfo>, RemoteError>;

    async fn upsert_user(&self, record: &UserRecord) -> Result<(), RemoteError>;

    /// Returns the authority's new total.
    async fn add_points(&self, id: &UserIdentity, points_to_add: f64) -> Result<f64, RemoteError>;

    async fn submit_quiz(&self, submission: &QuizSubmission) -> Result<(), RemoteError>;
}

#[derive(Clone)]
pub struct HttpAuthority {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client for authority: {e}"))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn segment(id: &UserIdentity) -> String {
    urlencoding::encode(id.as_str()).into_owned()
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn fetch_user(&self, id: &UserIdentity) -> Result<Option<UserInfo>, RemoteError> {
        let response = self
            .http
            .get(self.url(&routes::user_info(&segment(id))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info = ensure_success(response).await?.json::<UserInfo>().await?;
        Ok(Some(info))
    }

    async fn upsert_user(&self, record: &UserRecord) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(self.url(routes::USER_INFO))
            .json(record)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn add_points(&self, id: &UserIdentity, points_to_add: f64) -> Result<f64, RemoteError> {
        let response = self
            .http
            .put(self.url(&routes::update_points(&segment(id))))
            .json(&UpdatePoints { points_to_add })
            .send()
            .await?;
        let total = ensure_success(response).await?.json::<PointsTotal>().await?;
        Ok(total.points)
    }

    async fn submit_quiz(&self, submission: &QuizSubmission) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(self.url(routes::SUBMIT_QUIZ))
            .json(submission)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
