//! One running game session.
//!
//! All mutable game state lives in a single actor task. Commands from
//! [`SessionHandle`], the regeneration tick, the sync deadline and network
//! completions are handled one at a time, so no handler ever observes another
//! half-applied. Network calls run in their own tasks and report back, which
//! keeps taps flowing while a sync is in flight.

use crowntap_protocol::{QuizSubmission, TaskHistoryEntry, UserIdentity, UserInfo, UserRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::balance::PointBalance;
use crate::cache::{BalanceCache, SyncLogEntry, SyncOutcome};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, TapEvent, TapOutcome};
use crate::energy::EnergyStore;
use crate::identity::Registration;
use crate::remote::{RemoteAuthority, RemoteError};
use crate::rewards::{RewardBoard, RewardError};
use crate::sync::{FireSkip, Settled, SyncCoordinator, SyncRequest};
use crate::{now_ms, now_rfc3339};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Reward(#[from] RewardError),

    #[error("authority rejected the submission: {0}")]
    Remote(#[from] RemoteError),
}

/// Read-only view for the presentation layer, republished after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub user: UserIdentity,
    pub confirmed: f64,
    pub pending: f64,
    /// `confirmed + pending`; the only balance a user should ever see.
    pub displayed: f64,
    pub energy: f64,
    pub max_energy: f64,
    pub taps: u64,
    pub online: bool,
    pub sync_in_flight: bool,
    pub last_sync_error: Option<String>,
    pub hydrated: bool,
    pub tasks_completed: usize,
    pub quizzes_answered: usize,
}

enum Command {
    Tap(TapEvent, oneshot::Sender<TapOutcome>),
    Flush,
    SetOnline(bool),
    StartTask {
        id: String,
        points: f64,
        reply: oneshot::Sender<Result<(), RewardError>>,
    },
    ClaimTask {
        id: String,
        reply: oneshot::Sender<Result<f64, SessionError>>,
    },
    SubmitQuiz {
        id: String,
        correct: bool,
        points: f64,
        reply: oneshot::Sender<Result<f64, SessionError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Synced(Result<f64, RemoteError>),
    Hydrated(Result<Option<UserInfo>, RemoteError>),
    Claimed {
        id: String,
        points: f64,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<Result<f64, SessionError>>,
    },
    QuizSubmitted {
        id: String,
        earned: f64,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<Result<f64, SessionError>>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    user: UserIdentity,
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

pub struct Session {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl Session {
    /// Hydrates from the durable cache, then spawns the actor. Remote hydration
    /// starts in the background; until it lands the cached balance is shown.
    pub fn start(
        config: &Config,
        user: UserIdentity,
        cache: BalanceCache,
        remote: Arc<dyn RemoteAuthority>,
    ) -> Session {
        Self::start_with(config, user, cache, remote, Registration::Unreachable)
    }

    /// Like [`start`](Self::start), but an answer the authority already gave
    /// during identity resolution stands in for the remote hydration request.
    pub fn start_with(
        config: &Config,
        user: UserIdentity,
        cache: BalanceCache,
        remote: Arc<dyn RemoteAuthority>,
        registration: Registration,
    ) -> Session {
        let confirmed = load_or_warn(cache.load(&user), &user, "confirmed");
        let pending = load_or_warn(cache.load_pending(&user), &user, "pending");
        let balance = PointBalance::new(confirmed.unwrap_or(0.0), pending.unwrap_or(0.0));
        info!(
            user = %user,
            confirmed = balance.confirmed,
            pending = balance.pending(),
            "session hydrated from local cache"
        );

        let (tx, rx) = mpsc::channel(256);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut actor = Actor {
            user: user.clone(),
            cache,
            remote,
            request_timeout: config.sync.request_timeout(),
            energy: config.energy.store(),
            balance,
            dispatcher: Dispatcher::new(
                config.surface,
                config.tap.multiplier(),
                config.tap.energy_cost,
            ),
            sync: SyncCoordinator::new(user.clone(), config.sync.debounce()),
            rewards: RewardBoard::new(config.tasks.claim_delay()),
            hydrated: false,
            confirmed_moved: false,
            reward_jobs: 0,
            last_sync_error: None,
            completions_tx,
            snapshot_tx: None,
        };
        if !actor.balance.buffer.is_empty() {
            actor.sync.arm(Instant::now());
        }
        match registration {
            Registration::Existing(info) => actor.complete(Completion::Hydrated(Ok(Some(info)))),
            Registration::Created => actor.complete(Completion::Hydrated(Ok(None))),
            Registration::Unreachable => actor.spawn_hydration(),
        }
        let (snapshot_tx, snapshot_rx) = watch::channel(actor.snapshot());
        actor.snapshot_tx = Some(snapshot_tx);

        let task = tokio::spawn(actor.run(rx, completions_rx, config.energy.tick()));

        Session {
            handle: SessionHandle {
                user,
                tx,
                snapshot: snapshot_rx,
            },
            task,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stops the actor after a last attempt to hand the pending delta over.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.task.await;
    }
}

impl SessionHandle {
    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub async fn tap(&self, tap: TapEvent) -> Result<TapOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Tap(tap, reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Sends the outstanding delta without waiting out the debounce window.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.send(Command::Flush).await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), SessionError> {
        self.send(Command::SetOnline(online)).await
    }

    pub async fn start_task(&self, id: &str, points: f64) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartTask {
            id: id.to_string(),
            points,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Records the completion with the authority, then credits the task's points
    /// through the regular sync path. Returns the credited points.
    ///
    /// The request belongs to the session: dropping this future does not leave
    /// the task reserved.
    pub async fn claim_task(&self, id: &str) -> Result<f64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClaimTask {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Submits an answer once. The authority credits `points` when `correct`;
    /// the credited amount is returned. Cancel-safe like [`claim_task`](Self::claim_task).
    pub async fn submit_quiz(&self, id: &str, correct: bool, points: f64) -> Result<f64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitQuiz {
            id: id.to_string(),
            correct,
            points,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), SessionError> {
        self.tx.send(cmd).await.map_err(|_| SessionError::Closed)
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

async fn submit(remote: Arc<dyn RemoteAuthority>, limit: Duration, req: SyncRequest) -> Result<f64, RemoteError> {
    with_timeout(limit, remote.add_points(&req.user, req.points_to_add)).await
}

fn load_or_warn(r: anyhow::Result<Option<f64>>, user: &UserIdentity, what: &str) -> Option<f64> {
    r.unwrap_or_else(|e| {
        let error = format!("{e:#}");
        warn!(user = %user, %error, "cached {what} balance unreadable; starting from zero");
        None
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

struct Actor {
    user: UserIdentity,
    cache: BalanceCache,
    remote: Arc<dyn RemoteAuthority>,
    request_timeout: Duration,
    energy: EnergyStore,
    balance: PointBalance,
    dispatcher: Dispatcher,
    sync: SyncCoordinator,
    rewards: RewardBoard,
    hydrated: bool,
    /// `confirmed` changed locally since hydration was requested.
    confirmed_moved: bool,
    reward_jobs: usize,
    last_sync_error: Option<String>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    snapshot_tx: Option<watch::Sender<Snapshot>>,
}

impl Actor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        tick: Duration,
    ) {
        let mut regen = tokio::time::interval_at(Instant::now() + tick, tick);
        regen.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.sync.deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown(done)) => {
                        self.drain(&mut completions).await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.drain(&mut completions).await;
                        break;
                    }
                },
                Some(done) = completions.recv() => self.complete(done),
                _ = regen.tick() => self.energy.regenerate(tick.as_secs_f64()),
                _ = wait_until(deadline) => self.fire_sync(),
            }
            self.publish();
        }
        self.publish();
        debug!(user = %self.user, "session actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Tap(tap, reply) => {
                let outcome = self.dispatcher.dispatch(&tap, &mut self.energy, &mut self.balance);
                if outcome.is_accepted() {
                    self.sync.arm(now);
                    self.persist();
                }
                let _ = reply.send(outcome);
            }
            Command::Flush => self.sync.flush(now),
            Command::SetOnline(online) => {
                if self.sync.set_online(online, &self.balance) {
                    self.sync.arm(now);
                }
                info!(user = %self.user, online, "network availability changed");
            }
            Command::StartTask { id, points, reply } => {
                let _ = reply.send(self.rewards.start_task(&id, points, now));
            }
            Command::ClaimTask { id, reply } => match self.rewards.begin_claim(&id, now) {
                Ok(points) => self.spawn_claim(id, points, reply),
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::SubmitQuiz {
                id,
                correct,
                points,
                reply,
            } => match self.rewards.begin_quiz(&id) {
                Ok(()) => {
                    let earned = if correct && points.is_finite() { points.max(0.0) } else { 0.0 };
                    self.spawn_quiz(id, earned, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Shutdown(_) => {}
        }
    }

    fn fire_sync(&mut self) {
        match self.sync.fire(&self.balance) {
            Ok(req) => {
                debug!(user = %self.user, points = req.points_to_add, "submitting buffered points");
                let remote = self.remote.clone();
                let limit = self.request_timeout;
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = submit(remote, limit, req).await;
                    let _ = tx.send(Completion::Synced(result));
                });
            }
            Err(FireSkip::InFlight) => debug!(user = %self.user, "sync deferred behind in-flight request"),
            Err(FireSkip::Offline | FireSkip::Nothing) => {}
        }
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Synced(result) => {
                let settled = self.sync.settle(
                    result.as_ref().map(|t| *t),
                    &mut self.balance,
                    Instant::now(),
                );
                match settled {
                    Some(Settled::Acked {
                        authority_total,
                        submitted,
                    }) => {
                        self.last_sync_error = None;
                        self.persist();
                        self.log_sync(SyncOutcome::Acked, submitted, Some(authority_total), None);
                    }
                    Some(Settled::Failed { submitted }) => {
                        let msg = result.err().map(|e| e.to_string());
                        self.last_sync_error = msg.clone();
                        self.log_sync(SyncOutcome::Failed, submitted, None, msg);
                    }
                    None => {}
                }
            }
            Completion::Hydrated(Ok(Some(info))) => {
                self.rewards.hydrate(&info);
                if self.confirmed_moved || self.sync.has_acked() || self.sync.in_flight().is_some() {
                    debug!(user = %self.user, "remote balance superseded by a newer sync answer");
                } else {
                    self.balance.confirmed = info.points;
                    self.persist();
                }
                self.hydrated = true;
                info!(
                    user = %self.user,
                    confirmed = self.balance.confirmed,
                    pending = self.balance.pending(),
                    "session hydrated from authority"
                );
            }
            Completion::Hydrated(Ok(None)) => {
                self.hydrated = true;
                debug!(user = %self.user, "authority has no record yet; keeping cached balance");
            }
            Completion::Hydrated(Err(e)) => {
                warn!(user = %self.user, error = %e, "remote hydration failed; using cached balance");
            }
            Completion::Claimed {
                id,
                points,
                result,
                reply,
            } => {
                self.reward_jobs = self.reward_jobs.saturating_sub(1);
                self.rewards.finish_claim(&id, result.is_ok());
                let outcome = match result {
                    Ok(()) => {
                        self.balance.buffer.append(points);
                        self.sync.arm(Instant::now());
                        self.persist();
                        info!(user = %self.user, task = %id, points, "task reward claimed");
                        Ok(points)
                    }
                    Err(e) => {
                        warn!(user = %self.user, task = %id, error = %e, "task completion not recorded");
                        Err(e.into())
                    }
                };
                let _ = reply.send(outcome);
            }
            Completion::QuizSubmitted {
                id,
                earned,
                result,
                reply,
            } => {
                self.reward_jobs = self.reward_jobs.saturating_sub(1);
                self.rewards.finish_quiz(&id, result.is_ok());
                let outcome = match result {
                    Ok(()) => {
                        if earned > 0.0 {
                            // Already credited by the authority on submission.
                            self.balance.confirmed += earned;
                            self.confirmed_moved = true;
                            self.persist();
                        }
                        Ok(earned)
                    }
                    Err(e) => {
                        warn!(user = %self.user, quiz = %id, error = %e, "quiz submission failed");
                        Err(e.into())
                    }
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn spawn_claim(&mut self, id: String, points: f64, reply: oneshot::Sender<Result<f64, SessionError>>) {
        let record = UserRecord::task_completed(
            self.user.clone(),
            TaskHistoryEntry {
                task_id: id.clone(),
                points_earned: points,
                completed_at: now_rfc3339(),
            },
        );
        let remote = self.remote.clone();
        let limit = self.request_timeout;
        let tx = self.completions_tx.clone();
        self.reward_jobs += 1;
        tokio::spawn(async move {
            let result = with_timeout(limit, remote.upsert_user(&record)).await;
            let _ = tx.send(Completion::Claimed {
                id,
                points,
                result,
                reply,
            });
        });
    }

    fn spawn_quiz(&mut self, id: String, earned: f64, reply: oneshot::Sender<Result<f64, SessionError>>) {
        let submission = QuizSubmission {
            user_id: self.user.clone(),
            quiz_id: id.clone(),
            points_earned: earned,
        };
        let remote = self.remote.clone();
        let limit = self.request_timeout;
        let tx = self.completions_tx.clone();
        self.reward_jobs += 1;
        tokio::spawn(async move {
            let result = with_timeout(limit, remote.submit_quiz(&submission)).await;
            let _ = tx.send(Completion::QuizSubmitted {
                id,
                earned,
                result,
                reply,
            });
        });
    }

    fn spawn_hydration(&self) {
        let remote = self.remote.clone();
        let user = self.user.clone();
        let limit = self.request_timeout;
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = with_timeout(limit, remote.fetch_user(&user)).await;
            let _ = tx.send(Completion::Hydrated(result));
        });
    }

    /// Waits out in-flight requests, then makes one final submission.
    async fn drain(&mut self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        let give_up = Instant::now() + self.request_timeout;
        while self.sync.in_flight().is_some() || self.reward_jobs > 0 {
            match tokio::time::timeout_at(give_up, completions.recv()).await {
                Ok(Some(done)) => self.complete(done),
                _ => break,
            }
        }
        if self.sync.in_flight().is_none() {
            if let Ok(req) = self.sync.fire(&self.balance) {
                let result = submit(self.remote.clone(), self.request_timeout, req).await;
                self.complete(Completion::Synced(result));
            }
        }
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self
            .cache
            .save_balance(&self.user, self.balance.confirmed, self.balance.pending())
        {
            let error = format!("{e:#}");
            warn!(user = %self.user, %error, "balance write-through failed");
        }
    }

    fn log_sync(&self, outcome: SyncOutcome, sent: f64, total: Option<f64>, error: Option<String>) {
        let entry = SyncLogEntry {
            ts_ms: now_ms(),
            user_id: self.user.to_string(),
            outcome,
            points_sent: sent,
            authority_total: total,
            error,
        };
        if let Err(e) = self.cache.record_sync(&entry) {
            let error = format!("{e:#}");
            warn!(user = %self.user, %error, "sync ledger write failed");
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            user: self.user.clone(),
            confirmed: self.balance.confirmed,
            pending: self.balance.pending(),
            displayed: self.balance.displayed(),
            energy: self.energy.current(),
            max_energy: self.energy.max(),
            taps: self.dispatcher.taps(),
            online: self.sync.is_online(),
            sync_in_flight: self.sync.in_flight().is_some(),
            last_sync_error: self.last_sync_error.clone(),
            hydrated: self.hydrated,
            tasks_completed: self.rewards.completed_tasks(),
            quizzes_answered: self.rewards.answered_quizzes(),
        }
    }

    fn publish(&self) {
        if let Some(tx) = &self.snapshot_tx {
            tx.send_replace(self.snapshot());
        }
    }
}
