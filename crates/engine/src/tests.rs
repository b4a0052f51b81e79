use super::*;
use async_trait::async_trait;
use crowntap_protocol::{QuizRecord, QuizSubmission, UserIdentity, UserInfo, UserRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::temp_cache;

/// Scripted stand-in for the points authority. Additive and idempotent-free, like
/// the real one: every accepted `add_points` call adds its delta.
pub(crate) struct FakeAuthority {
    state: Mutex<FakeState>,
    points_gate: Semaphore,
    fetch_gate: Semaphore,
    upsert_gate: Semaphore,
}

#[derive(Default)]
struct FakeState {
    users: HashMap<String, UserInfo>,
    add_calls: Vec<f64>,
    upserts: Vec<UserRecord>,
    quizzes: Vec<QuizSubmission>,
    fetches: usize,
    offline: bool,
    fail_points: bool,
    hang_points: bool,
    held: bool,
    fetches_held: bool,
    upserts_held: bool,
}

impl Default for FakeAuthority {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            points_gate: Semaphore::new(0),
            fetch_gate: Semaphore::new(0),
            upsert_gate: Semaphore::new(0),
        }
    }
}

impl FakeAuthority {
    pub(crate) fn seed_user(&self, id: &str, points: f64) {
        self.state.lock().unwrap().users.insert(
            id.to_string(),
            UserInfo {
                points,
                ..Default::default()
            },
        );
    }

    pub(crate) fn seed_info(&self, id: &str, info: UserInfo) {
        self.state.lock().unwrap().users.insert(id.to_string(), info);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub(crate) fn fail_points(&self, fail: bool) {
        self.state.lock().unwrap().fail_points = fail;
    }

    pub(crate) fn hang_points(&self) {
        self.state.lock().unwrap().hang_points = true;
    }

    /// Parks the next `add_points` call until [`release`](Self::release).
    pub(crate) fn hold(&self) {
        self.state.lock().unwrap().held = true;
    }

    pub(crate) fn release(&self) {
        self.state.lock().unwrap().held = false;
        self.points_gate.add_permits(1);
    }

    /// Parks `fetch_user` after it has read the stored user, so the answer it
    /// eventually gives is the one from before the hold.
    pub(crate) fn hold_fetches(&self) {
        self.state.lock().unwrap().fetches_held = true;
    }

    pub(crate) fn release_fetches(&self) {
        self.state.lock().unwrap().fetches_held = false;
        self.fetch_gate.add_permits(1);
    }

    /// Parks `upsert_user` before it records anything.
    pub(crate) fn hold_upserts(&self) {
        self.state.lock().unwrap().upserts_held = true;
    }

    pub(crate) fn release_upserts(&self) {
        self.state.lock().unwrap().upserts_held = false;
        self.upsert_gate.add_permits(1);
    }

    pub(crate) fn add_calls(&self) -> Vec<f64> {
        self.state.lock().unwrap().add_calls.clone()
    }

    pub(crate) fn upserts(&self) -> Vec<UserRecord> {
        self.state.lock().unwrap().upserts.clone()
    }

    pub(crate) fn quizzes(&self) -> Vec<QuizSubmission> {
        self.state.lock().unwrap().quizzes.clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub(crate) fn total(&self, id: &str) -> f64 {
        self.state
            .lock()
            .unwrap()
            .users
            .get(id)
            .map(|u| u.points)
            .unwrap_or(0.0)
    }
}

fn unavailable() -> RemoteError {
    RemoteError::Status {
        status: 503,
        message: "unavailable".into(),
    }
}

#[async_trait]
impl RemoteAuthority for FakeAuthority {
    async fn fetch_user(&self, id: &UserIdentity) -> Result<Option<UserInfo>, RemoteError> {
        let (answer, held) = {
            let mut s = self.state.lock().unwrap();
            s.fetches += 1;
            if s.offline {
                return Err(RemoteError::Network("offline".into()));
            }
            (s.users.get(id.as_str()).cloned(), s.fetches_held)
        };
        if held {
            self.fetch_gate.acquire().await.unwrap().forget();
        }
        Ok(answer)
    }

    async fn upsert_user(&self, record: &UserRecord) -> Result<(), RemoteError> {
        let held = self.state.lock().unwrap().upserts_held;
        if held {
            self.upsert_gate.acquire().await.unwrap().forget();
        }
        let mut s = self.state.lock().unwrap();
        if s.offline {
            return Err(RemoteError::Network("offline".into()));
        }
        let user = s.users.entry(record.user_id.to_string()).or_default();
        for t in &record.tasks_completed {
            if !user.tasks_completed.contains(t) {
                user.tasks_completed.push(t.clone());
            }
        }
        s.upserts.push(record.clone());
        Ok(())
    }

    async fn add_points(&self, id: &UserIdentity, points_to_add: f64) -> Result<f64, RemoteError> {
        let (held, hang) = {
            let mut s = self.state.lock().unwrap();
            s.add_calls.push(points_to_add);
            (s.held, s.hang_points)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if held {
            self.points_gate.acquire().await.unwrap().forget();
        }
        let mut s = self.state.lock().unwrap();
        if s.offline || s.fail_points {
            return Err(unavailable());
        }
        let user = s.users.entry(id.to_string()).or_default();
        user.points += points_to_add;
        Ok(user.points)
    }

    async fn submit_quiz(&self, submission: &QuizSubmission) -> Result<(), RemoteError> {
        let mut s = self.state.lock().unwrap();
        if s.offline {
            return Err(RemoteError::Network("offline".into()));
        }
        let user = s.users.entry(submission.user_id.to_string()).or_default();
        user.points += submission.points_earned;
        user.quiz_history.push(QuizRecord {
            quiz_id: submission.quiz_id.clone(),
            points_earned: submission.points_earned,
        });
        s.quizzes.push(submission.clone());
        Ok(())
    }
}

const USER: &str = "tg-1001";

fn start(fake: &Arc<FakeAuthority>, cache: &BalanceCache) -> Session {
    Session::start(
        &Config::default(),
        UserIdentity::new(USER),
        cache.clone(),
        fake.clone(),
    )
}

/// Lets the actor and any spawned request tasks run to quiescence without
/// moving the paused clock.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn advance_ms(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

fn tap_at(ts: i64) -> TapEvent {
    TapEvent {
        timestamp_ms: ts,
        x: 160.0,
        y: 160.0,
    }
}

#[tokio::test(start_paused = true)]
async fn burst_inside_window_sends_one_request_with_the_sum() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("burst"));
    let h = session.handle();
    settle().await;

    for i in 0..5 {
        assert!(h.tap(tap_at(i * 600)).await.unwrap().is_accepted());
        advance_ms(200).await;
    }
    assert!(fake.add_calls().is_empty(), "window re-armed by every tap");

    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![15.0]);

    advance_ms(5000).await;
    assert_eq!(fake.add_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn success_shows_authority_total() {
    let fake = Arc::new(FakeAuthority::default());
    fake.seed_user(USER, 100.0);
    let session = start(&fake, &temp_cache("success"));
    let h = session.handle();
    settle().await;
    assert_eq!(h.snapshot().confirmed, 100.0);
    assert!(h.snapshot().hydrated);

    for i in 0..3 {
        h.tap(tap_at(i * 1000)).await.unwrap();
    }
    assert_eq!(h.snapshot().displayed, 109.0);
    h.flush().await.unwrap();
    settle().await;

    let snap = h.snapshot();
    assert_eq!(fake.total(USER), 109.0);
    assert_eq!(snap.confirmed, 109.0);
    assert_eq!(snap.pending, 0.0);
    assert_eq!(snap.displayed, 109.0);
    assert_eq!(snap.last_sync_error, None);
}

#[tokio::test(start_paused = true)]
async fn failure_keeps_buffer_and_does_not_retry_on_its_own() {
    let fake = Arc::new(FakeAuthority::default());
    fake.fail_points(true);
    let cache = temp_cache("failure");
    let session = start(&fake, &cache);
    let h = session.handle();
    settle().await;

    h.tap(tap_at(0)).await.unwrap();
    let before = h.snapshot().pending;
    advance_ms(1000).await;

    let snap = h.snapshot();
    assert_eq!(fake.add_calls(), vec![3.0]);
    assert_eq!(snap.pending, before);
    assert!(snap.last_sync_error.as_deref().unwrap().contains("503"));

    advance_ms(30_000).await;
    assert_eq!(fake.add_calls().len(), 1);

    fake.fail_points(false);
    h.tap(tap_at(10_000)).await.unwrap();
    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![3.0, 6.0]);
    assert_eq!(h.snapshot().confirmed, 6.0);
    assert_eq!(h.snapshot().pending, 0.0);

    let log = cache.recent_sync_log(&UserIdentity::new(USER), 10).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].outcome, SyncOutcome::Acked);
    assert_eq!(log[1].outcome, SyncOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn taps_during_flight_are_kept_for_the_next_request() {
    let fake = Arc::new(FakeAuthority::default());
    fake.hold();
    let session = start(&fake, &temp_cache("inflight"));
    let h = session.handle();
    settle().await;

    h.tap(tap_at(0)).await.unwrap();
    advance_ms(1000).await;
    assert!(h.snapshot().sync_in_flight);

    h.tap(tap_at(5_000)).await.unwrap();
    h.tap(tap_at(10_000)).await.unwrap();
    assert_eq!(h.snapshot().pending, 9.0);

    fake.release();
    settle().await;
    let snap = h.snapshot();
    assert_eq!(snap.confirmed, 3.0);
    assert_eq!(snap.pending, 6.0);
    assert_eq!(snap.displayed, 9.0);

    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![3.0, 6.0]);
    assert_eq!(h.snapshot().confirmed, 9.0);
    assert_eq!(fake.total(USER), 9.0);
}

#[tokio::test(start_paused = true)]
async fn offline_accumulates_until_back_online() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("offline"));
    let h = session.handle();
    settle().await;

    h.set_online(false).await.unwrap();
    for i in 0..4 {
        h.tap(tap_at(i * 1000)).await.unwrap();
    }
    advance_ms(5000).await;
    assert!(fake.add_calls().is_empty());
    assert_eq!(h.snapshot().displayed, 12.0);

    h.set_online(true).await.unwrap();
    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![12.0]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_as_failure() {
    let fake = Arc::new(FakeAuthority::default());
    fake.hang_points();
    let session = start(&fake, &temp_cache("timeout"));
    let h = session.handle();
    settle().await;

    h.tap(tap_at(0)).await.unwrap();
    advance_ms(1000).await;
    assert!(h.snapshot().sync_in_flight);

    advance_ms(10_000).await;
    let snap = h.snapshot();
    assert!(!snap.sync_in_flight);
    assert_eq!(snap.pending, 3.0);
    assert!(snap.last_sync_error.unwrap().contains("did not answer"));
}

#[tokio::test(start_paused = true)]
async fn energy_gates_the_hundred_and_first_tap() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("energy"));
    let h = session.handle();
    settle().await;

    for i in 0..100 {
        assert!(h.tap(tap_at(i * 1000)).await.unwrap().is_accepted());
    }
    let snap = h.snapshot();
    assert_eq!(snap.energy, 0.0);

    let out = h.tap(tap_at(200_000)).await.unwrap();
    assert_eq!(out, TapOutcome::Rejected(TapRejection::Exhausted));
    assert_eq!(h.snapshot().displayed, snap.displayed);
    assert_eq!(h.snapshot().taps, 100);

    advance_ms(1000).await;
    assert_eq!(h.snapshot().energy, 1.0);
    assert!(h.tap(tap_at(300_000)).await.unwrap().is_accepted());
}

#[tokio::test(start_paused = true)]
async fn out_of_bounds_tap_changes_nothing() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("bounds"));
    let h = session.handle();
    settle().await;

    let out = h
        .tap(TapEvent {
            timestamp_ms: 0,
            x: 400.0,
            y: 10.0,
        })
        .await
        .unwrap();
    assert_eq!(out, TapOutcome::Rejected(TapRejection::OutOfBounds));
    advance_ms(2000).await;
    assert!(fake.add_calls().is_empty());
    assert_eq!(h.snapshot().energy, 1000.0);
}

#[tokio::test(start_paused = true)]
async fn cached_balance_is_shown_before_remote_hydration() {
    let cache = temp_cache("reload");
    let fake = Arc::new(FakeAuthority::default());
    let first = start(&fake, &cache);
    let h = first.handle();
    settle().await;
    for i in 0..4 {
        h.tap(tap_at(i * 1000)).await.unwrap();
    }
    h.flush().await.unwrap();
    settle().await;
    let confirmed = h.snapshot().confirmed;
    assert_eq!(confirmed, 12.0);
    first.shutdown().await;

    let offline = Arc::new(FakeAuthority::default());
    offline.set_offline(true);
    let second = start(&offline, &cache);
    let snap = second.handle().snapshot();
    assert_eq!(snap.confirmed, confirmed);
    assert_eq!(snap.pending, 0.0);
    assert!(!snap.hydrated);

    settle().await;
    assert_eq!(second.handle().snapshot().confirmed, confirmed);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_delta_survives_restart_without_double_counting() {
    let cache = temp_cache("crash");
    let id = UserIdentity::new(USER);
    // What a run killed before its sync answer leaves behind.
    cache.save_balance(&id, 50.0, 9.0).unwrap();
    let fake = Arc::new(FakeAuthority::default());
    fake.seed_user(USER, 50.0);

    let session = start(&fake, &cache);
    let h = session.handle();
    assert_eq!(h.snapshot().pending, 9.0);
    settle().await;
    assert_eq!(h.snapshot().confirmed, 50.0);
    assert_eq!(h.snapshot().displayed, 59.0);

    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![9.0]);
    assert_eq!(fake.total(USER), 59.0);
    assert_eq!(h.snapshot().displayed, 59.0);
    assert_eq!(cache.load_pending(&id).unwrap(), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn remote_hydration_replaces_cached_confirmed() {
    let cache = temp_cache("hydrate");
    cache.save(&UserIdentity::new(USER), 40.0).unwrap();
    let fake = Arc::new(FakeAuthority::default());
    fake.seed_info(
        USER,
        UserInfo {
            points: 80.0,
            quiz_history: vec![QuizRecord {
                quiz_id: "q1".into(),
                points_earned: 5.0,
            }],
            tasks_completed: vec!["follow".into()],
        },
    );
    let session = start(&fake, &cache);
    let h = session.handle();
    assert_eq!(h.snapshot().confirmed, 40.0);
    settle().await;

    let snap = h.snapshot();
    assert_eq!(snap.confirmed, 80.0);
    assert_eq!(snap.tasks_completed, 1);
    assert_eq!(snap.quizzes_answered, 1);
    assert_eq!(cache.load(&UserIdentity::new(USER)).unwrap(), Some(80.0));
    assert!(matches!(
        h.submit_quiz("q1", true, 5.0).await,
        Err(SessionError::Reward(RewardError::AlreadyCompleted(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_hands_over_the_pending_delta() {
    let fake = Arc::new(FakeAuthority::default());
    let cache = temp_cache("shutdown");
    let session = start(&fake, &cache);
    let h = session.handle();
    settle().await;

    h.tap(tap_at(0)).await.unwrap();
    session.shutdown().await;

    assert_eq!(fake.add_calls(), vec![3.0]);
    let id = UserIdentity::new(USER);
    assert_eq!(cache.load(&id).unwrap(), Some(3.0));
    assert_eq!(cache.load_pending(&id).unwrap(), Some(0.0));
    assert!(matches!(h.flush().await, Err(SessionError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn timed_task_pays_out_through_the_sync_path() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("task"));
    let h = session.handle();
    settle().await;

    h.start_task("follow", 500.0).await.unwrap();
    assert!(matches!(
        h.claim_task("follow").await,
        Err(SessionError::Reward(RewardError::NotReady { .. }))
    ));

    advance_ms(10_000).await;
    assert_eq!(h.claim_task("follow").await.unwrap(), 500.0);
    settle().await;
    assert_eq!(h.snapshot().pending, 500.0);
    assert_eq!(h.snapshot().tasks_completed, 1);
    let recorded = fake.upserts();
    assert_eq!(recorded.last().unwrap().tasks_completed, vec!["follow".to_string()]);
    assert_eq!(recorded.last().unwrap().task_history[0].points_earned, 500.0);

    advance_ms(1000).await;
    assert_eq!(fake.add_calls(), vec![500.0]);
    assert_eq!(h.snapshot().confirmed, 500.0);

    assert!(matches!(
        h.claim_task("follow").await,
        Err(SessionError::Reward(RewardError::AlreadyCompleted(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn unrecorded_task_claim_credits_nothing() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("task-fail"));
    let h = session.handle();
    settle().await;

    h.start_task("join", 100.0).await.unwrap();
    advance_ms(10_000).await;
    fake.set_offline(true);
    assert!(matches!(h.claim_task("join").await, Err(SessionError::Remote(_))));
    settle().await;
    assert_eq!(h.snapshot().displayed, 0.0);

    fake.set_offline(false);
    assert_eq!(h.claim_task("join").await.unwrap(), 100.0);
}

#[tokio::test(start_paused = true)]
async fn quiz_credit_lands_on_confirmed() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("quiz"));
    let h = session.handle();
    settle().await;

    assert_eq!(h.submit_quiz("q1", true, 20.0).await.unwrap(), 20.0);
    assert_eq!(h.submit_quiz("q2", false, 20.0).await.unwrap(), 0.0);
    settle().await;
    let snap = h.snapshot();
    assert_eq!(snap.confirmed, 20.0);
    assert_eq!(snap.pending, 0.0);
    assert_eq!(snap.quizzes_answered, 2);
    assert_eq!(fake.quizzes()[1].points_earned, 0.0);
    assert_eq!(fake.total(USER), 20.0);
    assert!(fake.add_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn quiz_credit_survives_a_slow_hydration() {
    let cache = temp_cache("quiz-slow-fetch");
    cache.save(&UserIdentity::new(USER), 100.0).unwrap();
    let fake = Arc::new(FakeAuthority::default());
    fake.seed_user(USER, 100.0);
    fake.hold_fetches();
    let session = start(&fake, &cache);
    let h = session.handle();
    settle().await;
    assert!(!h.snapshot().hydrated);

    assert_eq!(h.submit_quiz("q1", true, 50.0).await.unwrap(), 50.0);
    settle().await;
    assert_eq!(h.snapshot().displayed, 150.0);
    assert_eq!(fake.total(USER), 150.0);

    // The answer was read before the quiz was credited.
    fake.release_fetches();
    settle().await;
    let snap = h.snapshot();
    assert!(snap.hydrated);
    assert_eq!(snap.confirmed, 150.0);
    assert_eq!(snap.displayed, 150.0);
    assert_eq!(cache.load(&UserIdentity::new(USER)).unwrap(), Some(150.0));
}

#[tokio::test(start_paused = true)]
async fn abandoned_claim_still_settles() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("task-abandoned"));
    let h = session.handle();
    settle().await;

    h.start_task("follow", 500.0).await.unwrap();
    advance_ms(10_000).await;
    fake.hold_upserts();
    let gave_up = tokio::time::timeout(Duration::from_millis(100), h.claim_task("follow")).await;
    assert!(gave_up.is_err());

    fake.release_upserts();
    settle().await;
    let snap = h.snapshot();
    assert_eq!(snap.pending, 500.0);
    assert_eq!(snap.tasks_completed, 1);
    assert_eq!(fake.upserts().len(), 1);
    assert!(matches!(
        h.claim_task("follow").await,
        Err(SessionError::Reward(RewardError::AlreadyCompleted(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn abandoned_claim_can_be_retried_after_a_failure() {
    let fake = Arc::new(FakeAuthority::default());
    let session = start(&fake, &temp_cache("task-abandoned-retry"));
    let h = session.handle();
    settle().await;

    h.start_task("join", 100.0).await.unwrap();
    advance_ms(10_000).await;
    fake.hold_upserts();
    fake.set_offline(true);
    let gave_up = tokio::time::timeout(Duration::from_millis(100), h.claim_task("join")).await;
    assert!(gave_up.is_err());
    assert!(matches!(
        h.claim_task("join").await,
        Err(SessionError::Reward(RewardError::InProgress(_)))
    ));

    fake.release_upserts();
    settle().await;
    fake.set_offline(false);
    assert_eq!(h.claim_task("join").await.unwrap(), 100.0);
    settle().await;
    assert_eq!(h.snapshot().pending, 100.0);
}

#[tokio::test(start_paused = true)]
async fn registration_answer_stands_in_for_the_startup_fetch() {
    let fake = Arc::new(FakeAuthority::default());
    fake.seed_user(USER, 70.0);
    let cache = temp_cache("registration");
    let resolver = IdentityResolver::new(
        cache.clone(),
        Some(PlatformUser {
            id: USER.into(),
            username: None,
        }),
        fake.clone(),
    );
    let (user, registration) = resolver.resolve_with_registration().await.unwrap();
    assert_eq!(fake.fetches(), 1);

    let session = Session::start_with(&Config::default(), user, cache, fake.clone(), registration);
    let snap = session.handle().snapshot();
    assert!(snap.hydrated);
    assert_eq!(snap.confirmed, 70.0);

    settle().await;
    assert_eq!(fake.fetches(), 1);
    assert_eq!(session.handle().snapshot().confirmed, 70.0);
}
