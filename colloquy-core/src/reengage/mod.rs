//! Reengagement scheduling — nudging a quiet conversation back to life.
//!
//! After a configurable idle period with no user activity, the scheduler
//! runs a short countdown and then fires a reengagement action (the host
//! decides what that is — typically a prompt to the model). Three gates
//! keep the nudge polite:
//!
//! 1. **Context**: [`ReengageContext::can_schedule`] — the host says
//!    whether a nudge is appropriate at all (session active, UI visible).
//!    Checked when arming, when the idle wait elapses, and once more when
//!    the countdown elapses.
//! 2. **Activity tokens**: any live foreign token in [`ActivityTokens`]
//!    blocks arming and the countdown at the same three checkpoints. The
//!    scheduler's own `reengage:` tokens are exempt, so it cannot deadlock
//!    itself; it holds a `reengage:wait` token for the whole idle wait and
//!    swaps it for `reengage:countdown`, so other subsystems can observe
//!    that a nudge is pending.
//! 3. **User activity**: [`handle_user_activity`] cancels everything and,
//!    after a short debounce, restarts the idle clock from zero.
//!
//! ## Phases
//!
//! ```text
//! idle ──arm──► waiting ──60%──► watching ──100%──► countdown ──5s──► engaging ──► idle
//!                  │                │                   │
//!                  └── user activity / cancel ──────────┘──► idle (debounce restarts)
//! ```
//!
//! The waiting/watching split exists so hosts can surface a subtle UI hint
//! during the last stretch of the idle wait. Thresholds at or below
//! [`ReengageConfig::two_phase_threshold`] skip the split.
//!
//! Timer invalidation uses generation counters, not task aborts: every
//! state change bumps the generation, and a timer that wakes to a stale
//! generation simply returns. There is no await point where a cancelled
//! cycle can still mutate state.
//!
//! [`handle_user_activity`]: ReengagementScheduler::handle_user_activity

pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use tokens::{mint_token, ActivityTokens, REENGAGE_CATEGORY};

/// Where the scheduler currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReengagePhase {
    /// Nothing armed.
    Idle,
    /// Idle wait, first stretch.
    Waiting,
    /// Idle wait, final stretch — hosts may surface a hint.
    Watching,
    /// Final countdown before the action fires.
    Countdown,
    /// The action is being invoked.
    Engaging,
}

/// Scheduler timing knobs.
#[derive(Debug, Clone)]
pub struct ReengageConfig {
    /// Quiet time before the countdown arms. Default: 45 s.
    pub idle_threshold: Duration,
    /// Countdown length once armed. Default: 5 s.
    pub countdown: Duration,
    /// Quiet period after user activity before the idle clock restarts.
    /// Default: 3 s.
    pub activity_debounce: Duration,
    /// Idle thresholds above this split into waiting/watching phases.
    /// Default: 10 s.
    pub two_phase_threshold: Duration,
    /// Fraction of the idle threshold spent in `Waiting` when split.
    /// Default: 0.6.
    pub first_phase_ratio: f64,
}

impl Default for ReengageConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(45),
            countdown: Duration::from_secs(5),
            activity_debounce: Duration::from_secs(3),
            two_phase_threshold: Duration::from_secs(10),
            first_phase_ratio: 0.6,
        }
    }
}

/// The host's view of whether reengagement is appropriate.
pub trait ReengageContext: Send + Sync + 'static {
    /// Gate checked when arming, at idle expiry, and at countdown expiry.
    fn can_schedule(&self) -> bool;

    /// The shared activity-token set.
    fn tokens(&self) -> &ActivityTokens;
}

struct Inner {
    phase: ReengagePhase,
    deadline: Option<DateTime<Utc>>,
    /// Bumped on every cancel/restart; stale timers no-op.
    generation: u64,
    /// Separate counter so bursts of activity collapse to one restart.
    debounce_generation: u64,
    /// The scheduler's own wait or countdown token, if one is live.
    own_token: Option<String>,
}

struct Shared<C> {
    config: ReengageConfig,
    context: C,
    action: Arc<dyn Fn(String) + Send + Sync>,
    inner: Mutex<Inner>,
}

impl<C> Shared<C> {
    fn generation_is(&self, expected: u64) -> bool {
        self.inner.lock().generation == expected
    }

    /// Drop to idle and retire the scheduler's own token, if one is live.
    /// Lock is released before touching the token set.
    fn drop_to_idle(&self) -> Option<String>
    where
        C: ReengageContext,
    {
        let token = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.debounce_generation += 1;
            inner.phase = ReengagePhase::Idle;
            inner.deadline = None;
            inner.own_token.take()
        };
        if let Some(ref t) = token {
            self.context.tokens().remove(t);
        }
        token
    }
}

/// The reengagement scheduler. Cheap to clone; clones share state.
pub struct ReengagementScheduler<C: ReengageContext> {
    shared: Arc<Shared<C>>,
}

impl<C: ReengageContext> Clone for ReengagementScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: ReengageContext> ReengagementScheduler<C> {
    pub fn new(
        config: ReengageConfig,
        context: C,
        action: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                context,
                action: Arc::new(action),
                inner: Mutex::new(Inner {
                    phase: ReengagePhase::Idle,
                    deadline: None,
                    generation: 0,
                    debounce_generation: 0,
                    own_token: None,
                }),
            }),
        }
    }

    /// Arm the idle clock. When the context forbids scheduling or a
    /// foreign activity token is live, any pending cycle is cancelled and
    /// the scheduler stays idle. Re-arming restarts the clock from zero.
    ///
    /// `reason` is for the logs; `delay_override` replaces the configured
    /// idle threshold for this cycle only.
    pub fn schedule_reengagement(&self, reason: &str, delay_override: Option<Duration>) {
        schedule_on(&self.shared, reason, delay_override);
    }

    /// Cancel any pending cycle and stay idle. Idempotent, safe before the
    /// first `schedule_reengagement`.
    pub fn cancel_reengagement(&self) {
        self.shared.drop_to_idle();
        debug!("reengagement cancelled");
    }

    /// The user did something. Cancels any pending cycle immediately;
    /// after `activity_debounce` of quiet the idle clock restarts. Bursts
    /// of activity collapse to a single restart.
    pub fn handle_user_activity(&self) {
        let (token, debounce_generation) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.debounce_generation += 1;
            inner.phase = ReengagePhase::Idle;
            inner.deadline = None;
            (inner.own_token.take(), inner.debounce_generation)
        };
        if let Some(ref t) = token {
            self.shared.context.tokens().remove(t);
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.activity_debounce).await;
            let still_current =
                shared.inner.lock().debounce_generation == debounce_generation;
            if still_current {
                schedule_on(&shared, "activity quiet", None);
            }
        });
    }

    pub fn phase(&self) -> ReengagePhase {
        self.shared.inner.lock().phase
    }

    /// When the current phase expires, if one is armed.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.lock().deadline
    }
}

fn chrono_from(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

fn schedule_on<C: ReengageContext>(
    shared: &Arc<Shared<C>>,
    reason: &str,
    delay_override: Option<Duration>,
) {
    // A gated call is not a pure no-op: any pending cycle is cancelled so
    // a stale timer cannot fire behind the gate.
    if !shared.context.can_schedule() || shared.context.tokens().is_blocked() {
        shared.drop_to_idle();
        debug!(reason, "reengagement gated: pending cycle cancelled, staying idle");
        return;
    }

    let idle = delay_override.unwrap_or(shared.config.idle_threshold);
    // Held for the whole idle wait so other subsystems can observe that a
    // nudge is pending; swapped for the countdown token at entry.
    let wait_token = mint_token(REENGAGE_CATEGORY, "wait");
    shared.context.tokens().insert(wait_token.clone());

    let (generation, stale_token) = {
        let mut inner = shared.inner.lock();
        inner.generation += 1;
        inner.phase = ReengagePhase::Waiting;
        inner.deadline = Some(Utc::now() + chrono_from(idle));
        (inner.generation, inner.own_token.replace(wait_token))
    };
    if let Some(ref old) = stale_token {
        shared.context.tokens().remove(old);
    }
    debug!(reason, idle_secs = idle.as_secs(), "reengagement armed");

    let shared = Arc::clone(shared);
    tokio::spawn(run_cycle(shared, generation, idle));
}

/// One full cycle: idle wait (one or two phases), countdown, fire. Checks
/// the generation after every sleep; a stale wake returns without touching
/// anything.
async fn run_cycle<C: ReengageContext>(shared: Arc<Shared<C>>, generation: u64, idle: Duration) {
    let config = &shared.config;

    if idle > config.two_phase_threshold {
        let first = idle.mul_f64(config.first_phase_ratio);
        tokio::time::sleep(first).await;
        if !shared.generation_is(generation) {
            return;
        }
        shared.inner.lock().phase = ReengagePhase::Watching;
        debug!("reengagement entering final idle stretch");
        tokio::time::sleep(idle - first).await;
    } else {
        tokio::time::sleep(idle).await;
    }
    if !shared.generation_is(generation) {
        return;
    }

    // Idle expired — re-validate before arming the countdown. The wait was
    // long; the world may have changed. Re-arming goes back through the
    // gate, which cancels to idle while the block persists.
    if !shared.context.can_schedule() || shared.context.tokens().is_blocked() {
        debug!("countdown preconditions failed");
        schedule_on(&shared, "blocked countdown entry", Some(idle));
        return;
    }

    // Swap the wait token for the countdown token.
    let countdown_token = mint_token(REENGAGE_CATEGORY, "countdown");
    shared.context.tokens().insert(countdown_token.clone());
    let wait_token = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            drop(inner);
            shared.context.tokens().remove(&countdown_token);
            return;
        }
        inner.phase = ReengagePhase::Countdown;
        inner.deadline = Some(Utc::now() + chrono_from(config.countdown));
        inner.own_token.replace(countdown_token)
    };
    if let Some(ref t) = wait_token {
        shared.context.tokens().remove(t);
    }
    info!(
        countdown_secs = config.countdown.as_secs(),
        "reengagement countdown armed"
    );

    tokio::time::sleep(config.countdown).await;

    // Final check. A failure here cancels outright (no restart): something
    // took over the conversation during the countdown, and it owns the
    // decision to re-arm.
    if !shared.generation_is(generation) {
        return;
    }
    if !shared.context.can_schedule() || shared.context.tokens().is_blocked() {
        shared.drop_to_idle();
        info!("reengagement cancelled at final check");
        return;
    }

    let token = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.phase = ReengagePhase::Engaging;
        inner.deadline = None;
        inner.own_token.take()
    };
    if let Some(ref token) = token {
        shared.context.tokens().remove(token);
    }
    let nudge_id = mint_token(REENGAGE_CATEGORY, "nudge");
    info!(%nudge_id, "reengagement firing");
    (shared.action)(nudge_id);

    let mut inner = shared.inner.lock();
    if inner.generation == generation {
        inner.phase = ReengagePhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestContext {
        allowed: AtomicBool,
        tokens: ActivityTokens,
    }

    impl TestContext {
        fn new() -> Self {
            Self {
                allowed: AtomicBool::new(true),
                tokens: ActivityTokens::new(),
            }
        }
    }

    impl ReengageContext for Arc<TestContext> {
        fn can_schedule(&self) -> bool {
            self.allowed.load(Ordering::SeqCst)
        }
        fn tokens(&self) -> &ActivityTokens {
            &self.tokens
        }
    }

    fn scheduler(
        config: ReengageConfig,
    ) -> (
        ReengagementScheduler<Arc<TestContext>>,
        Arc<TestContext>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let context = Arc::new(TestContext::new());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_in = Arc::clone(&fired);
        let sched = ReengagementScheduler::new(config, Arc::clone(&context), move |id| {
            fired_in.lock().push(id);
        });
        (sched, context, fired)
    }

    /// Let spawned timers register their sleeps, advance, let them run.
    async fn step(d: Duration) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(d).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_idle_threshold_and_countdown() {
        let (sched, _ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);
        assert_eq!(sched.phase(), ReengagePhase::Waiting);
        assert!(sched.deadline().is_some());

        step(Duration::from_secs(27)).await; // 60% of 45 s
        assert_eq!(sched.phase(), ReengagePhase::Watching);

        step(Duration::from_secs(18)).await;
        assert_eq!(sched.phase(), ReengagePhase::Countdown);
        assert!(fired.lock().is_empty());

        step(Duration::from_secs(5)).await;
        assert_eq!(fired.lock().len(), 1);
        assert!(fired.lock()[0].starts_with("reengage:nudge:"));
        assert_eq!(sched.phase(), ReengagePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn short_thresholds_skip_the_watching_phase() {
        let config = ReengageConfig {
            idle_threshold: Duration::from_secs(8),
            ..ReengageConfig::default()
        };
        let (sched, _ctx, _fired) = scheduler(config);
        sched.schedule_reengagement("idle", None);

        step(Duration::from_secs(6)).await; // past 60%, still one phase
        assert_eq!(sched.phase(), ReengagePhase::Waiting);

        step(Duration::from_secs(2)).await;
        assert_eq!(sched.phase(), ReengagePhase::Countdown);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_token_cancels_at_the_final_check() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);

        step(Duration::from_secs(27)).await;
        step(Duration::from_secs(18)).await;
        assert_eq!(sched.phase(), ReengagePhase::Countdown);

        // Activity starts mid-countdown.
        ctx.tokens.insert(mint_token("tool", "call"));
        step(Duration::from_secs(5)).await;

        assert!(fired.lock().is_empty());
        assert_eq!(sched.phase(), ReengagePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_token_present_at_arming_keeps_idle() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        ctx.tokens.insert(mint_token("tts", "speaking"));

        sched.schedule_reengagement("idle", None);
        assert_eq!(sched.phase(), ReengagePhase::Idle);
        assert!(sched.deadline().is_none());

        step(Duration::from_secs(60)).await;
        assert!(fired.lock().is_empty());
        assert_eq!(sched.phase(), ReengagePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn gated_call_cancels_a_pending_cycle() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);
        assert_eq!(sched.phase(), ReengagePhase::Waiting);

        // The gate closes, then someone re-arms: the armed cycle must die
        // with the gated call, not keep ticking behind it.
        ctx.allowed.store(false, Ordering::SeqCst);
        sched.schedule_reengagement("idle", None);
        assert_eq!(sched.phase(), ReengagePhase::Idle);

        step(Duration::from_secs(60)).await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_countdown_entry_cancels_to_idle() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        let token = mint_token("media", "playback");
        sched.schedule_reengagement("idle", None);
        ctx.tokens.insert(token.clone());

        step(Duration::from_secs(27)).await;
        step(Duration::from_secs(18)).await;
        // Blocked at entry: nothing may sit armed while the activity runs.
        assert_eq!(sched.phase(), ReengagePhase::Idle);
        assert!(fired.lock().is_empty());
        // The wait token was released; only the foreign token remains.
        assert_eq!(ctx.tokens.len(), 1);

        ctx.tokens.remove(&token);
        sched.schedule_reengagement("activity finished", None);
        step(Duration::from_secs(27)).await;
        step(Duration::from_secs(18)).await;
        step(Duration::from_secs(5)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_activity_resets_the_idle_clock() {
        let (sched, _ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);
        step(Duration::from_secs(30)).await;

        sched.handle_user_activity();
        assert_eq!(sched.phase(), ReengagePhase::Idle);

        // Debounce elapses, clock restarts from zero.
        step(Duration::from_secs(3)).await;
        assert_eq!(sched.phase(), ReengagePhase::Waiting);

        // The old 45 s mark passes without firing.
        step(Duration::from_secs(15)).await;
        assert!(fired.lock().is_empty());
        assert_eq!(sched.phase(), ReengagePhase::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_bursts_collapse_to_one_restart() {
        let (sched, _ctx, _fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);

        sched.handle_user_activity();
        step(Duration::from_secs(1)).await;
        sched.handle_user_activity();
        step(Duration::from_secs(1)).await;
        sched.handle_user_activity();
        assert_eq!(sched.phase(), ReengagePhase::Idle);

        step(Duration::from_secs(3)).await;
        assert_eq!(sched.phase(), ReengagePhase::Waiting);
        // One cycle armed: 45 s from the last activity's debounce.
        step(Duration::from_secs(27)).await;
        assert_eq!(sched.phase(), ReengagePhase::Watching);
    }

    #[tokio::test(start_paused = true)]
    async fn own_tokens_are_visible_but_never_self_blocking() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("idle", None);

        // The wait token is observable for the whole idle wait.
        assert_eq!(ctx.tokens.len(), 1);
        assert!(!ctx.tokens.is_blocked());

        step(Duration::from_secs(27)).await;
        assert_eq!(sched.phase(), ReengagePhase::Watching);
        assert_eq!(ctx.tokens.len(), 1);

        // Swapped (not stacked) for the countdown token at entry.
        step(Duration::from_secs(18)).await;
        assert_eq!(sched.phase(), ReengagePhase::Countdown);
        assert_eq!(ctx.tokens.len(), 1);
        assert!(!ctx.tokens.is_blocked());

        step(Duration::from_secs(5)).await;
        assert_eq!(fired.lock().len(), 1);
        assert!(ctx.tokens.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_override_replaces_the_idle_threshold_once() {
        let (sched, _ctx, fired) = scheduler(ReengageConfig::default());
        sched.schedule_reengagement("post-turn", Some(Duration::from_secs(6)));

        // 6 s is under the two-phase threshold: single waiting stretch.
        step(Duration::from_secs(6)).await;
        assert_eq!(sched.phase(), ReengagePhase::Countdown);
        step(Duration::from_secs(5)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_context_stays_idle() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        ctx.allowed.store(false, Ordering::SeqCst);

        sched.schedule_reengagement("idle", None);
        assert_eq!(sched.phase(), ReengagePhase::Idle);
        step(Duration::from_secs(60)).await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_from_any_state() {
        let (sched, ctx, fired) = scheduler(ReengageConfig::default());
        sched.cancel_reengagement();
        sched.cancel_reengagement();
        assert_eq!(sched.phase(), ReengagePhase::Idle);

        sched.schedule_reengagement("idle", None);
        step(Duration::from_secs(27)).await;
        step(Duration::from_secs(18)).await;
        sched.cancel_reengagement();
        assert_eq!(sched.phase(), ReengagePhase::Idle);
        assert!(ctx.tokens.is_empty()); // countdown token retired

        step(Duration::from_secs(60)).await;
        assert!(fired.lock().is_empty());
    }
}
