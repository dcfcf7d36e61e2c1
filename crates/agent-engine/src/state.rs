use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Polling regime the main loop is in. `Active` is time-bounded by
/// `active_gear_until`; everything else is derived per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Active,
    Idle,
}

/// Mutable agent state, guarded by the single lock in [`AgentShared`].
/// Timers and maps are always updated together under that lock.
pub(crate) struct AgentState {
    pub(crate) mode: Mode,
    /// While `now < active_gear_until` the agent stays in the ACTIVE tier.
    pub(crate) active_gear_until: Option<Instant>,
    /// `None` means a claim is allowed immediately (reset by wakeup).
    pub(crate) last_claim_time: Option<Instant>,
    pub(crate) last_job_time: Instant,
    pub(crate) heartbeat_misses: u32,
    /// job id -> owning worker name. Size never exceeds the pool size.
    pub(crate) active_jobs: HashMap<i64, String>,
    /// job id -> transcoder subprocess pid. Inserted and removed only by the
    /// owning worker; the watchdog snapshots it before terminating anything.
    pub(crate) active_procs: HashMap<i64, u32>,
    /// Suppresses new claims; in-flight work continues.
    pub(crate) paused: bool,
}

/// Process-wide shared handle. `ram_critical` and `running` are monotonic
/// flags and safe to read without the lock; everything else lives in `state`.
pub(crate) struct AgentShared {
    pub(crate) state: Mutex<AgentState>,
    ram_critical: AtomicBool,
    running: AtomicBool,
    /// Depth of the engine's pending queue, mirrored for heartbeat/status.
    pub(crate) queue_depth: AtomicUsize,
    /// Jobs interrupted out-of-band (watchdog kill); their pipelines must not
    /// emit a second terminal call.
    pub(crate) interrupted: Mutex<HashSet<i64>>,
    /// One-shot signal that collapses any sleep tier. `notify_one` stores a
    /// permit, so a wakeup that lands mid-tick still preempts the next sleep.
    pub(crate) wakeup: tokio::sync::Notify,
    pub(crate) started_at: Instant,
}

impl AgentShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AgentState {
                mode: Mode::Idle,
                active_gear_until: None,
                last_claim_time: None,
                last_job_time: Instant::now(),
                heartbeat_misses: 0,
                active_jobs: HashMap::new(),
                active_procs: HashMap::new(),
                paused: false,
            }),
            ram_critical: AtomicBool::new(false),
            running: AtomicBool::new(true),
            queue_depth: AtomicUsize::new(0),
            interrupted: Mutex::new(HashSet::new()),
            wakeup: tokio::sync::Notify::new(),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, AgentState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.wakeup.notify_one();
        }
    }

    pub(crate) fn is_ram_critical(&self) -> bool {
        self.ram_critical.load(Ordering::SeqCst)
    }

    /// Latch the critical-RAM flag. Never clears for the process lifetime.
    pub(crate) fn latch_ram_critical(&self) {
        self.ram_critical.store(true, Ordering::SeqCst);
    }

    /// Collapse the sleep hierarchy: enter ACTIVE, extend the gear window,
    /// allow an immediate claim, and preempt the current sleep.
    pub(crate) fn trigger_wakeup(&self, gear: Duration) {
        {
            let mut state = self.lock_state();
            state.mode = Mode::Active;
            state.active_gear_until = Some(Instant::now() + gear);
            state.last_claim_time = None;
        }
        self.wakeup.notify_one();
    }

    pub(crate) fn mark_interrupted(&self, job_id: i64) {
        match self.interrupted.lock() {
            Ok(mut set) => {
                set.insert(job_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(job_id);
            }
        }
    }

    pub(crate) fn was_interrupted(&self, job_id: i64) -> bool {
        match self.interrupted.lock() {
            Ok(set) => set.contains(&job_id),
            Err(poisoned) => poisoned.into_inner().contains(&job_id),
        }
    }

    pub(crate) fn uptime_hours(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() / 3600.0
    }
}

/// Effective wait tier for one main-loop tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollTier {
    Active,
    Idle,
    Deep1,
    Deep2,
}

/// Tier selection. ACTIVE wins while the gear window holds; repeated
/// heartbeat silence outranks ordinary idle aging.
pub(crate) fn select_tier(
    mode: Mode,
    heartbeat_misses: u32,
    idle_for: Duration,
    idle_to_deep_threshold: Duration,
) -> PollTier {
    if mode == Mode::Active {
        PollTier::Active
    } else if heartbeat_misses >= 3 {
        PollTier::Deep2
    } else if idle_for >= idle_to_deep_threshold {
        PollTier::Deep1
    } else {
        PollTier::Idle
    }
}

/// Claim admission for one tick. All four conditions are evaluated against a
/// single snapshot taken under the agent lock.
pub(crate) fn claim_admitted(
    ram_critical: bool,
    paused: bool,
    active_jobs: usize,
    max_concurrent: usize,
    since_last_claim: Option<Duration>,
    active_wait: Duration,
) -> bool {
    if ram_critical || paused || active_jobs >= max_concurrent {
        return false;
    }
    match since_last_claim {
        None => true,
        Some(elapsed) => elapsed >= active_wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const DEEP_THRESHOLD: Duration = Duration::from_secs(7200);

    #[test]
    fn active_gear_beats_everything() {
        assert_eq!(
            select_tier(Mode::Active, 5, Duration::from_secs(100_000), DEEP_THRESHOLD),
            PollTier::Active
        );
    }

    #[test]
    fn idle_ages_into_deep1() {
        assert_eq!(select_tier(Mode::Idle, 0, HOUR, DEEP_THRESHOLD), PollTier::Idle);
        assert_eq!(
            select_tier(Mode::Idle, 0, DEEP_THRESHOLD, DEEP_THRESHOLD),
            PollTier::Deep1
        );
    }

    #[test]
    fn heartbeat_silence_escalates_to_deep2() {
        assert_eq!(select_tier(Mode::Idle, 2, HOUR, DEEP_THRESHOLD), PollTier::Idle);
        assert_eq!(select_tier(Mode::Idle, 3, HOUR, DEEP_THRESHOLD), PollTier::Deep2);
        // Deep2 outranks idle aging.
        assert_eq!(
            select_tier(Mode::Idle, 3, DEEP_THRESHOLD * 2, DEEP_THRESHOLD),
            PollTier::Deep2
        );
    }

    #[test]
    fn claim_blocked_by_flags_and_capacity() {
        let wait = Duration::from_secs(60);
        assert!(claim_admitted(false, false, 0, 4, None, wait));
        assert!(!claim_admitted(true, false, 0, 4, None, wait));
        assert!(!claim_admitted(false, true, 0, 4, None, wait));
        assert!(!claim_admitted(false, false, 4, 4, None, wait));
    }

    #[test]
    fn claim_rate_limited_by_active_wait() {
        let wait = Duration::from_secs(60);
        assert!(!claim_admitted(false, false, 0, 4, Some(Duration::from_secs(59)), wait));
        assert!(claim_admitted(false, false, 0, 4, Some(wait), wait));
    }

    #[test]
    fn wakeup_resets_claim_timer_and_mode() {
        let shared = AgentShared::new();
        {
            let mut state = shared.lock_state();
            state.last_claim_time = Some(Instant::now());
            state.mode = Mode::Idle;
        }
        shared.trigger_wakeup(Duration::from_secs(300));
        let state = shared.lock_state();
        assert_eq!(state.mode, Mode::Active);
        assert!(state.last_claim_time.is_none());
        assert!(state.active_gear_until.is_some());
    }

    #[test]
    fn interrupted_set_is_sticky() {
        let shared = AgentShared::new();
        assert!(!shared.was_interrupted(7));
        shared.mark_interrupted(7);
        assert!(shared.was_interrupted(7));
    }
}
