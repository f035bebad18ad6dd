use crate::config::SyncConfig;
use crate::error::FailureKind;
use ahash::AHashMap;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;
use tokio::time::Instant;

/// Scheduling phase of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled { deadline: Instant },
    /// Doubles as the per-user lock: at most one run per user is in flight.
    Running,
    Backoff { until: Instant },
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(FailureKind),
}

/// Side effects the actor performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Deliver `TimerFired(generation)` after `delay`.
    ArmTimer { generation: u64, delay: Duration },
    StartRun,
    /// Fail every queued sync-now caller with a suspension error.
    RejectWaiters,
}

/// Exponential backoff between failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive transient failures retried before the user returns to idle.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.retry_base_ms),
            max: Duration::from_millis(cfg.retry_max_ms),
            max_attempts: cfg.retry_max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), within `[base, max]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as usize;
        ExponentialBuilder::default()
            .with_min_delay(self.base)
            .with_max_delay(self.max)
            .with_factor(2.0)
            .with_max_times(attempt)
            .build()
            .nth(attempt - 1)
            .unwrap_or(self.max)
            .clamp(self.base, self.max)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    phase: Phase,
    generation: u64,
    rerun_requested: bool,
    sync_now_pending: bool,
    attempt: u32,
    debounce: Duration,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            generation: 0,
            rerun_requested: false,
            sync_now_pending: false,
            attempt: 0,
            debounce: Duration::ZERO,
        }
    }
}

impl Slot {
    /// Nothing pending and nothing worth remembering.
    fn is_dormant(&self) -> bool {
        self.phase == Phase::Idle
            && self.attempt == 0
            && !self.rerun_requested
            && !self.sync_now_pending
    }

    fn arm(&mut self, delay: Duration, phase: Phase) -> Vec<Effect> {
        self.generation += 1;
        self.phase = phase;
        vec![Effect::ArmTimer {
            generation: self.generation,
            delay,
        }]
    }

    fn start(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.phase = Phase::Running;
        vec![Effect::StartRun]
    }

    /// Leave `Running` without retrying: serve queued work or go idle.
    fn settle(&mut self, now: Instant) -> Vec<Effect> {
        if self.sync_now_pending {
            self.sync_now_pending = false;
            self.rerun_requested = false;
            self.start()
        } else if self.rerun_requested {
            self.rerun_requested = false;
            let delay = self.debounce;
            self.arm(delay, Phase::Scheduled {
                deadline: now + delay,
            })
        } else {
            self.phase = Phase::Idle;
            Vec::new()
        }
    }
}

/// Pure per-user scheduling state. Every transition takes `now` and returns the effects to run.
#[derive(Debug)]
pub struct Registry {
    slots: AHashMap<String, Slot>,
    policy: RetryPolicy,
    /// Highest generation of any dropped slot. New slots count on from here, so a timer armed
    /// before a slot was dropped never matches its successor.
    retired_generation: u64,
}

impl Registry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            slots: AHashMap::new(),
            policy,
            retired_generation: 0,
        }
    }

    pub fn phase(&self, user_id: &str) -> Phase {
        self.slots
            .get(user_id)
            .map_or(Phase::Idle, |slot| slot.phase)
    }

    pub fn attempt(&self, user_id: &str) -> u32 {
        self.slots.get(user_id).map_or(0, |slot| slot.attempt)
    }

    fn slot(&mut self, user_id: &str) -> &mut Slot {
        let floor = self.retired_generation;
        self.slots
            .entry(user_id.to_string())
            .or_insert_with(|| Slot {
                generation: floor,
                ..Default::default()
            })
    }

    fn prune(&mut self, user_id: &str) {
        if let Some(slot) = self.slots.get(user_id)
            && slot.is_dormant()
        {
            self.retired_generation = self.retired_generation.max(slot.generation);
            self.slots.remove(user_id);
        }
    }

    /// Debounced trigger; every trigger while scheduled pushes the deadline out again.
    pub fn trigger(&mut self, user_id: &str, debounce: Duration, now: Instant) -> Vec<Effect> {
        let slot = self.slot(user_id);
        match slot.phase {
            Phase::Idle | Phase::Scheduled { .. } => {
                slot.debounce = debounce;
                slot.arm(debounce, Phase::Scheduled {
                    deadline: now + debounce,
                })
            }
            Phase::Running => {
                slot.debounce = debounce;
                slot.rerun_requested = true;
                Vec::new()
            }
            Phase::Backoff { .. } | Phase::Suspended => Vec::new(),
        }
    }

    pub fn sync_now(&mut self, user_id: &str) -> Vec<Effect> {
        let slot = self.slot(user_id);
        match slot.phase {
            Phase::Idle | Phase::Scheduled { .. } | Phase::Backoff { .. } => {
                slot.attempt = 0;
                slot.start()
            }
            Phase::Running => {
                slot.rerun_requested = true;
                slot.sync_now_pending = true;
                Vec::new()
            }
            Phase::Suspended => vec![Effect::RejectWaiters],
        }
    }

    /// Timers from a superseded generation are ignored.
    pub fn timer_fired(&mut self, user_id: &str, generation: u64) -> Vec<Effect> {
        let Some(slot) = self.slots.get_mut(user_id) else {
            return Vec::new();
        };
        if slot.generation != generation {
            return Vec::new();
        }
        match slot.phase {
            Phase::Scheduled { .. } | Phase::Backoff { .. } => slot.start(),
            _ => Vec::new(),
        }
    }

    pub fn run_completed(&mut self, user_id: &str, outcome: RunOutcome, now: Instant) -> Vec<Effect> {
        let effects = self.complete(user_id, outcome, now);
        self.prune(user_id);
        effects
    }

    fn complete(&mut self, user_id: &str, outcome: RunOutcome, now: Instant) -> Vec<Effect> {
        let policy = self.policy;
        let slot = self.slot(user_id);
        if slot.phase != Phase::Running {
            return Vec::new();
        }

        match outcome {
            RunOutcome::Succeeded | RunOutcome::Failed(FailureKind::Fatal) => {
                slot.attempt = 0;
                slot.settle(now)
            }
            RunOutcome::Failed(FailureKind::Auth) => {
                slot.attempt = 0;
                slot.rerun_requested = false;
                slot.sync_now_pending = false;
                slot.generation += 1;
                slot.phase = Phase::Suspended;
                vec![Effect::RejectWaiters]
            }
            RunOutcome::Failed(FailureKind::Transient) => {
                slot.attempt += 1;
                if slot.sync_now_pending {
                    return slot.settle(now);
                }
                if slot.attempt <= policy.max_attempts {
                    let delay = policy.delay(slot.attempt);
                    slot.rerun_requested = false;
                    slot.arm(delay, Phase::Backoff { until: now + delay })
                } else {
                    slot.attempt = 0;
                    slot.settle(now)
                }
            }
        }
    }

    pub fn resume(&mut self, user_id: &str) -> Vec<Effect> {
        if let Some(slot) = self.slots.get_mut(user_id)
            && slot.phase == Phase::Suspended
        {
            slot.generation += 1;
            slot.phase = Phase::Idle;
        }
        self.prune(user_id);
        Vec::new()
    }
}
