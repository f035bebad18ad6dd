use super::registry::{Effect, Phase, Registry, RetryPolicy, RunOutcome};
use super::{SyncRunner, SyncTrigger};
use crate::config::SyncConfig;
use crate::error::{FailureKind, SyncError};
use crate::sync::SyncSummary;
use ahash::AHashMap;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SyncReply = RpcReplyPort<Result<SyncSummary, SyncError>>;

#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Debounced trigger (local mutation, webhook, poll tick).
    Schedule {
        user_id: String,
        debounce: Option<Duration>,
    },
    /// Run as soon as possible and reply with that run's summary.
    SyncNow(String, SyncReply),
    Resume(String),
    Phase(String, RpcReplyPort<Phase>),

    // Internal messages (sent by the actor itself)
    TimerFired {
        user_id: String,
        generation: u64,
    },
    RunComplete {
        user_id: String,
        result: Result<SyncSummary, SyncError>,
    },
}

/// Callers waiting on the run in flight, and on the run queued after it.
#[derive(Default)]
struct Waiters {
    current: Vec<SyncReply>,
    next: Vec<SyncReply>,
}

struct OrchestratorState {
    registry: Registry,
    runner: Arc<dyn SyncRunner>,
    debounce: Duration,
    waiters: AHashMap<String, Waiters>,
}

struct OrchestratorActor;

/// Cloneable entry point into the per-user scheduler.
#[derive(Clone)]
pub struct SyncOrchestratorHandle {
    actor: ActorRef<OrchestratorMessage>,
}

impl SyncOrchestratorHandle {
    pub async fn spawn(runner: Arc<dyn SyncRunner>, cfg: &SyncConfig) -> Result<Self, SyncError> {
        let args = (runner, RetryPolicy::from_config(cfg), cfg.debounce());
        let (actor, _jh) = Actor::spawn(None, OrchestratorActor, args)
            .await
            .map_err(|e| SyncError::RactorError(format!("OrchestratorActor spawn failed: {e}")))?;
        Ok(Self { actor })
    }

    pub async fn sync_now(&self, user_id: &str) -> Result<SyncSummary, SyncError> {
        ractor::call!(self.actor, OrchestratorMessage::SyncNow, user_id.to_string())
            .map_err(|e| SyncError::RactorError(format!("SyncNow RPC failed: {e}")))?
    }

    pub fn resume(&self, user_id: &str) -> Result<(), SyncError> {
        ractor::cast!(self.actor, OrchestratorMessage::Resume(user_id.to_string()))
            .map_err(|e| SyncError::RactorError(format!("OrchestratorActor cast failed: {e}")))
    }

    pub async fn phase(&self, user_id: &str) -> Result<Phase, SyncError> {
        ractor::call!(self.actor, OrchestratorMessage::Phase, user_id.to_string())
            .map_err(|e| SyncError::RactorError(format!("Phase RPC failed: {e}")))
    }
}

impl SyncTrigger for SyncOrchestratorHandle {
    fn schedule_sync(&self, user_id: &str, debounce: Option<Duration>) -> Result<(), SyncError> {
        ractor::cast!(
            self.actor,
            OrchestratorMessage::Schedule {
                user_id: user_id.to_string(),
                debounce
            }
        )
        .map_err(|e| SyncError::RactorError(format!("OrchestratorActor cast failed: {e}")))
    }
}

fn outcome_of(result: &Result<SyncSummary, SyncError>) -> RunOutcome {
    match result {
        Ok(_) => RunOutcome::Succeeded,
        Err(e) => RunOutcome::Failed(e.failure_kind()),
    }
}

impl OrchestratorState {
    fn apply(&mut self, myself: &ActorRef<OrchestratorMessage>, user_id: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmTimer { generation, delay } => {
                    let user_id = user_id.to_string();
                    myself.send_after(delay, move || OrchestratorMessage::TimerFired {
                        user_id,
                        generation,
                    });
                }
                Effect::StartRun => {
                    let waiters = self.waiters.entry(user_id.to_string()).or_default();
                    let queued = std::mem::take(&mut waiters.next);
                    waiters.current.extend(queued);
                    self.start_run(myself, user_id);
                }
                Effect::RejectWaiters => {
                    if let Some(waiters) = self.waiters.get_mut(user_id) {
                        for reply in waiters.next.drain(..) {
                            let _ = reply.send(Err(SyncError::Suspended(user_id.to_string())));
                        }
                    }
                }
            }
        }
    }

    fn start_run(&self, myself: &ActorRef<OrchestratorMessage>, user_id: &str) {
        let runner = self.runner.clone();
        let myself = myself.clone();
        let user_id = user_id.to_string();
        debug!(user_id = %user_id, "Starting sync run");
        tokio::spawn(async move {
            let task_runner = runner.clone();
            let task_user = user_id.clone();
            let result = match tokio::spawn(async move { task_runner.run(&task_user).await }).await
            {
                Ok(result) => result,
                Err(e) => Err(SyncError::Unexpected(format!("sync run aborted: {e}"))),
            };

            if let Err(e) = &result
                && e.failure_kind() == FailureKind::Auth
                && let Err(mark_err) = runner.mark_needs_reauth(&user_id).await
            {
                warn!(user_id = %user_id, error = %mark_err, "Failed to flag credential for re-authorization");
            }

            if let Err(e) = ractor::cast!(myself, OrchestratorMessage::RunComplete { user_id, result })
            {
                warn!("Orchestrator unreachable, dropping run outcome: {}", e);
            }
        });
    }
}

#[ractor::async_trait]
impl Actor for OrchestratorActor {
    type Msg = OrchestratorMessage;
    type State = OrchestratorState;
    type Arguments = (Arc<dyn SyncRunner>, RetryPolicy, Duration);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (runner, policy, debounce): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(
            debounce_ms = debounce.as_millis() as u64,
            retry_base_ms = policy.base.as_millis() as u64,
            retry_max_ms = policy.max.as_millis() as u64,
            retry_max_attempts = policy.max_attempts,
            "Sync orchestrator started"
        );
        Ok(OrchestratorState {
            registry: Registry::new(policy),
            runner,
            debounce,
            waiters: AHashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OrchestratorMessage::Schedule { user_id, debounce } => {
                let debounce = debounce.unwrap_or(state.debounce);
                let effects = state.registry.trigger(&user_id, debounce, Instant::now());
                state.apply(&myself, &user_id, effects);
            }
            OrchestratorMessage::SyncNow(user_id, reply) => {
                state
                    .waiters
                    .entry(user_id.clone())
                    .or_default()
                    .next
                    .push(reply);
                let effects = state.registry.sync_now(&user_id);
                state.apply(&myself, &user_id, effects);
            }
            OrchestratorMessage::Resume(user_id) => {
                info!(user_id = %user_id, "Resuming sync after re-authorization");
                let effects = state.registry.resume(&user_id);
                state.apply(&myself, &user_id, effects);
            }
            OrchestratorMessage::Phase(user_id, reply) => {
                let _ = reply.send(state.registry.phase(&user_id));
            }
            OrchestratorMessage::TimerFired {
                user_id,
                generation,
            } => {
                let effects = state.registry.timer_fired(&user_id, generation);
                state.apply(&myself, &user_id, effects);
            }
            OrchestratorMessage::RunComplete { user_id, result } => {
                match &result {
                    Ok(summary) => debug!(
                        user_id = %user_id,
                        pushed = summary.push.pushed,
                        applied = summary.pull.applied,
                        "Sync run succeeded"
                    ),
                    Err(e) => warn!(user_id = %user_id, error = %e, "Sync run failed"),
                }
                if let Some(waiters) = state.waiters.get_mut(&user_id) {
                    for reply in waiters.current.drain(..) {
                        let _ = reply.send(result.clone());
                    }
                }
                let effects =
                    state
                        .registry
                        .run_completed(&user_id, outcome_of(&result), Instant::now());
                state.apply(&myself, &user_id, effects);
                if let Some(waiters) = state.waiters.get(&user_id)
                    && waiters.current.is_empty()
                    && waiters.next.is_empty()
                {
                    state.waiters.remove(&user_id);
                }
            }
        }
        Ok(())
    }
}
