//! Arena lifecycle and the per-arena loop tasks.
//!
//! The manager owns every live aggregate behind an async mutex, one loop
//! task plus three evaluation timers per running arena, and a pause gate +
//! cancellation token checked at every yield point. External commands are
//! validated against the state machine; invalid transitions are rejected,
//! not absorbed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::arena::competition::CompetitionEngine;
use crate::arena::discussion::DiscussionOrchestrator;
use crate::arena::evaluator::{EvaluationOutcome, Evaluator};
use crate::arena::llm::LlmClient;
use crate::arena::repo::ArenaRepo;
use crate::arena::stream::StreamProcessor;
use crate::arena::{
    Agent, AgentRole, Arena, ArenaConfig, ArenaState, EliminationEvent, EvalPeriod, MessageType,
    Strategy, StrategyRules, StrategyStage, ThinkingMessage,
};
use crate::clock::Clock;
use crate::error::{PlatformError, Result};

const LLM_FAILURE_LIMIT: u32 = 5;
const SCORE_ADJUST_BOUND: f64 = 50.0;

/// Cooperative pause point shared by an arena's loops.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused; wakes on resume.
    pub async fn wait(&self) {
        while self.paused.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            if !self.paused.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

struct ArenaHandle {
    arena: tokio::sync::Mutex<Arena>,
    pause: Arc<PauseGate>,
    cancel: CancellationToken,
    resume_state: parking_lot::Mutex<Option<ArenaState>>,
    loop_running: AtomicBool,
}

/// Evaluation cadence periods, configurable so tests can compress time.
#[derive(Debug, Clone)]
pub struct EvaluatorPeriods {
    pub daily: Duration,
    pub weekly: Duration,
    pub monthly: Duration,
}

impl Default for EvaluatorPeriods {
    fn default() -> Self {
        Self {
            daily: Duration::from_secs(86_400),
            weekly: Duration::from_secs(7 * 86_400),
            monthly: Duration::from_secs(30 * 86_400),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArenaStatus {
    pub arena_id: String,
    pub name: String,
    pub state: ArenaState,
    pub round_counter: u32,
    pub evaluation_counter: u32,
    pub agent_count: usize,
    pub active_strategies: usize,
    pub total_strategies: usize,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct ManagerInner {
    repo: Arc<ArenaRepo>,
    stream: Arc<StreamProcessor>,
    llm: Arc<dyn LlmClient>,
    orchestrator: DiscussionOrchestrator,
    competition: CompetitionEngine,
    evaluator: Evaluator,
    clock: Arc<dyn Clock>,
    periods: EvaluatorPeriods,
    handles: parking_lot::RwLock<HashMap<String, Arc<ArenaHandle>>>,
}

#[derive(Clone)]
pub struct ArenaManager {
    inner: Arc<ManagerInner>,
}

impl ArenaManager {
    pub fn new(
        repo: Arc<ArenaRepo>,
        stream: Arc<StreamProcessor>,
        llm: Arc<dyn LlmClient>,
        competition: CompetitionEngine,
        clock: Arc<dyn Clock>,
        periods: EvaluatorPeriods,
    ) -> Self {
        let orchestrator = DiscussionOrchestrator::new(llm.clone(), stream.clone(), clock.clone());
        let evaluator = Evaluator::new(repo.clone(), clock.clone());
        Self {
            inner: Arc::new(ManagerInner {
                repo,
                stream,
                llm,
                orchestrator,
                competition,
                evaluator,
                clock,
                periods,
                handles: parking_lot::RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Rehydrate persisted arenas at startup. Previously-active arenas come
    /// back paused; resuming them is an operator decision.
    pub fn load_persisted(&self) -> Result<usize> {
        let arenas = self.inner.repo.load_all()?;
        let count = arenas.len();
        let mut handles = self.inner.handles.write();
        for arena in arenas {
            let gate = Arc::new(PauseGate::new());
            if arena.state == ArenaState::Paused {
                gate.pause();
            }
            handles.insert(
                arena.arena_id.clone(),
                Arc::new(ArenaHandle {
                    resume_state: parking_lot::Mutex::new(Some(ArenaState::Discussing)),
                    arena: tokio::sync::Mutex::new(arena),
                    pause: gate,
                    cancel: CancellationToken::new(),
                    loop_running: AtomicBool::new(false),
                }),
            );
        }
        Ok(count)
    }

    fn handle(&self, arena_id: &str) -> Result<Arc<ArenaHandle>> {
        self.inner
            .handles
            .read()
            .get(arena_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("arena '{arena_id}'")))
    }

    // ---- commands -------------------------------------------------------

    pub fn create(&self, name: &str, config: ArenaConfig) -> Result<ArenaStatus> {
        config.validate()?;
        let arena = Arena::new(name, config, self.inner.clock.now());
        self.inner.repo.save(&arena)?;
        let status = status_of(&arena);
        self.inner.handles.write().insert(
            arena.arena_id.clone(),
            Arc::new(ArenaHandle {
                arena: tokio::sync::Mutex::new(arena),
                pause: Arc::new(PauseGate::new()),
                cancel: CancellationToken::new(),
                resume_state: parking_lot::Mutex::new(None),
                loop_running: AtomicBool::new(false),
            }),
        );
        info!(arena = %status.arena_id, name, "arena created");
        Ok(status)
    }

    pub async fn start(&self, arena_id: &str) -> Result<()> {
        let handle = self.handle(arena_id)?;
        {
            let mut arena = handle.arena.lock().await;
            if arena.state != ArenaState::Created {
                return Err(PlatformError::State(format!(
                    "cannot start arena in state '{}'",
                    arena.state.as_str()
                )));
            }
            arena.state = ArenaState::Initializing;
            self.inner.repo.save(&arena)?;
        }
        self.spawn_loops(arena_id, &handle);
        info!(arena = arena_id, "arena started");
        Ok(())
    }

    pub async fn pause(&self, arena_id: &str) -> Result<()> {
        let handle = self.handle(arena_id)?;
        let mut arena = handle.arena.lock().await;
        if !arena.state.is_active() {
            return Err(PlatformError::State(format!(
                "cannot pause arena in state '{}'",
                arena.state.as_str()
            )));
        }
        *handle.resume_state.lock() = Some(arena.state);
        arena.state = ArenaState::Paused;
        handle.pause.pause();
        self.inner.repo.save(&arena)?;
        info!(arena = arena_id, "arena paused");
        Ok(())
    }

    pub async fn resume(&self, arena_id: &str) -> Result<()> {
        let handle = self.handle(arena_id)?;
        {
            let mut arena = handle.arena.lock().await;
            if arena.state != ArenaState::Paused {
                return Err(PlatformError::State(format!(
                    "cannot resume arena in state '{}'",
                    arena.state.as_str()
                )));
            }
            let back_to = handle
                .resume_state
                .lock()
                .take()
                .unwrap_or(ArenaState::Discussing);
            arena.state = back_to;
            self.inner.repo.save(&arena)?;
        }
        handle.pause.resume();
        // Rehydrated arenas have no loop yet.
        self.spawn_loops(arena_id, &handle);
        info!(arena = arena_id, "arena resumed");
        Ok(())
    }

    pub async fn delete(&self, arena_id: &str) -> Result<()> {
        let handle = self.handle(arena_id)?;
        handle.cancel.cancel();
        handle.pause.resume(); // unblock a paused loop so it can observe the cancel
        self.inner.handles.write().remove(arena_id);
        self.inner.stream.remove(arena_id);
        self.inner.repo.delete(arena_id)?;
        info!(arena = arena_id, "arena deleted");
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    pub async fn status(&self, arena_id: &str) -> Result<ArenaStatus> {
        let handle = self.handle(arena_id)?;
        let arena = handle.arena.lock().await;
        Ok(status_of(&arena))
    }

    pub async fn strategies(&self, arena_id: &str, active_only: bool) -> Result<Vec<Strategy>> {
        let handle = self.handle(arena_id)?;
        let arena = handle.arena.lock().await;
        let mut strategies: Vec<Strategy> = arena
            .strategies
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        strategies.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        Ok(strategies)
    }

    pub async fn leaderboard(&self, arena_id: &str) -> Result<Vec<Strategy>> {
        let handle = self.handle(arena_id)?;
        let arena = handle.arena.lock().await;
        Ok(arena.leaderboard().into_iter().cloned().collect())
    }

    pub async fn eliminations(&self, arena_id: &str) -> Result<Vec<EliminationEvent>> {
        self.handle(arena_id)?;
        self.inner.repo.eliminations(arena_id)
    }

    pub fn subscribe_stream(&self, arena_id: &str) -> Result<broadcast::Receiver<ThinkingMessage>> {
        self.handle(arena_id)?;
        Ok(self.inner.stream.subscribe(arena_id))
    }

    pub fn stream(&self) -> Arc<StreamProcessor> {
        self.inner.stream.clone()
    }

    // ---- interventions --------------------------------------------------

    pub async fn evaluate(&self, arena_id: &str, period: EvalPeriod) -> Result<EvaluationOutcome> {
        let handle = self.handle(arena_id)?;
        let mut arena = handle.arena.lock().await;
        if arena.state.is_terminal() {
            return Err(PlatformError::State(format!(
                "arena is {}",
                arena.state.as_str()
            )));
        }
        self.inner.evaluator.evaluate(&mut arena, period)
    }

    /// Run one discussion round now, regardless of the loop's cadence.
    pub async fn start_discussion(&self, arena_id: &str) -> Result<u32> {
        let handle = self.handle(arena_id)?;
        let mut arena = handle.arena.lock().await;
        if arena.state == ArenaState::Created || arena.state.is_terminal() {
            return Err(PlatformError::State(format!(
                "cannot discuss in state '{}'",
                arena.state.as_str()
            )));
        }
        let round = self
            .inner
            .orchestrator
            .run_round(&mut arena, &handle.cancel, &handle.pause)
            .await?;
        self.inner.repo.save(&arena)?;
        Ok(round.round_number)
    }

    pub async fn inject_message(&self, arena_id: &str, content: &str) -> Result<()> {
        let handle = self.handle(arena_id)?;
        let arena = handle.arena.lock().await;
        self.inner.stream.publish(ThinkingMessage {
            id: Uuid::new_v4().to_string(),
            arena_id: arena.arena_id.clone(),
            agent_id: "human".to_string(),
            agent_role: AgentRole::StrategyReviewer,
            round_id: None,
            msg_type: MessageType::Intervention,
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            timestamp: self.inner.clock.now(),
        })
    }

    pub async fn adjust_score(&self, arena_id: &str, strategy_id: &str, delta: f64) -> Result<f64> {
        if !(-SCORE_ADJUST_BOUND..=SCORE_ADJUST_BOUND).contains(&delta) {
            return Err(PlatformError::State(format!(
                "score delta must be in [-{SCORE_ADJUST_BOUND}, {SCORE_ADJUST_BOUND}]"
            )));
        }
        let handle = self.handle(arena_id)?;
        let mut arena = handle.arena.lock().await;
        let strategy = arena
            .strategies
            .get_mut(strategy_id)
            .ok_or_else(|| PlatformError::NotFound(format!("strategy '{strategy_id}'")))?;
        strategy.current_score = (strategy.current_score + delta).clamp(0.0, 100.0);
        let new_score = strategy.current_score;
        self.inner.repo.save(&arena)?;
        Ok(new_score)
    }

    pub async fn eliminate_strategy(
        &self,
        arena_id: &str,
        strategy_id: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let handle = self.handle(arena_id)?;
        let mut arena = handle.arena.lock().await;
        let strategy = arena
            .strategies
            .get_mut(strategy_id)
            .ok_or_else(|| PlatformError::NotFound(format!("strategy '{strategy_id}'")))?;
        if !strategy.is_active {
            return Err(PlatformError::State(format!(
                "strategy '{strategy_id}' already eliminated"
            )));
        }
        strategy.is_active = false;
        let event = EliminationEvent {
            period: "manual".to_string(),
            strategy_id: strategy_id.to_string(),
            score: strategy.current_score,
            reason: reason.unwrap_or("manual").to_string(),
            timestamp: self.inner.clock.now(),
        };
        self.inner.repo.append_elimination(arena_id, &event)?;
        self.inner.repo.save(&arena)?;
        Ok(())
    }

    // ---- loops ----------------------------------------------------------

    fn spawn_loops(&self, arena_id: &str, handle: &Arc<ArenaHandle>) {
        if handle.loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = handle.clone();
        let arena_id = arena_id.to_string();
        spawn_eval_timers(&inner, &handle, &arena_id);
        tokio::spawn(async move {
            run_arena_loop(inner, handle.clone(), arena_id).await;
            handle.loop_running.store(false, Ordering::SeqCst);
        });
    }
}

fn status_of(arena: &Arena) -> ArenaStatus {
    ArenaStatus {
        arena_id: arena.arena_id.clone(),
        name: arena.name.clone(),
        state: arena.state,
        round_counter: arena.round_counter,
        evaluation_counter: arena.evaluation_counter,
        agent_count: arena.agents.len(),
        active_strategies: arena.active_strategies().len(),
        total_strategies: arena.strategies.len(),
        last_error: arena.last_error.clone(),
        created_at: arena.created_at,
    }
}

fn spawn_eval_timers(inner: &Arc<ManagerInner>, handle: &Arc<ArenaHandle>, arena_id: &str) {
    for (period, every) in [
        (EvalPeriod::Daily, inner.periods.daily),
        (EvalPeriod::Weekly, inner.periods.weekly),
        (EvalPeriod::Monthly, inner.periods.monthly),
    ] {
        let inner = inner.clone();
        let handle = handle.clone();
        let arena_id = arena_id.to_string();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // swallow the immediate first tick
            loop {
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if handle.pause.is_paused() {
                            continue;
                        }
                        let mut arena = handle.arena.lock().await;
                        if arena.state.is_terminal() || arena.state == ArenaState::Created {
                            continue;
                        }
                        if let Err(e) = inner.evaluator.evaluate(&mut arena, period) {
                            warn!(arena = %arena_id, period = period.as_str(), error = %e, "cadence evaluation failed");
                        }
                    }
                }
            }
        });
    }
}

async fn run_arena_loop(inner: Arc<ManagerInner>, handle: Arc<ArenaHandle>, arena_id: String) {
    let cancel = handle.cancel.clone();
    let mut llm_failures = 0u32;
    let mut cycles = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        handle.pause.wait().await;
        if cancel.is_cancelled() {
            break;
        }

        let state = { handle.arena.lock().await.state };
        let step: Result<()> = match state {
            ArenaState::Initializing => initialize_arena(&inner, &handle).await,
            ArenaState::Discussing => {
                let mut arena = handle.arena.lock().await;
                match inner
                    .orchestrator
                    .run_round(&mut arena, &cancel, &handle.pause)
                    .await
                {
                    Ok(_) => {
                        if arena.round_counter % arena.config.discussion_max_rounds == 0 {
                            arena.state = ArenaState::Backtesting;
                        }
                        inner.repo.save(&arena).map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            ArenaState::Backtesting => {
                let mut arena = handle.arena.lock().await;
                inner
                    .competition
                    .run_stage(&mut arena, StrategyStage::Backtest)
                    .and_then(|_| {
                        arena.state = ArenaState::Simulating;
                        inner.repo.save(&arena)
                    })
            }
            ArenaState::Simulating => {
                let mut arena = handle.arena.lock().await;
                inner
                    .competition
                    .run_stage(&mut arena, StrategyStage::Simulated)
                    .and_then(|_| inner.competition.run_stage(&mut arena, StrategyStage::Live))
                    .and_then(|_| {
                        arena.state = ArenaState::Evaluating;
                        inner.repo.save(&arena)
                    })
            }
            ArenaState::Evaluating => {
                let mut arena = handle.arena.lock().await;
                // The cadence timers own elimination; the in-loop pass is a
                // rank refresh.
                inner
                    .evaluator
                    .evaluate(&mut arena, EvalPeriod::Daily)
                    .and_then(|_| {
                        cycles += 1;
                        let done =
                            arena.config.max_cycles > 0 && cycles >= arena.config.max_cycles;
                        arena.state = if done {
                            ArenaState::Completed
                        } else {
                            ArenaState::Discussing
                        };
                        inner.repo.save(&arena)
                    })
            }
            ArenaState::Paused => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            ArenaState::Created | ArenaState::Completed | ArenaState::Failed => break,
        };

        match step {
            Ok(()) => {
                llm_failures = 0;
            }
            Err(e) => {
                llm_failures += 1;
                warn!(
                    arena = %arena_id,
                    failures = llm_failures,
                    error = %e,
                    "arena step failed"
                );
                let mut arena = handle.arena.lock().await;
                arena.last_error = Some(e.to_string());
                let _ = inner.stream.publish(ThinkingMessage {
                    id: Uuid::new_v4().to_string(),
                    arena_id: arena.arena_id.clone(),
                    agent_id: "system".to_string(),
                    agent_role: AgentRole::QuantResearcher,
                    round_id: None,
                    msg_type: MessageType::Error,
                    content: e.to_string(),
                    metadata: serde_json::Value::Null,
                    timestamp: inner.clock.now(),
                });
                if llm_failures >= LLM_FAILURE_LIMIT {
                    error!(arena = %arena_id, "failure limit reached, arena failed");
                    arena.state = ArenaState::Failed;
                }
                if let Err(save_err) = inner.repo.save(&arena) {
                    error!(arena = %arena_id, error = %save_err, "failed to persist arena error");
                }
                drop(arena);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        // Yield between phases so commands are never starved.
        tokio::task::yield_now().await;
    }
    // Terminal exit also stops this arena's cadence timers.
    cancel.cancel();
    info!(arena = %arena_id, "arena loop exited");
}

/// Instantiate agents across the declared roles (a generator always comes
/// first) and seed one strategy per generator via the LLM.
async fn initialize_arena(inner: &Arc<ManagerInner>, handle: &Arc<ArenaHandle>) -> Result<()> {
    let mut arena = handle.arena.lock().await;
    let count = arena.config.agent_count;

    arena.agents = (0..count)
        .map(|i| {
            let role = AgentRole::ALL[i % AgentRole::ALL.len()];
            Agent {
                agent_id: format!("agent-{}", i + 1),
                name: format!("{}-{}", role.as_str(), i / AgentRole::ALL.len() + 1),
                role,
            }
        })
        .collect();

    let generators: Vec<Agent> = arena
        .agents
        .iter()
        .filter(|a| a.role == AgentRole::StrategyGenerator)
        .cloned()
        .collect();
    for (i, agent) in generators.iter().enumerate() {
        let logic = inner
            .llm
            .complete(
                "You design trading strategies for A-share equities. Answer with a one-paragraph strategy description.",
                &format!(
                    "Propose an initial strategy for agent {} (variant {}).",
                    agent.name,
                    i + 1
                ),
            )
            .await?;
        let strategy_id = Uuid::new_v4().to_string();
        let mut rules = StrategyRules::default();
        rules.momentum_window = 10 + 5 * i;
        arena.strategies.insert(
            strategy_id.clone(),
            Strategy {
                strategy_id,
                name: format!("strategy-{}", i + 1),
                agent_id: agent.agent_id.clone(),
                agent_role: agent.role,
                stage: StrategyStage::Backtest,
                is_active: true,
                current_score: 50.0,
                current_rank: (i + 1) as u32,
                logic,
                rules,
                dimension_scores: Default::default(),
            },
        );
    }

    arena.state = ArenaState::Discussing;
    inner.repo.save(&arena)?;
    inner.stream.publish(ThinkingMessage::system(
        &arena.arena_id,
        &format!(
            "arena initialized: {} agents, {} seed strategies",
            arena.agents.len(),
            arena.strategies.len()
        ),
        inner.clock.now(),
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::llm::ScriptedLlm;
    use crate::clock::SystemClock;
    use crate::store::ods::OdsStore;
    use crate::store::MetaDb;

    fn manager() -> ArenaManager {
        let db = MetaDb::open_in_memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let repo = Arc::new(ArenaRepo::new(db.clone()));
        let stream = Arc::new(StreamProcessor::new(repo.clone(), clock.clone()));
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let competition =
            CompetitionEngine::new(Arc::new(OdsStore::new(db, clock.clone())), clock.clone());
        ArenaManager::new(repo, stream, llm, competition, clock, EvaluatorPeriods::default())
    }

    #[tokio::test]
    async fn create_validates_agent_count() {
        let manager = manager();
        let mut config = ArenaConfig::default();
        config.agent_count = 2;
        assert!(manager.create("tiny", config).is_err());
    }

    #[tokio::test]
    async fn start_requires_created_state() {
        let manager = manager();
        let status = manager.create("a", ArenaConfig::default()).unwrap();
        manager.start(&status.arena_id).await.unwrap();
        // Second start is an invalid transition.
        let err = manager.start(&status.arena_id).await.unwrap_err();
        assert!(matches!(err, PlatformError::State(_)));
    }

    #[tokio::test]
    async fn pause_and_resume_roundtrip() {
        let manager = manager();
        let status = manager.create("a", ArenaConfig::default()).unwrap();
        let id = status.arena_id;
        manager.start(&id).await.unwrap();

        // Wait for initialization to leave `created`.
        for _ in 0..100 {
            if manager.status(&id).await.unwrap().state.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.pause(&id).await.unwrap();
        assert_eq!(manager.status(&id).await.unwrap().state, ArenaState::Paused);

        manager.resume(&id).await.unwrap();
        assert!(manager.status(&id).await.unwrap().state.is_active());

        manager.delete(&id).await.unwrap();
        assert!(manager.status(&id).await.is_err());
    }

    #[tokio::test]
    async fn adjust_score_bounds() {
        let manager = manager();
        let status = manager.create("a", ArenaConfig::default()).unwrap();
        let err = manager
            .adjust_score(&status.arena_id, "nope", 51.0)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::State(_)));

        let err = manager
            .adjust_score(&status.arena_id, "nope", 10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }
}
