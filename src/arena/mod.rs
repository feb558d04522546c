//! Strategy arena domain model.
//!
//! An `Arena` is one aggregate: its strategies, agents and discussion
//! rounds live inside it keyed by id. There are no back-pointers; anything
//! that needs a child goes through the arena-scoped index.

pub mod competition;
pub mod discussion;
pub mod evaluator;
pub mod llm;
pub mod manager;
pub mod repo;
pub mod stream;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PlatformError, Result};

pub const MIN_AGENT_COUNT: usize = 3;
pub const MAX_AGENT_COUNT: usize = 10;
const WEIGHT_SUM_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArenaState {
    Created,
    Initializing,
    Discussing,
    Backtesting,
    Simulating,
    Evaluating,
    Paused,
    Completed,
    Failed,
}

impl ArenaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArenaState::Created => "created",
            ArenaState::Initializing => "initializing",
            ArenaState::Discussing => "discussing",
            ArenaState::Backtesting => "backtesting",
            ArenaState::Simulating => "simulating",
            ArenaState::Evaluating => "evaluating",
            ArenaState::Paused => "paused",
            ArenaState::Completed => "completed",
            ArenaState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ArenaState::Created),
            "initializing" => Some(ArenaState::Initializing),
            "discussing" => Some(ArenaState::Discussing),
            "backtesting" => Some(ArenaState::Backtesting),
            "simulating" => Some(ArenaState::Simulating),
            "evaluating" => Some(ArenaState::Evaluating),
            "paused" => Some(ArenaState::Paused),
            "completed" => Some(ArenaState::Completed),
            "failed" => Some(ArenaState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArenaState::Completed | ArenaState::Failed)
    }

    /// States the internal loop cycles through; `Paused` is reachable from
    /// any of these and resumes back into the same state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ArenaState::Initializing
                | ArenaState::Discussing
                | ArenaState::Backtesting
                | ArenaState::Simulating
                | ArenaState::Evaluating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    StrategyGenerator,
    StrategyReviewer,
    RiskAnalyst,
    MarketSentiment,
    QuantResearcher,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::StrategyGenerator,
        AgentRole::StrategyReviewer,
        AgentRole::RiskAnalyst,
        AgentRole::MarketSentiment,
        AgentRole::QuantResearcher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::StrategyGenerator => "strategy_generator",
            AgentRole::StrategyReviewer => "strategy_reviewer",
            AgentRole::RiskAnalyst => "risk_analyst",
            AgentRole::MarketSentiment => "market_sentiment",
            AgentRole::QuantResearcher => "quant_researcher",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStage {
    Backtest,
    Simulated,
    Live,
}

impl StrategyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStage::Backtest => "backtest",
            StrategyStage::Simulated => "simulated",
            StrategyStage::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backtest" => Some(StrategyStage::Backtest),
            "simulated" => Some(StrategyStage::Simulated),
            "live" => Some(StrategyStage::Live),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<StrategyStage> {
        match self {
            StrategyStage::Backtest => Some(StrategyStage::Simulated),
            StrategyStage::Simulated => Some(StrategyStage::Live),
            StrategyStage::Live => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub role: AgentRole,
}

/// Tunable parameters a strategy's discussion rounds refine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRules {
    pub momentum_window: usize,
    pub position_size: f64,
    pub mean_reversion_bias: f64,
    pub stop_loss_pct: f64,
}

impl Default for StrategyRules {
    fn default() -> Self {
        Self {
            momentum_window: 20,
            position_size: 0.5,
            mean_reversion_bias: 0.0,
            stop_loss_pct: 8.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DimensionScores {
    pub profitability: f64,
    pub risk_control: f64,
    pub stability: f64,
    pub adaptability: f64,
}

/// Composite-score weights. The four dimensions must sum to exactly 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvaluationWeights {
    pub profitability: f64,
    pub risk_control: f64,
    pub stability: f64,
    pub adaptability: f64,
}

impl Default for EvaluationWeights {
    fn default() -> Self {
        Self {
            profitability: 0.30,
            risk_control: 0.30,
            stability: 0.20,
            adaptability: 0.20,
        }
    }
}

impl EvaluationWeights {
    pub fn validate(&self) -> Result<()> {
        let sum = self.profitability + self.risk_control + self.stability + self.adaptability;
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(PlatformError::State(format!(
                "dimension weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }

    pub fn composite(&self, scores: &DimensionScores) -> f64 {
        let raw = self.profitability * scores.profitability
            + self.risk_control * scores.risk_control
            + self.stability * scores.stability
            + self.adaptability * scores.adaptability;
        raw.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_id: String,
    pub name: String,
    pub agent_id: String,
    pub agent_role: AgentRole,
    pub stage: StrategyStage,
    pub is_active: bool,
    pub current_score: f64,
    pub current_rank: u32,
    pub logic: String,
    pub rules: StrategyRules,
    pub dimension_scores: DimensionScores,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionMode {
    Debate,
    Collaboration,
    Review,
}

impl DiscussionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscussionMode::Debate => "debate",
            DiscussionMode::Collaboration => "collaboration",
            DiscussionMode::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debate" => Some(DiscussionMode::Debate),
            "collaboration" => Some(DiscussionMode::Collaboration),
            "review" => Some(DiscussionMode::Review),
            _ => None,
        }
    }

    /// Round modes rotate in a fixed order.
    pub fn for_round(round_number: u32) -> Self {
        match round_number % 3 {
            1 => DiscussionMode::Debate,
            2 => DiscussionMode::Collaboration,
            _ => DiscussionMode::Review,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionRound {
    pub round_id: String,
    pub round_number: u32,
    pub mode: DiscussionMode,
    pub participants: Vec<String>,
    pub conclusions: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Thinking,
    Argument,
    Conclusion,
    Intervention,
    System,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Thinking => "thinking",
            MessageType::Argument => "argument",
            MessageType::Conclusion => "conclusion",
            MessageType::Intervention => "intervention",
            MessageType::System => "system",
            MessageType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "thinking" => Some(MessageType::Thinking),
            "argument" => Some(MessageType::Argument),
            "conclusion" => Some(MessageType::Conclusion),
            "intervention" => Some(MessageType::Intervention),
            "system" => Some(MessageType::System),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// One entry in an arena's append-only deliberation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingMessage {
    pub id: String,
    pub arena_id: String,
    pub agent_id: String,
    pub agent_role: AgentRole,
    pub round_id: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub content: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ThinkingMessage {
    pub fn system(arena_id: &str, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            arena_id: arena_id.to_string(),
            agent_id: "system".to_string(),
            agent_role: AgentRole::QuantResearcher,
            round_id: None,
            msg_type: MessageType::System,
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EliminationEvent {
    pub period: String,
    pub strategy_id: String,
    pub score: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl EvalPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalPeriod::Daily => "daily",
            EvalPeriod::Weekly => "weekly",
            EvalPeriod::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(EvalPeriod::Daily),
            "weekly" => Some(EvalPeriod::Weekly),
            "monthly" => Some(EvalPeriod::Monthly),
            _ => None,
        }
    }

    /// Fraction of the active field eliminated at this cadence.
    pub fn elimination_ratio(&self) -> f64 {
        match self {
            EvalPeriod::Daily => 0.0,
            EvalPeriod::Weekly => 0.20,
            EvalPeriod::Monthly => 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub agent_count: usize,
    pub discussion_max_rounds: u32,
    pub min_active_strategies: usize,
    pub weights: EvaluationWeights,
    /// Instruments scored against; empty means the whole daily-bar table.
    pub universe: Vec<String>,
    /// Composite score a strategy must clear to advance a stage.
    pub stage_threshold: f64,
    pub backtest_window_days: i64,
    /// Competition cycles before the arena completes; 0 = run until stopped.
    pub max_cycles: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            agent_count: 5,
            discussion_max_rounds: 5,
            min_active_strategies: 3,
            weights: EvaluationWeights::default(),
            universe: Vec::new(),
            stage_threshold: 60.0,
            backtest_window_days: 365,
            max_cycles: 0,
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_AGENT_COUNT..=MAX_AGENT_COUNT).contains(&self.agent_count) {
            return Err(PlatformError::State(format!(
                "agent_count must be in [{MIN_AGENT_COUNT}, {MAX_AGENT_COUNT}], got {}",
                self.agent_count
            )));
        }
        if self.min_active_strategies == 0 {
            return Err(PlatformError::State(
                "min_active_strategies must be at least 1".to_string(),
            ));
        }
        if self.discussion_max_rounds == 0 {
            return Err(PlatformError::State(
                "discussion_max_rounds must be at least 1".to_string(),
            ));
        }
        self.weights.validate()
    }
}

/// The aggregate. Children are indexed by id; external code addresses them
/// through the arena, never the other way around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arena {
    pub arena_id: String,
    pub name: String,
    pub config: ArenaConfig,
    pub state: ArenaState,
    pub created_at: DateTime<Utc>,
    pub round_counter: u32,
    pub evaluation_counter: u32,
    pub last_error: Option<String>,
    pub agents: Vec<Agent>,
    pub strategies: HashMap<String, Strategy>,
    pub rounds: Vec<DiscussionRound>,
}

impl Arena {
    pub fn new(name: &str, config: ArenaConfig, now: DateTime<Utc>) -> Self {
        Self {
            arena_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            config,
            state: ArenaState::Created,
            created_at: now,
            round_counter: 0,
            evaluation_counter: 0,
            last_error: None,
            agents: Vec::new(),
            strategies: HashMap::new(),
            rounds: Vec::new(),
        }
    }

    pub fn active_strategies(&self) -> Vec<&Strategy> {
        let mut active: Vec<&Strategy> = self
            .strategies
            .values()
            .filter(|s| s.is_active)
            .collect();
        active.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        active
    }

    /// Active strategies ranked by composite score descending; ties go to
    /// the earlier-assigned (lower) rank, which makes ordering
    /// deterministic.
    pub fn leaderboard(&self) -> Vec<&Strategy> {
        let mut board = self.active_strategies();
        board.sort_by(|a, b| {
            b.current_score
                .partial_cmp(&a.current_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.current_rank.cmp(&b.current_rank))
        });
        board
    }

    pub fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}
