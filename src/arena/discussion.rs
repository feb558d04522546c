//! Multi-round agent discussion orchestration.
//!
//! One round picks participants by mode, walks each of them through a
//! thinking -> argument -> conclusion message sequence generated by the
//! LLM, and lands every message on the stream processor. Rounds are
//! cancellable between participants; an in-flight generation is abandoned
//! at the next token boundary.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::arena::llm::LlmClient;
use crate::arena::manager::PauseGate;
use crate::arena::stream::StreamProcessor;
use crate::arena::{
    Agent, AgentRole, Arena, DiscussionMode, DiscussionRound, MessageType, ThinkingMessage,
};
use crate::clock::Clock;
use crate::error::{PlatformError, Result};

enum Generation {
    Text(String),
    Abandoned,
}

pub struct DiscussionOrchestrator {
    llm: Arc<dyn LlmClient>,
    stream: Arc<StreamProcessor>,
    clock: Arc<dyn Clock>,
}

impl DiscussionOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        stream: Arc<StreamProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { llm, stream, clock }
    }

    /// Run one discussion round; the mode rotates with the round number.
    pub async fn run_round(
        &self,
        arena: &mut Arena,
        cancel: &CancellationToken,
        pause: &PauseGate,
    ) -> Result<DiscussionRound> {
        let round_number = arena.round_counter + 1;
        let mode = DiscussionMode::for_round(round_number);
        let participants = select_participants(arena, mode);
        let mut round = DiscussionRound {
            round_id: Uuid::new_v4().to_string(),
            round_number,
            mode,
            participants: participants.iter().map(|a| a.agent_id.clone()).collect(),
            conclusions: HashMap::new(),
            started_at: self.clock.now(),
            completed_at: None,
        };
        info!(
            arena = %arena.arena_id,
            round = round_number,
            mode = mode.as_str(),
            participants = participants.len(),
            "discussion round started"
        );

        'participants: for agent in &participants {
            if cancel.is_cancelled() {
                break;
            }
            pause.wait().await;

            let system = system_prompt(agent, mode);
            for (instruction, msg_type) in [
                ("Think step by step about the current market and strategies.", MessageType::Thinking),
                ("State your position with concrete reasoning.", MessageType::Argument),
                ("Give your final conclusion in one short paragraph.", MessageType::Conclusion),
            ] {
                let user = user_prompt(arena, agent, &round, instruction);
                match self.generate(&system, &user, cancel).await? {
                    Generation::Abandoned => break 'participants,
                    Generation::Text(content) => {
                        self.stream.publish(ThinkingMessage {
                            id: Uuid::new_v4().to_string(),
                            arena_id: arena.arena_id.clone(),
                            agent_id: agent.agent_id.clone(),
                            agent_role: agent.role,
                            round_id: Some(round.round_id.clone()),
                            msg_type,
                            content: content.clone(),
                            metadata: serde_json::json!({
                                "round_number": round_number,
                                "mode": mode.as_str(),
                            }),
                            timestamp: self.clock.now(),
                        })?;

                        if msg_type == MessageType::Conclusion {
                            round
                                .conclusions
                                .insert(agent.agent_id.clone(), content.clone());
                            apply_conclusion(arena, agent, &content);
                        }
                    }
                }
            }
        }

        round.completed_at = Some(self.clock.now());
        arena.round_counter = round_number;
        arena.rounds.push(round.clone());
        Ok(round)
    }

    /// Stream one generation, abandoning at the next token boundary if the
    /// round is cancelled.
    async fn generate(
        &self,
        system: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        let mut rx = self.llm.stream_chat(system, user).await?;
        let mut text = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("generation abandoned mid-stream");
                    return Ok(Generation::Abandoned);
                }
                token = rx.recv() => match token {
                    Some(token) => text.push_str(&token),
                    None => break,
                }
            }
        }
        if text.trim().is_empty() {
            return Err(PlatformError::Llm("empty generation".to_string()));
        }
        Ok(Generation::Text(text))
    }
}

/// Mode-specific participant selection, deterministic over the agent list.
fn select_participants(arena: &Arena, mode: DiscussionMode) -> Vec<Agent> {
    match mode {
        DiscussionMode::Debate => arena.agents.iter().take(2).cloned().collect(),
        DiscussionMode::Collaboration => arena.agents.clone(),
        DiscussionMode::Review => {
            let reviewers: Vec<Agent> = arena
                .agents
                .iter()
                .filter(|a| {
                    matches!(
                        a.role,
                        AgentRole::StrategyReviewer | AgentRole::RiskAnalyst
                    )
                })
                .cloned()
                .collect();
            if reviewers.is_empty() {
                // Small arenas may have no dedicated reviewer; everyone
                // reviews.
                arena.agents.clone()
            } else {
                reviewers
            }
        }
    }
}

fn system_prompt(agent: &Agent, mode: DiscussionMode) -> String {
    let role_brief = match agent.role {
        AgentRole::StrategyGenerator => "You design trading strategies for A-share equities.",
        AgentRole::StrategyReviewer => "You critique trading strategies for logical flaws.",
        AgentRole::RiskAnalyst => "You focus on drawdown, exposure and tail risk.",
        AgentRole::MarketSentiment => "You read market breadth and sentiment shifts.",
        AgentRole::QuantResearcher => "You validate ideas against historical data.",
    };
    format!(
        "{role_brief} You are {name} in a {mode} round of a strategy arena. \
         Be concise and specific.",
        name = agent.name,
        mode = mode.as_str(),
    )
}

fn user_prompt(arena: &Arena, agent: &Agent, round: &DiscussionRound, instruction: &str) -> String {
    let mut board = String::new();
    for strategy in arena.leaderboard().iter().take(10) {
        board.push_str(&format!(
            "- {} [{}] score {:.1}: {}\n",
            strategy.name,
            strategy.stage.as_str(),
            strategy.current_score,
            strategy.logic.chars().take(120).collect::<String>(),
        ));
    }
    let own = arena
        .strategies
        .values()
        .find(|s| s.agent_id == agent.agent_id)
        .map(|s| format!("Your strategy: {} — {}\n", s.name, s.logic))
        .unwrap_or_default();
    format!(
        "Round {} ({}).\nCurrent leaderboard:\n{board}{own}{instruction}",
        round.round_number,
        round.mode.as_str(),
    )
}

/// A generator's conclusion becomes its strategy's refined logic, with a
/// bounded, content-derived nudge to the rules so successive rounds
/// actually move the simulated behavior.
fn apply_conclusion(arena: &mut Arena, agent: &Agent, conclusion: &str) {
    if agent.role != AgentRole::StrategyGenerator {
        return;
    }
    let Some(strategy) = arena
        .strategies
        .values_mut()
        .find(|s| s.agent_id == agent.agent_id && s.is_active)
    else {
        return;
    };

    strategy.logic = conclusion.to_string();

    let mut hasher = DefaultHasher::new();
    conclusion.hash(&mut hasher);
    let h = hasher.finish();
    let window_step = (h % 11) as i64 - 5; // [-5, 5]
    strategy.rules.momentum_window =
        (strategy.rules.momentum_window as i64 + window_step).clamp(5, 60) as usize;
    strategy.rules.mean_reversion_bias =
        (((h >> 8) % 100) as f64 / 100.0 * 0.4 - 0.2).clamp(-0.2, 0.2);
}
