//! Periodic evaluation and elimination.

use std::sync::Arc;

use tracing::info;

use crate::arena::repo::ArenaRepo;
use crate::arena::{Arena, EliminationEvent, EvalPeriod};
use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EvaluationOutcome {
    pub period: EvalPeriod,
    pub evaluated: usize,
    pub eliminated: Vec<String>,
    pub top_strategy: Option<String>,
}

pub struct Evaluator {
    repo: Arc<ArenaRepo>,
    clock: Arc<dyn Clock>,
}

impl Evaluator {
    pub fn new(repo: Arc<ArenaRepo>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Rank active strategies, eliminate the cadence's tail fraction down
    /// to the configured floor, and persist the trail.
    ///
    /// Ranking is deterministic: composite score descending, ties broken
    /// by the lower previously-assigned rank.
    pub fn evaluate(&self, arena: &mut Arena, period: EvalPeriod) -> Result<EvaluationOutcome> {
        let now = self.clock.now();

        let mut ranked: Vec<(String, f64, u32)> = arena
            .strategies
            .values()
            .filter(|s| s.is_active)
            .map(|s| (s.strategy_id.clone(), s.current_score, s.current_rank))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
                .then(a.0.cmp(&b.0))
        });

        for (position, (id, _, _)) in ranked.iter().enumerate() {
            if let Some(strategy) = arena.strategies.get_mut(id) {
                strategy.current_rank = (position + 1) as u32;
            }
        }

        let active = ranked.len();
        let by_ratio = (period.elimination_ratio() * active as f64).round() as usize;
        let above_floor = active.saturating_sub(arena.config.min_active_strategies);
        let to_eliminate = by_ratio.min(above_floor);

        let mut eliminated = Vec::new();
        for (id, score, _) in ranked.iter().rev().take(to_eliminate) {
            if let Some(strategy) = arena.strategies.get_mut(id) {
                strategy.is_active = false;
                let event = EliminationEvent {
                    period: period.as_str().to_string(),
                    strategy_id: id.clone(),
                    score: *score,
                    reason: format!("periodic_{}", period.as_str()),
                    timestamp: now,
                };
                self.repo.append_elimination(&arena.arena_id, &event)?;
                eliminated.push(id.clone());
            }
        }

        arena.evaluation_counter += 1;
        let top_strategy = ranked.first().map(|(id, _, _)| id.clone());
        self.repo.append_evaluation_summary(
            &arena.arena_id,
            period.as_str(),
            active,
            eliminated.len(),
            top_strategy.as_deref(),
            now,
        )?;
        self.repo.save(arena)?;

        info!(
            arena = %arena.arena_id,
            period = period.as_str(),
            evaluated = active,
            eliminated = eliminated.len(),
            "evaluation complete"
        );
        Ok(EvaluationOutcome {
            period,
            evaluated: active,
            eliminated,
            top_strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{
        AgentRole, ArenaConfig, DimensionScores, Strategy, StrategyRules, StrategyStage,
    };
    use crate::clock::SystemClock;
    use crate::store::MetaDb;
    use chrono::Utc;

    fn arena_with_scores(scores: &[f64]) -> Arena {
        let mut arena = Arena::new("t", ArenaConfig::default(), Utc::now());
        for (i, score) in scores.iter().enumerate() {
            let id = format!("s{i:02}");
            arena.strategies.insert(
                id.clone(),
                Strategy {
                    strategy_id: id.clone(),
                    name: id.clone(),
                    agent_id: "agent".to_string(),
                    agent_role: AgentRole::StrategyGenerator,
                    stage: StrategyStage::Backtest,
                    is_active: true,
                    current_score: *score,
                    current_rank: (i + 1) as u32,
                    logic: String::new(),
                    rules: StrategyRules::default(),
                    dimension_scores: DimensionScores::default(),
                },
            );
        }
        arena
    }

    fn evaluator() -> Evaluator {
        let repo = Arc::new(ArenaRepo::new(MetaDb::open_in_memory().unwrap()));
        Evaluator::new(repo, Arc::new(SystemClock))
    }

    #[test]
    fn weekly_eliminates_bottom_fifth() {
        let scores: Vec<f64> = (0..10).map(|i| 50.0 + i as f64).collect();
        let mut arena = arena_with_scores(&scores);
        let outcome = evaluator().evaluate(&mut arena, EvalPeriod::Weekly).unwrap();

        assert_eq!(outcome.evaluated, 10);
        assert_eq!(outcome.eliminated.len(), 2);
        // The two lowest-scoring strategies go.
        assert!(outcome.eliminated.contains(&"s00".to_string()));
        assert!(outcome.eliminated.contains(&"s01".to_string()));
        assert_eq!(arena.active_strategies().len(), 8);
    }

    #[test]
    fn daily_never_eliminates() {
        let mut arena = arena_with_scores(&[10.0, 20.0, 30.0, 40.0]);
        let outcome = evaluator().evaluate(&mut arena, EvalPeriod::Daily).unwrap();
        assert!(outcome.eliminated.is_empty());
        assert_eq!(arena.active_strategies().len(), 4);
    }

    #[test]
    fn floor_caps_elimination() {
        // 4 active with floor 3: weekly ratio would cut round(0.2*4)=1, and
        // the floor allows exactly 1.
        let mut arena = arena_with_scores(&[10.0, 20.0, 30.0, 40.0]);
        let outcome = evaluator().evaluate(&mut arena, EvalPeriod::Weekly).unwrap();
        assert_eq!(outcome.eliminated.len(), 1);

        // Already at the floor: monthly eliminates nothing.
        let outcome = evaluator()
            .evaluate(&mut arena, EvalPeriod::Monthly)
            .unwrap();
        assert!(outcome.eliminated.is_empty());
        assert_eq!(arena.active_strategies().len(), 3);
    }

    #[test]
    fn tie_break_prefers_earlier_rank() {
        let mut arena = arena_with_scores(&[60.0, 60.0, 60.0, 60.0, 80.0]);
        // s00..s03 tie at 60 with ranks 1..4; weekly cuts round(1.0)=1 and
        // the loser must be the tied strategy with the *highest* old rank.
        let outcome = evaluator().evaluate(&mut arena, EvalPeriod::Weekly).unwrap();
        assert_eq!(outcome.eliminated, vec!["s03".to_string()]);
        assert_eq!(outcome.top_strategy, Some("s04".to_string()));
    }

    #[test]
    fn ranks_are_reassigned_densely() {
        let mut arena = arena_with_scores(&[30.0, 90.0, 60.0]);
        evaluator().evaluate(&mut arena, EvalPeriod::Daily).unwrap();
        let board = arena.leaderboard();
        let ranks: Vec<u32> = board.iter().map(|s| s.current_rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(board[0].current_score, 90.0);
    }
}
