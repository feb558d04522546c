//! Arena persistence over the platform database.
//!
//! Aggregates are written through whole: the arena row plus child rows per
//! strategy and round. Messages, eliminations and evaluation summaries are
//! append-only.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::arena::{
    AgentRole, Arena, ArenaConfig, ArenaState, DiscussionMode, DiscussionRound, EliminationEvent,
    MessageType, Strategy, StrategyStage, ThinkingMessage,
};
use crate::error::{PlatformError, Result};
use crate::store::MetaDb;

pub struct ArenaRepo {
    db: MetaDb,
}

impl ArenaRepo {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn save(&self, arena: &Arena) -> Result<()> {
        let config_json = serde_json::to_string(&arena.config)
            .map_err(|e| PlatformError::Store(format!("arena config encode: {e}")))?;
        let agents_json = serde_json::to_string(&arena.agents)
            .map_err(|e| PlatformError::Store(format!("agents encode: {e}")))?;

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO arena (
                 arena_id, name, config_json, agents_json, state, created_at,
                 round_counter, evaluation_counter, last_error
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(arena_id) DO UPDATE SET
                 name = ?2, config_json = ?3, agents_json = ?4, state = ?5,
                 round_counter = ?7, evaluation_counter = ?8, last_error = ?9",
            params![
                arena.arena_id,
                arena.name,
                config_json,
                agents_json,
                arena.state.as_str(),
                arena.created_at.to_rfc3339(),
                arena.round_counter,
                arena.evaluation_counter,
                arena.last_error,
            ],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO strategy (
                     strategy_id, arena_id, name, agent_id, agent_role, stage,
                     is_active, current_score, current_rank, logic, rules_json,
                     dimension_scores_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(strategy_id) DO UPDATE SET
                     name = ?3, stage = ?6, is_active = ?7, current_score = ?8,
                     current_rank = ?9, logic = ?10, rules_json = ?11,
                     dimension_scores_json = ?12",
            )?;
            for strategy in arena.strategies.values() {
                stmt.execute(params![
                    strategy.strategy_id,
                    arena.arena_id,
                    strategy.name,
                    strategy.agent_id,
                    strategy.agent_role.as_str(),
                    strategy.stage.as_str(),
                    strategy.is_active as i64,
                    strategy.current_score,
                    strategy.current_rank,
                    strategy.logic,
                    serde_json::to_string(&strategy.rules).unwrap_or_default(),
                    serde_json::to_string(&strategy.dimension_scores).unwrap_or_default(),
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO discussion_round (
                     round_id, arena_id, round_number, mode, participants_json,
                     conclusions_json, started_at, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(round_id) DO UPDATE SET
                     conclusions_json = ?6, completed_at = ?8",
            )?;
            for round in &arena.rounds {
                stmt.execute(params![
                    round.round_id,
                    arena.arena_id,
                    round.round_number,
                    round.mode.as_str(),
                    serde_json::to_string(&round.participants).unwrap_or_default(),
                    serde_json::to_string(&round.conclusions).unwrap_or_default(),
                    round.started_at.to_rfc3339(),
                    round.completed_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, arena_id: &str) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM strategy WHERE arena_id = ?1", [arena_id])?;
        tx.execute("DELETE FROM discussion_round WHERE arena_id = ?1", [arena_id])?;
        tx.execute("DELETE FROM thinking_message WHERE arena_id = ?1", [arena_id])?;
        tx.execute("DELETE FROM elimination_event WHERE arena_id = ?1", [arena_id])?;
        tx.execute("DELETE FROM evaluation_summary WHERE arena_id = ?1", [arena_id])?;
        let n = tx.execute("DELETE FROM arena WHERE arena_id = ?1", [arena_id])?;
        tx.commit()?;
        if n == 0 {
            return Err(PlatformError::NotFound(format!("arena '{arena_id}'")));
        }
        Ok(())
    }

    pub fn append_message(&self, msg: &ThinkingMessage) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO thinking_message (
                 id, arena_id, agent_id, agent_role, round_id, msg_type,
                 content, metadata_json, timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                msg.id,
                msg.arena_id,
                msg.agent_id,
                msg.agent_role.as_str(),
                msg.round_id,
                msg.msg_type.as_str(),
                msg.content,
                msg.metadata.to_string(),
                msg.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn append_elimination(&self, arena_id: &str, event: &EliminationEvent) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO elimination_event (arena_id, period, strategy_id, score, reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                arena_id,
                event.period,
                event.strategy_id,
                event.score,
                event.reason,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn append_evaluation_summary(
        &self,
        arena_id: &str,
        period: &str,
        evaluated: usize,
        eliminated: usize,
        top_strategy: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO evaluation_summary (arena_id, period, evaluated, eliminated, top_strategy, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                arena_id,
                period,
                evaluated as i64,
                eliminated as i64,
                top_strategy,
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn eliminations(&self, arena_id: &str) -> Result<Vec<EliminationEvent>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT period, strategy_id, score, reason, timestamp
             FROM elimination_event WHERE arena_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([arena_id], |r| {
            let ts: String = r.get(4)?;
            Ok(EliminationEvent {
                period: r.get(0)?,
                strategy_id: r.get(1)?,
                score: r.get(2)?,
                reason: r.get(3)?,
                timestamp: parse_ts(&ts),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn messages(&self, arena_id: &str, limit: usize) -> Result<Vec<ThinkingMessage>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, arena_id, agent_id, agent_role, round_id, msg_type,
                    content, metadata_json, timestamp
             FROM thinking_message WHERE arena_id = ?1
             ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![arena_id, limit as i64], map_message)?;
        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Rehydrate every persisted arena, children included. Arenas that were
    /// mid-flight when the process died come back `paused` so an operator
    /// decides whether to resume them.
    pub fn load_all(&self) -> Result<Vec<Arena>> {
        type ArenaRow = (
            String,
            String,
            String,
            String,
            String,
            String,
            u32,
            u32,
            Option<String>,
        );
        let arena_rows: Vec<ArenaRow> = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT arena_id, name, config_json, agents_json, state, created_at,
                        round_counter, evaluation_counter, last_error
                 FROM arena",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut arenas = Vec::new();
        for (arena_id, name, config_json, agents_json, state, created_at, rounds, evals, last_error) in
            arena_rows
        {
            let config: ArenaConfig = serde_json::from_str(&config_json)
                .map_err(|e| PlatformError::Store(format!("arena config decode: {e}")))?;
            let state = ArenaState::parse(&state).unwrap_or(ArenaState::Failed);
            let mut arena = Arena {
                arena_id: arena_id.clone(),
                name,
                config,
                state: if state.is_active() {
                    ArenaState::Paused
                } else {
                    state
                },
                created_at: parse_ts(&created_at),
                round_counter: rounds,
                evaluation_counter: evals,
                last_error,
                agents: serde_json::from_str(&agents_json).unwrap_or_default(),
                strategies: std::collections::HashMap::new(),
                rounds: Vec::new(),
            };
            self.load_children(&mut arena)?;
            arenas.push(arena);
        }
        Ok(arenas)
    }

    fn load_children(&self, arena: &mut Arena) -> Result<()> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT strategy_id, name, agent_id, agent_role, stage, is_active,
                    current_score, current_rank, logic, rules_json,
                    dimension_scores_json
             FROM strategy WHERE arena_id = ?1",
        )?;
        let strategies = stmt.query_map([&arena.arena_id], map_strategy)?;
        for strategy in strategies {
            let strategy = strategy?;
            arena
                .strategies
                .insert(strategy.strategy_id.clone(), strategy);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT round_id, round_number, mode, participants_json,
                    conclusions_json, started_at, completed_at
             FROM discussion_round WHERE arena_id = ?1 ORDER BY round_number",
        )?;
        let rounds = stmt.query_map([&arena.arena_id], |r| {
            let mode: String = r.get(2)?;
            let participants: String = r.get(3)?;
            let conclusions: String = r.get(4)?;
            let started_at: String = r.get(5)?;
            let completed_at: Option<String> = r.get(6)?;
            Ok(DiscussionRound {
                round_id: r.get(0)?,
                round_number: r.get(1)?,
                mode: DiscussionMode::parse(&mode).unwrap_or(DiscussionMode::Collaboration),
                participants: serde_json::from_str(&participants).unwrap_or_default(),
                conclusions: serde_json::from_str(&conclusions).unwrap_or_default(),
                started_at: parse_ts(&started_at),
                completed_at: completed_at.as_deref().map(parse_ts),
            })
        })?;
        for round in rounds {
            arena.rounds.push(round?);
        }

        Ok(())
    }
}

fn map_strategy(r: &Row<'_>) -> rusqlite::Result<Strategy> {
    let role: String = r.get(3)?;
    let stage: String = r.get(4)?;
    let rules: String = r.get(9)?;
    let dims: String = r.get(10)?;
    Ok(Strategy {
        strategy_id: r.get(0)?,
        name: r.get(1)?,
        agent_id: r.get(2)?,
        agent_role: AgentRole::parse(&role).unwrap_or(AgentRole::StrategyGenerator),
        stage: StrategyStage::parse(&stage).unwrap_or(StrategyStage::Backtest),
        is_active: r.get::<_, i64>(5)? != 0,
        current_score: r.get(6)?,
        current_rank: r.get(7)?,
        logic: r.get(8)?,
        rules: serde_json::from_str(&rules).unwrap_or_default(),
        dimension_scores: serde_json::from_str(&dims).unwrap_or_default(),
    })
}

fn map_message(r: &Row<'_>) -> rusqlite::Result<ThinkingMessage> {
    let role: String = r.get(3)?;
    let msg_type: String = r.get(5)?;
    let metadata: String = r.get(7)?;
    let ts: String = r.get(8)?;
    Ok(ThinkingMessage {
        id: r.get(0)?,
        arena_id: r.get(1)?,
        agent_id: r.get(2)?,
        agent_role: AgentRole::parse(&role).unwrap_or(AgentRole::QuantResearcher),
        round_id: r.get(4)?,
        msg_type: MessageType::parse(&msg_type).unwrap_or(MessageType::System),
        content: r.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        timestamp: parse_ts(&ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{DimensionScores, StrategyRules};

    #[test]
    fn save_and_reload_roundtrip() {
        let db = MetaDb::open_in_memory().unwrap();
        let repo = ArenaRepo::new(db);

        let mut arena = Arena::new("alpha", ArenaConfig::default(), Utc::now());
        arena.state = ArenaState::Discussing;
        arena.strategies.insert(
            "s1".to_string(),
            Strategy {
                strategy_id: "s1".to_string(),
                name: "momentum-1".to_string(),
                agent_id: "agent-1".to_string(),
                agent_role: AgentRole::StrategyGenerator,
                stage: StrategyStage::Simulated,
                is_active: true,
                current_score: 71.5,
                current_rank: 1,
                logic: "ride 20d momentum".to_string(),
                rules: StrategyRules::default(),
                dimension_scores: DimensionScores::default(),
            },
        );

        repo.save(&arena).unwrap();
        let loaded = repo.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let loaded = &loaded[0];
        // Active states come back paused for operator review.
        assert_eq!(loaded.state, ArenaState::Paused);
        assert_eq!(loaded.strategies["s1"].stage, StrategyStage::Simulated);
        assert_eq!(loaded.strategies["s1"].current_score, 71.5);
    }

    #[test]
    fn delete_removes_children() {
        let db = MetaDb::open_in_memory().unwrap();
        let repo = ArenaRepo::new(db);
        let arena = Arena::new("alpha", ArenaConfig::default(), Utc::now());
        let id = arena.arena_id.clone();
        repo.save(&arena).unwrap();
        repo.delete(&id).unwrap();
        assert!(repo.load_all().unwrap().is_empty());
        assert!(matches!(
            repo.delete(&id),
            Err(PlatformError::NotFound(_))
        ));
    }
}
