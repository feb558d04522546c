//! Competition engine: stage progression and four-dimension scoring.
//!
//! Each active strategy's rule-set is applied to real daily closes from
//! the ODS store to derive a daily return series; an empty store falls
//! back to a seeded synthetic walk so scoring stays deterministic in
//! bare deployments. The composite is the weighted sum of profitability,
//! risk control, stability and adaptability, each mapped onto [0, 100].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::NaiveDate;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::arena::{Arena, DimensionScores, Strategy, StrategyStage};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::ods::OdsStore;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const BAR_TABLE: &str = "ods_daily_bar";

pub struct CompetitionEngine {
    ods: Arc<OdsStore>,
    clock: Arc<dyn Clock>,
}

impl CompetitionEngine {
    pub fn new(ods: Arc<OdsStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ods, clock }
    }

    /// Score every active strategy and advance stages past the threshold.
    pub fn run_stage(&self, arena: &mut Arena, stage: StrategyStage) -> Result<()> {
        let today = self.clock.now().date_naive();
        let start = today - chrono::Duration::days(arena.config.backtest_window_days);
        let market = self.load_market_returns(&arena.config.universe, start, today)?;

        let weights = arena.config.weights;
        let threshold = arena.config.stage_threshold;
        let mut scored = 0;
        for strategy in arena.strategies.values_mut().filter(|s| s.is_active) {
            if strategy.stage != stage {
                continue;
            }
            let returns = strategy_returns(strategy, &market);
            let dims = score_dimensions(&returns);
            strategy.dimension_scores = dims;
            strategy.current_score = weights.composite(&dims);
            if strategy.current_score >= threshold {
                if let Some(next) = strategy.stage.next() {
                    info!(
                        strategy = %strategy.strategy_id,
                        score = strategy.current_score,
                        from = strategy.stage.as_str(),
                        to = next.as_str(),
                        "stage advanced"
                    );
                    strategy.stage = next;
                }
            }
            scored += 1;
        }
        debug!(arena = %arena.arena_id, stage = stage.as_str(), scored, "stage scored");
        Ok(())
    }

    /// Equal-weight market daily returns over the universe; empty result
    /// when the store has no bars for the window.
    fn load_market_returns(
        &self,
        universe: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<f64>> {
        let series = self.ods.daily_closes(BAR_TABLE, start, end)?;
        let mut per_day: std::collections::BTreeMap<NaiveDate, Vec<f64>> =
            std::collections::BTreeMap::new();
        for (code, closes) in &series {
            if !universe.is_empty() && !universe.contains(code) {
                continue;
            }
            for window in closes.windows(2) {
                let (_, prev) = window[0];
                let (date, cur) = window[1];
                if prev > 0.0 {
                    per_day.entry(date).or_default().push(cur / prev - 1.0);
                }
            }
        }
        Ok(per_day
            .values()
            .map(|day| day.iter().sum::<f64>() / day.len() as f64)
            .collect())
    }
}

/// Apply a strategy's rules to the market series. With no market data the
/// walk is synthesized from the strategy's id so repeated scoring of the
/// same strategy is stable.
fn strategy_returns(strategy: &Strategy, market: &[f64]) -> Vec<f64> {
    let market: Vec<f64> = if market.len() >= 30 {
        market.to_vec()
    } else {
        synthetic_walk(&strategy.strategy_id, 252)
    };

    let rules = &strategy.rules;
    let window = rules.momentum_window.max(2);
    let mut returns = Vec::with_capacity(market.len());
    let mut equity_peak = 1.0f64;
    let mut equity = 1.0f64;

    for i in 0..market.len() {
        let lookback = &market[i.saturating_sub(window)..i];
        let trend: f64 = lookback.iter().sum();
        // Momentum follows the trend; the mean-reversion bias leans the
        // other way. Net exposure is bounded by the declared position size.
        let momentum_signal = if trend >= 0.0 { 1.0 } else { -1.0 };
        let exposure = (momentum_signal * (1.0 - 2.0 * rules.mean_reversion_bias))
            .clamp(-1.0, 1.0)
            * rules.position_size.clamp(0.0, 1.0);

        let mut r = exposure * market[i];
        // Stop-loss: once drawdown breaches the limit, stand aside.
        equity *= 1.0 + r;
        equity_peak = equity_peak.max(equity);
        let drawdown = 1.0 - equity / equity_peak;
        if drawdown * 100.0 > rules.stop_loss_pct {
            r = 0.0;
            equity = equity_peak * (1.0 - rules.stop_loss_pct / 100.0);
        }
        returns.push(r);
    }
    returns
}

fn synthetic_walk(seed_key: &str, len: usize) -> Vec<f64> {
    let mut hasher = DefaultHasher::new();
    seed_key.hash(&mut hasher);
    let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
    (0..len)
        .map(|_| rng.gen_range(-0.02..0.021))
        .collect()
}

/// Map a daily return series to the four dimension scores, each on [0, 100].
pub fn score_dimensions(returns: &[f64]) -> DimensionScores {
    if returns.is_empty() {
        return DimensionScores::default();
    }

    let mean = returns.mean();
    let annualized = mean * TRADING_DAYS_PER_YEAR;
    // Profitability: 0% annual -> 50, +/-50% annual saturates the scale.
    let profitability = (50.0 + 100.0 * annualized.tanh()).clamp(0.0, 100.0);

    let max_dd = max_drawdown(returns);
    let loss_ratio = returns.iter().filter(|r| **r < 0.0).count() as f64 / returns.len() as f64;
    let risk_control = (100.0 * (1.0 - max_dd) * (1.0 - loss_ratio * 0.5)).clamp(0.0, 100.0);

    let vol = returns.std_dev() * TRADING_DAYS_PER_YEAR.sqrt();
    let stability = (100.0 / (1.0 + 4.0 * vol)).clamp(0.0, 100.0);

    let adaptability = regime_adaptability(returns);

    DimensionScores {
        profitability,
        risk_control,
        stability,
        adaptability,
    }
}

fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 1.0f64;
    let mut peak = 1.0f64;
    let mut max_dd = 0.0f64;
    for r in returns {
        equity *= 1.0 + r;
        peak = peak.max(equity);
        max_dd = max_dd.max(1.0 - equity / peak);
    }
    max_dd.clamp(0.0, 1.0)
}

/// Split the window into three regime segments and penalize dispersion in
/// per-segment performance: a strategy that only works in one regime
/// scores low here even if its average is good.
fn regime_adaptability(returns: &[f64]) -> f64 {
    if returns.len() < 3 {
        return 50.0;
    }
    let seg = returns.len() / 3;
    let means: Vec<f64> = [
        &returns[..seg],
        &returns[seg..2 * seg],
        &returns[2 * seg..],
    ]
    .iter()
    .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
    .collect();

    let positive = means.iter().filter(|m| **m >= 0.0).count() as f64;
    let spread = means.iter().cloned().fold(f64::MIN, f64::max)
        - means.iter().cloned().fold(f64::MAX, f64::min);
    let base = 100.0 * positive / 3.0;
    (base * (1.0 - (spread * TRADING_DAYS_PER_YEAR / 4.0).clamp(0.0, 0.6))).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{AgentRole, StrategyRules};

    fn strategy(id: &str) -> Strategy {
        Strategy {
            strategy_id: id.to_string(),
            name: id.to_string(),
            agent_id: "agent".to_string(),
            agent_role: AgentRole::StrategyGenerator,
            stage: StrategyStage::Backtest,
            is_active: true,
            current_score: 0.0,
            current_rank: 0,
            logic: String::new(),
            rules: StrategyRules::default(),
            dimension_scores: DimensionScores::default(),
        }
    }

    #[test]
    fn dimensions_stay_in_range() {
        let wild: Vec<f64> = (0..300)
            .map(|i| if i % 7 == 0 { -0.09 } else { 0.012 })
            .collect();
        let dims = score_dimensions(&wild);
        for value in [
            dims.profitability,
            dims.risk_control,
            dims.stability,
            dims.adaptability,
        ] {
            assert!((0.0..=100.0).contains(&value), "out of range: {value}");
        }
    }

    #[test]
    fn steady_gains_beat_steady_losses() {
        let gains = vec![0.004; 252];
        let losses = vec![-0.004; 252];
        let up = score_dimensions(&gains);
        let down = score_dimensions(&losses);
        assert!(up.profitability > down.profitability);
        assert!(up.risk_control > down.risk_control);
    }

    #[test]
    fn max_drawdown_of_monotone_rise_is_zero() {
        assert_eq!(max_drawdown(&[0.01, 0.02, 0.005]), 0.0);
        assert!(max_drawdown(&[0.10, -0.50]) > 0.4);
    }

    #[test]
    fn synthetic_walk_is_deterministic_per_strategy() {
        let a1 = strategy_returns(&strategy("alpha"), &[]);
        let a2 = strategy_returns(&strategy("alpha"), &[]);
        let b = strategy_returns(&strategy("beta"), &[]);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }
}
