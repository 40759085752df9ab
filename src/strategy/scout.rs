//! Ratio scout for deciding which coin to rotate into.
//!
//! Compares the held coin's price against every enabled candidate, both
//! quoted in the bridge currency, and measures how far the fee-adjusted
//! ratio moved from the baseline committed on the pair.

use crate::config::TradingConfig;
use crate::exchange::MarketView;
use crate::persistence::{Asset, Pair};
use crate::utils::decimal::percent_change;
use rust_decimal::Decimal;
use tracing::{instrument, trace, warn};

/// Scouting result for one pair.
#[derive(Debug, Clone)]
pub struct ScoutEntry {
    pub pair: Pair,
    pub current_price: Decimal,
    pub candidate_price: Decimal,
    /// Fee-adjusted current/candidate ratio
    pub adjusted_ratio: Decimal,
    /// Percent improvement over the pair's committed ratio
    pub delta: Decimal,
    pub is_candidate: bool,
}

impl ScoutEntry {
    /// Heartbeat line, e.g. `"BTC   to ETH  . Diff:   2.05%"`.
    pub fn report_line(&self) -> String {
        format!(
            "{:<5} to {:<5}. Diff: {:>6}%",
            self.pair.from.symbol,
            self.pair.to.symbol,
            format!("{:.2}", self.delta.round_dp(2))
        )
    }
}

/// Outcome of one scouting pass.
#[derive(Debug, Clone)]
pub struct ScoutReport {
    pub current: Asset,
    pub entries: Vec<ScoutEntry>,
    /// The held coin has no bridge price, so nothing was evaluated
    pub current_price_unavailable: bool,
}

impl ScoutReport {
    fn unavailable(current: &Asset) -> Self {
        Self {
            current: current.clone(),
            entries: Vec::new(),
            current_price_unavailable: true,
        }
    }

    /// Pairs worth switching into.
    pub fn candidates(&self) -> impl Iterator<Item = &ScoutEntry> {
        self.entries.iter().filter(|e| e.is_candidate)
    }

    /// The candidate with the largest improvement.
    pub fn best_candidate(&self) -> Option<&ScoutEntry> {
        self.candidates().max_by(|a, b| a.delta.cmp(&b.delta))
    }

    /// One heartbeat line per evaluated pair.
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ScoutEntry::report_line).collect()
    }
}

/// Evaluates coin pairs against a market snapshot.
pub struct RatioScout {
    bridge: String,
    fee_rate: Decimal,
    fee_multiplier: Decimal,
    min_rate_threshold: Decimal,
}

impl RatioScout {
    pub fn new(
        bridge: impl Into<String>,
        fee_rate: Decimal,
        fee_multiplier: Decimal,
        min_rate_threshold: Decimal,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            fee_rate,
            fee_multiplier,
            min_rate_threshold,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(
            config.bridge.clone(),
            config.scout_transaction_fee,
            config.scout_multiplier,
            config.min_scout_rate,
        )
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Current/candidate price ratio net of the fees a jump would pay.
    pub fn adjusted_ratio(&self, current_price: Decimal, candidate_price: Decimal) -> Decimal {
        let ratio = current_price / candidate_price;
        ratio - self.fee_rate * self.fee_multiplier * ratio
    }

    /// Score every pair leaving `current`. Never mutates pair ratios.
    #[instrument(skip(self, market, current, pairs), fields(current = %current))]
    pub fn evaluate(&self, market: &dyn MarketView, current: &Asset, pairs: &[Pair]) -> ScoutReport {
        let Some(current_price) = market.price(&current.symbol, &self.bridge) else {
            warn!(
                symbol = %format!("{}{}", current, self.bridge),
                "Skipping scouting, current coin price unavailable"
            );
            return ScoutReport::unavailable(current);
        };

        let mut entries = Vec::with_capacity(pairs.len());

        for pair in pairs.iter().filter(|p| p.from == *current) {
            if !pair.to.enabled {
                trace!(to = %pair.to, "Skipping disabled coin");
                continue;
            }

            let Some(candidate_price) = market
                .price(&pair.to.symbol, &self.bridge)
                .filter(|p| *p > Decimal::ZERO)
            else {
                warn!(
                    symbol = %format!("{}{}", pair.to, self.bridge),
                    "Skipping scouting, candidate coin price unavailable"
                );
                continue;
            };

            let adjusted_ratio = self.adjusted_ratio(current_price, candidate_price);

            let Some(delta) = pair.ratio.and_then(|base| percent_change(adjusted_ratio, base)) else {
                warn!(from = %pair.from, to = %pair.to, "Skipping pair without a committed ratio");
                continue;
            };

            entries.push(ScoutEntry {
                pair: pair.clone(),
                current_price,
                candidate_price,
                adjusted_ratio,
                delta,
                is_candidate: delta > self.min_rate_threshold,
            });
        }

        ScoutReport {
            current: current.clone(),
            entries,
            current_price_unavailable: false,
        }
    }
}
