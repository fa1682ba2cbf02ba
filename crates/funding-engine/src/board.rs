//! Opportunity board: symbol pairing, spread scoring and ranking.
//!
//! For every symbol quoted on at least two venues, each unordered venue
//! pair is emitted once with the higher annualized-nominal-rate side as
//! the short leg, so `spread_rate_1y_nominal` is never negative. Rows
//! carry value projections of both legs plus the merged settlement
//! preview; the engine is transient and rebuilt per request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use venue_adapters::{FundingSnapshot, VenueId};

use crate::settlement::{self, CalcStatus, LegSide, SettlementEvent};

/// Board query filters.
#[derive(Debug, Clone)]
pub struct BoardQuery {
    pub limit: usize,
    pub min_spread_rate_1y_nominal: f64,
    pub min_next_cycle_score: f64,
    /// One selected venue includes any row touching it; two or more
    /// require both legs inside the selection.
    pub exchanges: Option<HashSet<VenueId>>,
    pub symbol: Option<String>,
}

impl Default for BoardQuery {
    fn default() -> Self {
        Self {
            limit: 500,
            min_spread_rate_1y_nominal: 0.0,
            min_next_cycle_score: 0.0,
            exchanges: None,
            symbol: None,
        }
    }
}

/// Value projection of one leg for board rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub exchange: VenueId,
    pub funding_rate_raw: Option<f64>,
    pub rate_1h: Option<f64>,
    pub rate_8h: Option<f64>,
    pub rate_1y_nominal: Option<f64>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub max_leverage: Option<f64>,
    pub leveraged_nominal_rate_1y: Option<f64>,
    pub open_interest_usd: Option<f64>,
    pub volume24h_usd: Option<f64>,
    pub mark_price: Option<f64>,
    pub settlement_interval: String,
    pub settlement_interval_hours: Option<f64>,
}

impl OpportunityLeg {
    fn from_snapshot(snapshot: &FundingSnapshot) -> Self {
        Self {
            exchange: snapshot.exchange,
            funding_rate_raw: snapshot.funding_rate_raw,
            rate_1h: snapshot.rate_1h,
            rate_8h: snapshot.rate_8h,
            rate_1y_nominal: snapshot.rate_1y_nominal,
            next_funding_time: snapshot.next_funding_time,
            max_leverage: snapshot.max_leverage,
            leveraged_nominal_rate_1y: snapshot.leveraged_nominal_rate_1y,
            open_interest_usd: snapshot.open_interest_usd,
            volume24h_usd: snapshot.volume24h_usd,
            mark_price: snapshot.mark_price,
            settlement_interval: format_interval(snapshot.funding_interval_hours),
            settlement_interval_hours: snapshot.funding_interval_hours,
        }
    }
}

/// One ranked long/short pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityRow {
    pub id: String,
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub long_leg: OpportunityLeg,
    pub short_leg: OpportunityLeg,
    pub interval_mismatch: bool,
    pub shorter_interval_side: Option<LegSide>,
    pub spread_rate_1h: Option<f64>,
    pub spread_rate_8h: Option<f64>,
    pub spread_rate_1y_nominal: f64,
    pub max_usable_leverage: Option<f64>,
    pub leveraged_spread_rate_1y_nominal: Option<f64>,
    pub next_cycle_score: Option<f64>,
    pub next_sync_settlement_time: Option<DateTime<Utc>>,
    pub window_hours_to_sync: Option<f64>,
    pub settlement_events_preview: Vec<SettlementEvent>,
    pub single_side_event_count: usize,
    pub single_side_total_rate: Option<f64>,
    pub calc_status: CalcStatus,
}

fn format_interval(hours: Option<f64>) -> String {
    match hours {
        Some(hours) if hours > 0.0 => {
            if (hours - hours.round()).abs() < 1e-9 {
                format!("{}h", hours.round() as i64)
            } else {
                format!("{hours}h")
            }
        }
        _ => "-".to_string(),
    }
}

fn spread(short: Option<f64>, long: Option<f64>) -> Option<f64> {
    match (short, long) {
        (Some(short), Some(long)) => Some(short - long),
        _ => None,
    }
}

fn interval_relation(
    long_hours: Option<f64>,
    short_hours: Option<f64>,
) -> (bool, Option<LegSide>) {
    let (long_hours, short_hours) = match (long_hours, short_hours) {
        (Some(long), Some(short)) if long > 0.0 && short > 0.0 => (long, short),
        _ => return (false, None),
    };
    let diff = long_hours - short_hours;
    if diff.abs() < 1e-9 {
        (false, None)
    } else if diff < 0.0 {
        (true, Some(LegSide::Long))
    } else {
        (true, Some(LegSide::Short))
    }
}

fn matches_exchange_filter(
    long_exchange: VenueId,
    short_exchange: VenueId,
    filter: Option<&HashSet<VenueId>>,
) -> bool {
    match filter {
        None => true,
        Some(selected) if selected.is_empty() => true,
        Some(selected) if selected.len() == 1 => {
            selected.contains(&long_exchange) || selected.contains(&short_exchange)
        }
        Some(selected) => selected.contains(&long_exchange) && selected.contains(&short_exchange),
    }
}

/// Build ranked board rows from a flat snapshot set.
pub fn build_board_rows(
    snapshots: &[FundingSnapshot],
    query: &BoardQuery,
    now: DateTime<Utc>,
) -> Vec<OpportunityRow> {
    if query.limit == 0 {
        return Vec::new();
    }

    let symbol_filter = query
        .symbol
        .as_deref()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty());

    let mut by_symbol: HashMap<&str, Vec<&FundingSnapshot>> = HashMap::new();
    for snapshot in snapshots {
        if snapshot.rate_1y_nominal.is_none() {
            continue;
        }
        if let Some(filter) = symbol_filter.as_deref() {
            if !snapshot.symbol.contains(filter) {
                continue;
            }
        }
        by_symbol.entry(&snapshot.symbol).or_default().push(snapshot);
    }

    let mut rows: Vec<OpportunityRow> = Vec::new();
    for (symbol, legs) in &by_symbol {
        if legs.len() < 2 {
            continue;
        }
        for i in 0..legs.len() {
            for j in (i + 1)..legs.len() {
                let (left, right) = (legs[i], legs[j]);
                if left.exchange == right.exchange {
                    continue;
                }
                // Higher annualized nominal rate sells, lower buys.
                let (long, short) = if left.rate_1y_nominal <= right.rate_1y_nominal {
                    (left, right)
                } else {
                    (right, left)
                };

                if !matches_exchange_filter(long.exchange, short.exchange, query.exchanges.as_ref())
                {
                    continue;
                }

                let spread_1y = match spread(short.rate_1y_nominal, long.rate_1y_nominal) {
                    Some(spread) => spread,
                    None => continue,
                };
                if spread_1y < query.min_spread_rate_1y_nominal {
                    continue;
                }

                let max_usable_leverage = match (long.max_leverage, short.max_leverage) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    _ => None,
                };
                let leveraged_spread = max_usable_leverage.map(|leverage| spread_1y * leverage);
                let next_cycle_score = Some(leveraged_spread.unwrap_or(spread_1y));

                if query.min_next_cycle_score > 0.0
                    && next_cycle_score.unwrap_or(f64::MIN) < query.min_next_cycle_score
                {
                    continue;
                }

                let (interval_mismatch, shorter_interval_side) =
                    interval_relation(long.funding_interval_hours, short.funding_interval_hours);
                let preview = settlement::build_preview(
                    long.next_funding_time,
                    long.funding_interval_hours,
                    long.funding_rate_raw,
                    short.next_funding_time,
                    short.funding_interval_hours,
                    short.funding_rate_raw,
                    now,
                );

                rows.push(OpportunityRow {
                    id: format!("{symbol}-{}-{}", long.exchange, short.exchange),
                    symbol: symbol.to_string(),
                    long_exchange: long.exchange,
                    short_exchange: short.exchange,
                    long_leg: OpportunityLeg::from_snapshot(long),
                    short_leg: OpportunityLeg::from_snapshot(short),
                    interval_mismatch,
                    shorter_interval_side,
                    spread_rate_1h: spread(short.rate_1h, long.rate_1h),
                    spread_rate_8h: spread(short.rate_8h, long.rate_8h),
                    spread_rate_1y_nominal: spread_1y,
                    max_usable_leverage,
                    leveraged_spread_rate_1y_nominal: leveraged_spread,
                    next_cycle_score,
                    next_sync_settlement_time: preview.next_sync_settlement_time,
                    window_hours_to_sync: preview.window_hours_to_sync,
                    single_side_event_count: preview.single_side_event_count,
                    single_side_total_rate: preview.single_side_total_rate,
                    calc_status: preview.calc_status,
                    settlement_events_preview: preview.events,
                });
            }
        }
    }

    sort_rows(&mut rows);
    rows.truncate(query.limit);
    rows
}

/// Score descending with nulls last, spread as the tie-break.
fn sort_rows(rows: &mut [OpportunityRow]) {
    rows.sort_by(|a, b| {
        let score_a = a.next_cycle_score;
        let score_b = b.next_cycle_score;
        match (score_a, score_b) {
            (Some(a_score), Some(b_score)) => b_score
                .partial_cmp(&a_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.spread_rate_1y_nominal
                        .partial_cmp(&a.spread_rate_1y_nominal)
                        .unwrap_or(std::cmp::Ordering::Equal)
                }),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b
                .spread_rate_1y_nominal
                .partial_cmp(&a.spread_rate_1y_nominal)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    });
}

/// Spread lookup for one explicit pairing, used by the executor for
/// entry-spread stamping and previews.
pub fn pair_spread(
    snapshots: &[FundingSnapshot],
    symbol: &str,
    long_exchange: VenueId,
    short_exchange: VenueId,
) -> Option<f64> {
    let long = snapshots
        .iter()
        .find(|s| s.exchange == long_exchange && s.symbol == symbol)?;
    let short = snapshots
        .iter()
        .find(|s| s.exchange == short_exchange && s.symbol == symbol)?;
    spread(short.rate_1y_nominal, long.rate_1y_nominal)
}
