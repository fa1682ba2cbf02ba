//! Settlement-event previews for a paired position.
//!
//! Each leg settles on its own cadence. The preview steps both legs
//! forward from their next funding instants, collapses instants that land
//! within the match tolerance into `hedged` events, emits the unmatched
//! ones as `single_side`, and stops at the next point where the two
//! cursors align again. The walk is bounded by an event cap and a
//! seven-day window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Two settlement instants within this tolerance are one hedged event.
const MATCH_TOLERANCE_SECONDS: i64 = 60;
/// Hard cap on preview length.
const MAX_PREVIEW_EVENTS: usize = 96;
/// Preview horizon.
const PREVIEW_WINDOW_DAYS: i64 = 7;
/// Safety bound on cursor walks.
const MAX_SYNC_SEARCH_STEPS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hedged,
    SingleSide,
    /// Forward-compatibility tag for readers of persisted previews.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegSide {
    Long,
    Short,
}

/// One settlement instant in the preview. `amount_rate` is the signed
/// net contribution to the paired position's rate at that instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub event_time: DateTime<Utc>,
    pub kind: EventKind,
    pub side: Option<LegSide>,
    pub amount_rate: f64,
    pub hedged_rate: Option<f64>,
    pub single_side_rate: Option<f64>,
    pub long_rate_raw: Option<f64>,
    pub short_rate_raw: Option<f64>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcStatus {
    Ok,
    MissingData,
    NoSyncFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementPreview {
    pub calc_status: CalcStatus,
    pub events: Vec<SettlementEvent>,
    pub single_side_event_count: usize,
    pub single_side_total_rate: Option<f64>,
    pub next_sync_settlement_time: Option<DateTime<Utc>>,
    pub window_hours_to_sync: Option<f64>,
}

impl SettlementPreview {
    fn missing_data() -> Self {
        Self {
            calc_status: CalcStatus::MissingData,
            events: Vec::new(),
            single_side_event_count: 0,
            single_side_total_rate: None,
            next_sync_settlement_time: None,
            window_hours_to_sync: None,
        }
    }

}

fn is_same_instant(left: DateTime<Utc>, right: DateTime<Utc>) -> bool {
    (left - right).num_seconds().abs() <= MATCH_TOLERANCE_SECONDS
}

/// Skip past settlement instants forward to the next future one, jumping
/// whole intervals first so long outages don't walk one step at a time.
fn normalize_next_settlement(
    next_funding_time: DateTime<Utc>,
    interval: ChronoDuration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let mut candidate = next_funding_time;
    if candidate > now || is_same_instant(candidate, now) {
        return candidate;
    }

    let interval_seconds = interval.num_seconds();
    if interval_seconds > 0 {
        let elapsed = (now - candidate).num_seconds();
        if elapsed > interval_seconds {
            candidate = candidate + interval * (elapsed / interval_seconds) as i32;
        }
        let mut steps = 0;
        while candidate < now && !is_same_instant(candidate, now) && steps < MAX_SYNC_SEARCH_STEPS {
            candidate = candidate + interval;
            steps += 1;
        }
    }
    candidate
}

/// Walk both cursors to the next instant where they align.
fn find_next_sync(
    long_first: DateTime<Utc>,
    short_first: DateTime<Utc>,
    long_interval: ChronoDuration,
    short_interval: ChronoDuration,
    horizon: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut long_cursor = long_first;
    let mut short_cursor = short_first;

    for _ in 0..MAX_SYNC_SEARCH_STEPS {
        if is_same_instant(long_cursor, short_cursor) {
            return Some(long_cursor.max(short_cursor));
        }
        if long_cursor.min(short_cursor) > horizon {
            return None;
        }
        if long_cursor < short_cursor {
            long_cursor = long_cursor + long_interval;
        } else {
            short_cursor = short_cursor + short_interval;
        }
    }
    None
}

fn hedged_event(time: DateTime<Utc>, long_rate: f64, short_rate: f64) -> SettlementEvent {
    let amount = short_rate - long_rate;
    SettlementEvent {
        event_time: time,
        kind: EventKind::Hedged,
        side: None,
        amount_rate: amount,
        hedged_rate: Some(amount),
        single_side_rate: None,
        long_rate_raw: Some(long_rate),
        short_rate_raw: Some(short_rate),
        summary: format!("both legs settle, net {amount:+.8}"),
    }
}

fn single_side_event(time: DateTime<Utc>, side: LegSide, rate_raw: f64) -> SettlementEvent {
    let (amount, long_rate_raw, short_rate_raw, label) = match side {
        // The long leg pays when its raw rate is positive.
        LegSide::Long => (-rate_raw, Some(rate_raw), None, "long"),
        // The short leg collects when its raw rate is positive.
        LegSide::Short => (rate_raw, None, Some(rate_raw), "short"),
    };
    SettlementEvent {
        event_time: time,
        kind: EventKind::SingleSide,
        side: Some(side),
        amount_rate: amount,
        hedged_rate: None,
        single_side_rate: Some(amount),
        long_rate_raw,
        short_rate_raw,
        summary: format!("{label} leg settles alone, net {amount:+.8}"),
    }
}

/// Build the merged settlement preview for one long/short pairing.
#[allow(clippy::too_many_arguments)]
pub fn build_preview(
    long_next: Option<DateTime<Utc>>,
    long_interval_hours: Option<f64>,
    long_rate_raw: Option<f64>,
    short_next: Option<DateTime<Utc>>,
    short_interval_hours: Option<f64>,
    short_rate_raw: Option<f64>,
    now: DateTime<Utc>,
) -> SettlementPreview {
    let (long_next, short_next) = match (long_next, short_next) {
        (Some(long), Some(short)) => (long, short),
        _ => return SettlementPreview::missing_data(),
    };
    let (long_hours, short_hours) = match (long_interval_hours, short_interval_hours) {
        (Some(long), Some(short)) if long > 0.0 && short > 0.0 => (long, short),
        _ => return SettlementPreview::missing_data(),
    };
    let (long_rate, short_rate) = match (long_rate_raw, short_rate_raw) {
        (Some(long), Some(short)) => (long, short),
        _ => return SettlementPreview::missing_data(),
    };

    let long_interval = ChronoDuration::seconds((long_hours * 3600.0) as i64);
    let short_interval = ChronoDuration::seconds((short_hours * 3600.0) as i64);
    let horizon = now + ChronoDuration::days(PREVIEW_WINDOW_DAYS);

    let long_first = normalize_next_settlement(long_next, long_interval, now);
    let short_first = normalize_next_settlement(short_next, short_interval, now);

    // The walk continues to the bounds even without an alignment so the
    // operator still sees the upcoming one-sided exposure.
    let sync_time = find_next_sync(
        long_first,
        short_first,
        long_interval,
        short_interval,
        horizon,
    );

    let mut events: Vec<SettlementEvent> = Vec::new();
    let mut long_cursor = long_first;
    let mut short_cursor = short_first;

    for _ in 0..MAX_SYNC_SEARCH_STEPS {
        if events.len() >= MAX_PREVIEW_EVENTS {
            break;
        }

        if is_same_instant(long_cursor, short_cursor) {
            let event_time = long_cursor.max(short_cursor);
            if event_time > horizon {
                break;
            }
            events.push(hedged_event(event_time, long_rate, short_rate));
            long_cursor = long_cursor + long_interval;
            short_cursor = short_cursor + short_interval;
            if sync_time.is_some_and(|sync| is_same_instant(event_time, sync)) {
                break;
            }
            continue;
        }

        if long_cursor < short_cursor {
            if long_cursor > horizon {
                break;
            }
            events.push(single_side_event(long_cursor, LegSide::Long, long_rate));
            long_cursor = long_cursor + long_interval;
        } else {
            if short_cursor > horizon {
                break;
            }
            events.push(single_side_event(short_cursor, LegSide::Short, short_rate));
            short_cursor = short_cursor + short_interval;
        }
    }

    let single_side: Vec<&SettlementEvent> = events
        .iter()
        .filter(|event| event.kind == EventKind::SingleSide)
        .collect();
    let single_side_total_rate = Some(single_side.iter().map(|event| event.amount_rate).sum());
    let window_hours_to_sync =
        sync_time.map(|sync| ((sync - now).num_seconds() as f64 / 3600.0).max(0.0));

    SettlementPreview {
        calc_status: if sync_time.is_some() {
            CalcStatus::Ok
        } else {
            CalcStatus::NoSyncFound
        },
        single_side_event_count: single_side.len(),
        single_side_total_rate,
        next_sync_settlement_time: sync_time,
        window_hours_to_sync,
        events,
    }
}
