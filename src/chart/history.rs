use crate::chart::types::{CombinedHistory, CombinedHistoryPoint, HistoryPoint, TradeOutcome};
use std::collections::{BTreeMap, BTreeSet};

fn finite_series(points: &[HistoryPoint]) -> BTreeMap<i64, f64> {
    points
        .iter()
        .filter(|point| point.value.is_finite())
        .map(|point| (point.timestamp_ms, point.value))
        .collect()
}

/// Forward-fills two per-outcome series onto their shared, sorted timestamps.
pub fn merge_outcome_histories(yes: &[HistoryPoint], no: &[HistoryPoint]) -> CombinedHistory {
    let yes_series = finite_series(yes);
    let no_series = finite_series(no);
    let timestamps: BTreeSet<i64> = yes_series.keys().chain(no_series.keys()).copied().collect();

    let mut last_yes: Option<f64> = None;
    let mut last_no: Option<f64> = None;
    let mut points = Vec::with_capacity(timestamps.len());

    for timestamp_ms in timestamps {
        if let Some(value) = yes_series.get(&timestamp_ms) {
            last_yes = Some(*value);
        }
        if let Some(value) = no_series.get(&timestamp_ms) {
            last_no = Some(*value);
        }
        if last_yes.is_none() && last_no.is_none() {
            continue;
        }
        points.push(CombinedHistoryPoint {
            timestamp_ms,
            yes_value: last_yes,
            no_value: last_no,
        });
    }

    let latest = latest_snapshot(points.last());
    CombinedHistory { points, latest }
}

fn latest_snapshot(point: Option<&CombinedHistoryPoint>) -> BTreeMap<TradeOutcome, f64> {
    let mut latest = BTreeMap::new();
    if let Some(point) = point {
        if let Some(value) = point.yes_value {
            latest.insert(TradeOutcome::Yes, value);
        }
        if let Some(value) = point.no_value {
            latest.insert(TradeOutcome::No, value);
        }
    }
    latest
}
