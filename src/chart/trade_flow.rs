use crate::chart::types::{
    TradeFlowAnnotation, TradeTick, WatchedOutcomes, TRADE_FLOW_MAX_ITEMS, TRADE_FLOW_TTL_MS,
};
use std::collections::VecDeque;

/// Short-lived "+$X" annotations for trades on the watched outcomes.
#[derive(Debug, Clone)]
pub struct TradeFlowFeed {
    items: VecDeque<TradeFlowAnnotation>,
    watched: Option<WatchedOutcomes>,
    next_id: u64,
    ttl_ms: i64,
    max_items: usize,
}

impl TradeFlowFeed {
    pub fn new(watched: Option<WatchedOutcomes>) -> Self {
        Self::with_limits(watched, TRADE_FLOW_TTL_MS, TRADE_FLOW_MAX_ITEMS)
    }

    pub fn with_limits(watched: Option<WatchedOutcomes>, ttl_ms: i64, max_items: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_items + 1),
            watched,
            next_id: 1,
            ttl_ms,
            max_items,
        }
    }

    /// Sets the first id handed out, for deterministic ids.
    #[cfg(test)]
    pub fn with_first_id(mut self, first_id: u64) -> Self {
        self.next_id = first_id;
        self
    }

    /// Swaps the watched outcomes. Any change of market context empties the list.
    #[cfg(test)]
    pub fn set_watched(&mut self, watched: Option<WatchedOutcomes>) -> bool {
        if self.watched == watched {
            return false;
        }
        self.watched = watched;
        self.clear()
    }

    pub fn ingest(&mut self, trade: &TradeTick, now_ms: i64) -> Option<TradeFlowAnnotation> {
        let outcome = self.watched.as_ref()?.outcome_for(&trade.token_id)?;
        let notional = trade.notional();
        if !notional.is_finite() || notional <= 0.0 {
            return None;
        }

        let annotation = TradeFlowAnnotation {
            id: format!("trade-{}", self.next_id),
            label: format_notional_label(notional),
            outcome,
            created_at_ms: now_ms,
        };
        self.next_id = self.next_id.saturating_add(1);
        self.items.push_back(annotation.clone());
        while self.items.len() > self.max_items {
            self.items.pop_front();
        }

        Some(annotation)
    }

    /// Drops expired annotations. Returns whether anything was removed.
    pub fn sweep(&mut self, now_ms: i64) -> bool {
        let before = self.items.len();
        let ttl_ms = self.ttl_ms;
        self.items
            .retain(|item| now_ms.saturating_sub(item.created_at_ms) <= ttl_ms);
        self.items.len() != before
    }

    #[cfg(test)]
    pub fn clear(&mut self) -> bool {
        let had_items = !self.items.is_empty();
        self.items.clear();
        had_items
    }

    pub fn annotations(&self) -> Vec<TradeFlowAnnotation> {
        self.items.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

pub fn format_notional_label(notional: f64) -> String {
    if notional >= 1_000_000.0 {
        format!("+${:.1}M", notional / 1_000_000.0)
    } else if notional >= 1_000.0 {
        format!("+${:.1}k", notional / 1_000.0)
    } else if notional >= 10.0 {
        format!("+${}", notional.round() as i64)
    } else {
        format!("+${notional:.2}")
    }
}
