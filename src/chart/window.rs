use crate::chart::types::{PriceTick, WindowPoint, MAX_POINTS, WINDOW_MS};
use std::collections::VecDeque;

/// Time-windowed, capped, strictly increasing series slice.
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    points: VecDeque<WindowPoint>,
    last_value: Option<f64>,
    window_ms: i64,
    max_points: usize,
}

impl Default for WindowBuffer {
    fn default() -> Self {
        Self::new(WINDOW_MS, MAX_POINTS)
    }
}

impl WindowBuffer {
    pub fn new(window_ms: i64, max_points: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(max_points.min(1_024)),
            last_value: None,
            window_ms,
            max_points: max_points.max(1),
        }
    }

    /// Appends `tick` anchored to its arrival time and returns the stored point.
    pub fn append(&mut self, tick: &PriceTick, arrival_ms: i64) -> WindowPoint {
        self.trim_to_cutoff(arrival_ms.saturating_sub(self.window_ms));

        let mut timestamp_ms = tick.timestamp_ms.max(arrival_ms);
        if let Some(last) = self.points.back() {
            if timestamp_ms <= last.timestamp_ms {
                timestamp_ms = last.timestamp_ms.saturating_add(1);
            }
        }

        let point = WindowPoint {
            timestamp_ms,
            value: tick.price,
        };
        self.points.push_back(point);
        self.last_value = Some(tick.price);
        self.trim_to_capacity();
        point
    }

    /// Extends a flat series to `now_ms` with the last known value. Returns
    /// whether a point was added.
    pub fn tick(&mut self, now_ms: i64) -> bool {
        let Some(value) = self.last_value else {
            return false;
        };
        if self
            .points
            .back()
            .is_some_and(|last| now_ms <= last.timestamp_ms)
        {
            return false;
        }

        self.trim_to_cutoff(now_ms.saturating_sub(self.window_ms));
        if self
            .points
            .back()
            .is_some_and(|last| now_ms <= last.timestamp_ms)
        {
            return false;
        }

        self.points.push_back(WindowPoint {
            timestamp_ms: now_ms,
            value,
        });
        self.trim_to_capacity();
        true
    }

    /// Seeds a buffer that has never seen a value. Live data always wins.
    pub fn seed(&mut self, price: f64, timestamp_ms: i64, now_ms: i64) -> bool {
        if self.last_value.is_some() || !price.is_finite() || price <= 0.0 {
            return false;
        }
        let tick = PriceTick {
            price,
            timestamp_ms,
            symbol: None,
        };
        self.append(&tick, now_ms);
        true
    }

    pub fn points(&self) -> Vec<WindowPoint> {
        self.points.iter().copied().collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.value).collect()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.points.back().map(|point| point.timestamp_ms)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn trim_to_cutoff(&mut self, cutoff_ms: i64) {
        while self
            .points
            .front()
            .is_some_and(|point| point.timestamp_ms < cutoff_ms)
        {
            self.points.pop_front();
        }

        if self.points.is_empty() {
            if let Some(value) = self.last_value {
                // Keep the line attached to the left edge.
                self.points.push_back(WindowPoint {
                    timestamp_ms: cutoff_ms.saturating_add(1),
                    value,
                });
            }
        }
    }

    fn trim_to_capacity(&mut self) {
        while self.points.len() > self.max_points {
            self.points.pop_front();
        }
    }
}
