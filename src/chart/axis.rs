use crate::chart::types::AxisRange;

const TARGET_TICKS: usize = 5;
const TIGHT_SPREAD: f64 = 0.005;
const TIGHT_MIN_MAGNITUDE: f64 = 50.0;
const TIGHT_HALF_RANGE: f64 = 0.01;
const RELATIVE_SPAN_FLOOR: f64 = 0.00002;
const PADDING_RATIO: f64 = 0.08;
const MAX_TICKS: usize = 64;

pub fn fallback_axis() -> AxisRange {
    AxisRange {
        min: 0.0,
        max: 1.0,
        ticks: vec![0.0, 1.0],
    }
}

/// Computes a readable `{min, max, ticks}` that always contains every value.
pub fn compute_axis(values: &[f64]) -> AxisRange {
    let mut finite = values.iter().copied().filter(|value| value.is_finite());
    let Some(first) = finite.next() else {
        return fallback_axis();
    };
    let (min_value, max_value) =
        finite.fold((first, first), |(low, high), value| (low.min(value), high.max(value)));
    let midpoint = (min_value + max_value) / 2.0;
    let spread = max_value - min_value;

    if spread < TIGHT_SPREAD && midpoint.abs() >= TIGHT_MIN_MAGNITUDE {
        return tight_axis(midpoint);
    }

    let span_floor = (midpoint.abs() * RELATIVE_SPAN_FLOOR).max(if midpoint.abs() >= 1.0 {
        0.002
    } else {
        0.0002
    });
    let span = spread.max(span_floor);
    let padding = (span * PADDING_RATIO).max(span_floor * PADDING_RATIO);
    let padded_min = (midpoint - span / 2.0).min(min_value) - padding;
    let padded_max = (midpoint + span / 2.0).max(max_value) + padding;

    let step = nice_step((padded_max - padded_min) / (TARGET_TICKS - 1) as f64);
    if !step.is_finite() || step <= 0.0 {
        return fallback_axis();
    }

    let axis_min = (padded_min / step).floor() * step;
    let axis_max = (padded_max / step).ceil() * step;
    let decimals = tick_decimals(step);
    let tick_count = (((axis_max - axis_min) / step).round() as usize).min(MAX_TICKS);
    let ticks = (0..=tick_count)
        .map(|index| round_to(axis_min + index as f64 * step, decimals))
        .collect();

    AxisRange {
        min: axis_min.min(min_value),
        max: axis_max.max(max_value),
        ticks,
    }
}

fn tight_axis(midpoint: f64) -> AxisRange {
    let center = round_to(midpoint, 2);
    let min = round_to(center - TIGHT_HALF_RANGE, 2);
    let max = round_to(center + TIGHT_HALF_RANGE, 2);
    AxisRange {
        min,
        max,
        ticks: vec![min, center, max],
    }
}

/// Snaps a raw step to 1, 2 or 5 times a power of ten.
pub fn nice_step(raw_step: f64) -> f64 {
    if !raw_step.is_finite() || raw_step <= 0.0 {
        return 0.0;
    }
    let magnitude = 10_f64.powf(raw_step.log10().floor());
    let residual = raw_step / magnitude;
    let multiplier = if residual <= 1.0 {
        1.0
    } else if residual <= 2.0 {
        2.0
    } else if residual <= 5.0 {
        5.0
    } else {
        10.0
    };
    multiplier * magnitude
}

// Two decimals unless the step itself is finer.
fn tick_decimals(step: f64) -> i32 {
    let needed = (-step.log10().floor()) as i32;
    needed.clamp(2, 10)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
