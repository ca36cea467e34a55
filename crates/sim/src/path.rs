//! Base path construction: per-horse speed curves and integrated positions.
//!
//! Every horse gets a smooth speed curve over the full tick grid, shaped by
//! four fixed relative control points (15%, 50%, 85%, 100% of the race) whose
//! amplitudes are drawn from the `paths` RNG role. Segments between control
//! points are joined by fixed easing so the curve has no kinks:
//!
//! ```text
//! start ──ease-out──► slow start ──ease-in-out──► mid dip
//!       ──ease-out──► recovery   ──ease-in─────► late sprint
//! ```
//!
//! Positions are integrated tick by tick and clamped to the finish line; the
//! exact crossing time inside the crossing tick window is interpolated and
//! recorded.

use serde::Serialize;

use crate::rng::SeededRng;
use crate::{HorseSeed, RaceConfig, Tick};

/// Global lower clamp for any speed curve, m/s.
pub const MIN_SPEED_FLOOR: f64 = 30.0;

/// Global upper clamp for any speed curve, m/s.
pub const MAX_SPEED_CEILING: f64 = 70.0;

/// Segment easing applied between adjacent control points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Easing {
    Out,
    InOut,
    In,
}

impl Easing {
    fn apply(self, u: f64) -> f64 {
        match self {
            Self::Out => u * (2.0 - u),
            Self::In => u * u,
            Self::InOut => {
                if u < 0.5 {
                    2.0 * u * u
                } else {
                    1.0 - (-2.0 * u + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

/// One relative control point: position along the race, amplitude band for
/// the RNG draw (in units of `accel_variance`), easing into this point.
struct ControlPoint {
    at: f64,
    band: (f64, f64),
    easing: Easing,
}

/// Slow start, mid dip, recovery, late sprint.
const CONTROL_POINTS: [ControlPoint; 4] = [
    ControlPoint {
        at: 0.15,
        band: (-0.8, -0.3),
        easing: Easing::Out,
    },
    ControlPoint {
        at: 0.50,
        band: (-1.0, -0.5),
        easing: Easing::InOut,
    },
    ControlPoint {
        at: 0.85,
        band: (-0.1, 0.5),
        easing: Easing::Out,
    },
    ControlPoint {
        at: 1.00,
        band: (1.0, 2.0),
        easing: Easing::In,
    },
];

/// Precomputed base path for one horse: the unperturbed race it would run if
/// no events fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorsePath {
    pub horse_id: String,
    /// Starting lane (1-based field position); events may swap lanes later,
    /// the base path never does.
    pub lane: u8,
    /// Speed at each tick index, m/s.
    pub speeds: Vec<f64>,
    /// Integrated position at each tick index, meters. Monotone
    /// non-decreasing, clamped to the finish line.
    pub positions: Vec<f64>,
    /// Exact interpolated crossing time in ms from race start, if the base
    /// path reaches the finish line within the grid.
    pub base_finish_ms: Option<f64>,
    /// First tick index at which the base position sits on the finish line.
    pub base_finish_tick: Option<Tick>,
}

/// Base paths for the whole field, in horse order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BasePaths {
    pub horses: Vec<HorsePath>,
}

/// Build base paths for every horse.
///
/// RNG contract: consumes the `paths` role, exactly four draws per horse in
/// ascending horse order, one per control point.
pub fn build_base_paths(config: &RaceConfig, horses: &[HorseSeed]) -> BasePaths {
    let mut rng = SeededRng::for_role(&config.seed, "paths");
    let total = config.total_ticks();
    let finish = config.finish_line();
    let dt = config.dt_s();

    let paths = horses
        .iter()
        .enumerate()
        .map(|(i, horse)| {
            let amplitudes: Vec<f64> = CONTROL_POINTS
                .iter()
                .map(|cp| rng.next_range(cp.band.0, cp.band.1))
                .collect();
            build_horse_path(
                horse,
                (i + 1) as u8,
                &amplitudes,
                total,
                finish,
                dt,
                config.tick_ms,
            )
        })
        .collect();

    BasePaths { horses: paths }
}

fn build_horse_path(
    horse: &HorseSeed,
    lane: u8,
    amplitudes: &[f64],
    total_ticks: Tick,
    finish_line: f64,
    dt_s: f64,
    tick_ms: u64,
) -> HorsePath {
    let clamp_lo = (horse.base_speed - horse.accel_variance).max(MIN_SPEED_FLOOR);
    let clamp_hi = (horse.base_speed + 2.0 * horse.accel_variance).min(MAX_SPEED_CEILING);

    // Knot values: race start at base speed, then one knot per control point.
    let knot_values: Vec<f64> = std::iter::once(horse.base_speed)
        .chain(
            amplitudes
                .iter()
                .map(|amp| horse.base_speed + amp * horse.accel_variance),
        )
        .collect();

    let span = f64::from(total_ticks - 1);
    let speeds: Vec<f64> = (0..total_ticks)
        .map(|tick| {
            let frac = f64::from(tick) / span;
            curve_value(&knot_values, frac).clamp(clamp_lo, clamp_hi)
        })
        .collect();

    let mut positions = Vec::with_capacity(total_ticks as usize);
    positions.push(0.0);
    let mut base_finish_ms = None;
    let mut base_finish_tick = None;
    let mut finished = false;

    for tick in 0..total_ticks - 1 {
        let prev = positions[tick as usize];
        if finished {
            positions.push(finish_line);
            continue;
        }

        let step = speeds[tick as usize] * dt_s;
        let next = prev + step;
        if next >= finish_line {
            // Interpolate the exact crossing time within this tick window.
            let frac_in_tick = if step > 0.0 {
                (finish_line - prev) / step
            } else {
                0.0
            };
            base_finish_ms = Some((f64::from(tick) + frac_in_tick) * tick_ms as f64);
            base_finish_tick = Some(tick + 1);
            finished = true;
            positions.push(finish_line);
        } else {
            positions.push(next);
        }
    }

    HorsePath {
        horse_id: horse.id.clone(),
        lane,
        speeds,
        positions,
        base_finish_ms,
        base_finish_tick,
    }
}

/// Evaluate the eased piecewise curve at `frac` in [0, 1].
fn curve_value(knot_values: &[f64], frac: f64) -> f64 {
    let mut seg_start = 0.0;
    let mut start_value = knot_values[0];

    for (cp, &end_value) in CONTROL_POINTS.iter().zip(&knot_values[1..]) {
        if frac <= cp.at {
            let width = cp.at - seg_start;
            let u = if width > 0.0 {
                (frac - seg_start) / width
            } else {
                1.0
            };
            let eased = cp.easing.apply(u);
            return start_value + (end_value - start_value) * eased;
        }
        seg_start = cp.at;
        start_value = end_value;
    }

    *knot_values.last().expect("curve has knots")
}
