// =============================================================================
// Stage classifier
// =============================================================================
//
// Maps a MACD-V reading plus the recent histogram direction onto the closed
// stage set. Thresholds (evaluated top-to-bottom):
//
//   v < -150            OVERSOLD
//   -150 <= v < -50     REBOUNDING when histogram rising, REVERSING falling
//   -50  <= v <= 50     RANGING
//   50   <  v <= 150    RALLYING when histogram rising, RETRACING falling
//   v > 150             OVERBOUGHT
//
// A band that needs a direction but sees a flat histogram classifies as
// UNKNOWN rather than guessing.
// =============================================================================

use crate::types::Stage;

/// Direction of the histogram over its last three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistDirection {
    Rising,
    Falling,
    Flat,
}

/// Direction from the last three histogram values: strictly increasing is
/// rising, strictly decreasing is falling. With only two values the single
/// step decides; with fewer, flat.
pub fn histogram_direction(histograms: &[f64]) -> HistDirection {
    match histograms {
        [.., a, b, c] => {
            if c > b && b > a {
                HistDirection::Rising
            } else if c < b && b < a {
                HistDirection::Falling
            } else {
                HistDirection::Flat
            }
        }
        [a, b] => {
            if b > a {
                HistDirection::Rising
            } else if b < a {
                HistDirection::Falling
            } else {
                HistDirection::Flat
            }
        }
        _ => HistDirection::Flat,
    }
}

pub fn classify(macd_v: f64, direction: HistDirection) -> Stage {
    if !macd_v.is_finite() {
        return Stage::Unknown;
    }

    if macd_v < -150.0 {
        Stage::Oversold
    } else if macd_v < -50.0 {
        match direction {
            HistDirection::Rising => Stage::Rebounding,
            HistDirection::Falling => Stage::Reversing,
            HistDirection::Flat => Stage::Unknown,
        }
    } else if macd_v <= 50.0 {
        Stage::Ranging
    } else if macd_v <= 150.0 {
        match direction {
            HistDirection::Rising => Stage::Rallying,
            HistDirection::Falling => Stage::Retracing,
            HistDirection::Flat => Stage::Unknown,
        }
    } else {
        Stage::Overbought
    }
}
