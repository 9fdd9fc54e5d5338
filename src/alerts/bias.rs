// =============================================================================
// Multi-timeframe bias score
// =============================================================================
//
// Each timeframe's stage votes bullish or bearish with a weight that grows
// with the timeframe: a 1d stage outweighs a 1m stage six to one. A side
// needs a 1.5x margin over the other to call the bias; anything tighter is
// neutral.
// =============================================================================

use std::collections::HashMap;

use crate::timeframe::Timeframe;
use crate::types::{IndicatorValue, Stage};

/// Vote weight per timeframe.
pub fn timeframe_weight(tf: Timeframe) -> f64 {
    match tf {
        Timeframe::M1 => 1.0,
        Timeframe::M5 => 2.0,
        Timeframe::M15 => 3.0,
        Timeframe::H1 => 4.0,
        Timeframe::H4 => 5.0,
        Timeframe::D1 => 6.0,
    }
}

fn is_bullish(stage: Stage) -> bool {
    matches!(stage, Stage::Oversold | Stage::Rebounding | Stage::Rallying)
}

fn is_bearish(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::Overbought | Stage::Retracing | Stage::Reversing
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct BiasSummary {
    pub bullish_score: f64,
    pub bearish_score: f64,
    /// "Bullish" | "Bearish" | "Neutral"
    pub label: &'static str,
}

/// Score a multi-timeframe context (as returned by the bulk indicator
/// fetch, keyed `"{symbol}:{tf}"`).
pub fn compute_bias(context: &HashMap<String, IndicatorValue>) -> BiasSummary {
    let mut bullish = 0.0;
    let mut bearish = 0.0;

    for value in context.values() {
        let weight = timeframe_weight(value.timeframe);
        if is_bullish(value.params.stage) {
            bullish += weight;
        } else if is_bearish(value.params.stage) {
            bearish += weight;
        }
    }

    let label = if bullish > 1.5 * bearish && bullish > 0.0 {
        "Bullish"
    } else if bearish > 1.5 * bullish && bearish > 0.0 {
        "Bearish"
    } else {
        "Neutral"
    };

    BiasSummary {
        bullish_score: bullish,
        bearish_score: bearish,
        label,
    }
}
