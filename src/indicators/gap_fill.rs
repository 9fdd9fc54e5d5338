// =============================================================================
// Gap fill — synthetic flat bars for missing buckets
// =============================================================================
//
// Exchanges with thin books simply omit bars for minutes without trades. The
// indicator engine needs a contiguous series, so every missing bucket gets a
// placeholder bar priced at the previous close with zero volume and zero
// range. Synthetic bars feed the price EMAs but are skipped by the
// informative ATR, and the gap ratio they produce grades the series'
// liquidity.
// =============================================================================

use serde::Serialize;

use crate::timeframe::Timeframe;
use crate::types::{Candle, Liquidity};

/// What the fill pass did to the series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GapFillStats {
    pub original_count: usize,
    pub filled_count: usize,
    pub synthetic_count: usize,
    /// synthetic / filled; 0 for an empty series.
    pub gap_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct GapFillResult {
    pub candles: Vec<Candle>,
    pub stats: GapFillStats,
}

/// Insert a synthetic bar for every missing bucket between consecutive
/// candles. Input must be sorted ascending by timestamp; duplicate
/// timestamps are collapsed to the first occurrence.
pub fn fill_gaps(candles: &[Candle], tf: Timeframe) -> GapFillResult {
    let step = tf.ms();
    let mut filled: Vec<Candle> = Vec::with_capacity(candles.len());
    let mut synthetic_count = 0usize;

    for candle in candles {
        if let Some(prev) = filled.last() {
            if candle.timestamp <= prev.timestamp {
                continue;
            }
            let mut cursor = prev.timestamp + step;
            let prev_close = prev.close;
            while cursor < candle.timestamp {
                filled.push(Candle {
                    timestamp: cursor,
                    open: prev_close,
                    high: prev_close,
                    low: prev_close,
                    close: prev_close,
                    volume: 0.0,
                    symbol: candle.symbol.clone(),
                    timeframe: tf,
                    is_synthetic: true,
                });
                synthetic_count += 1;
                cursor += step;
            }
        }
        filled.push(candle.clone());
    }

    let filled_count = filled.len();
    let gap_ratio = if filled_count > 0 {
        synthetic_count as f64 / filled_count as f64
    } else {
        0.0
    };

    GapFillResult {
        candles: filled,
        stats: GapFillStats {
            original_count: candles.len(),
            filled_count,
            synthetic_count,
            gap_ratio,
        },
    }
}

/// Liquidity grade from the gap ratio.
pub fn liquidity_grade(gap_ratio: f64) -> Liquidity {
    if gap_ratio < 0.02 {
        Liquidity::A
    } else if gap_ratio < 0.05 {
        Liquidity::B
    } else if gap_ratio < 0.15 {
        Liquidity::C
    } else if gap_ratio < 0.30 {
        Liquidity::D
    } else {
        Liquidity::F
    }
}

/// Fraction of non-synthetic bars with `high == low`.
pub fn zero_range_ratio(candles: &[Candle]) -> f64 {
    let real: Vec<&Candle> = candles.iter().filter(|c| !c.is_synthetic).collect();
    if real.is_empty() {
        return 0.0;
    }
    let zero = real.iter().filter(|c| c.high == c.low).count();
    zero as f64 / real.len() as f64
}
