// =============================================================================
// MACD-V — volatility-normalised MACD
// =============================================================================
//
//   MACD      = EMA(close, 12) - EMA(close, 26)
//   MACD-V    = MACD / ATR(26) * 100
//   Signal    = EMA(MACD-V, 9)
//   Histogram = MACD-V - Signal
//
// The ATR here is "informative": an EMA of true ranges that skips synthetic
// bars entirely — a synthetic bar propagates the prior ATR unchanged, so a
// gap-filled series cannot drag volatility toward zero. Until `atr_period`
// real bars have been seen the ATR is a running mean of the real TRs seen so
// far (`seeded = false`).
//
// Synthetic bars DO feed the price EMAs; only the ATR skips them.
// =============================================================================

use crate::indicators::ema::{ema_series, smoothing};
use crate::indicators::stage::{classify, histogram_direction};
use crate::types::{Candle, MacdVValue, Stage};

pub const FAST_PERIOD: usize = 12;
pub const SLOW_PERIOD: usize = 26;
pub const ATR_PERIOD: usize = 26;
pub const SIGNAL_PERIOD: usize = 9;

/// Fewest bars a computation can possibly succeed on: the slow EMA plus the
/// signal EMA must both seed.
pub const MIN_BARS: usize = SLOW_PERIOD + SIGNAL_PERIOD;

pub const REASON_WARMUP: &str = "warmup";
pub const REASON_INSUFFICIENT_REAL_BARS: &str = "insufficient_real_bars";
pub const REASON_ALL_ZERO_RANGE: &str = "all_zero_range";

/// Result of one MACD-V computation over a (gap-filled) series.
#[derive(Debug, Clone)]
pub struct MacdVOutput {
    /// `None` when the series cannot support a trustworthy value; `reason`
    /// says why.
    pub value: Option<MacdVValue>,
    pub stage: Stage,
    /// True once `ATR_PERIOD` real bars have contributed to the ATR.
    pub seeded: bool,
    /// Real (non-synthetic) bars that contributed to the ATR.
    pub n_eff: usize,
    /// Total bars seen, synthetic included.
    pub span_bars: usize,
    pub reason: Option<String>,
}

impl MacdVOutput {
    fn empty(span_bars: usize, n_eff: usize, seeded: bool, reason: &str) -> Self {
        Self {
            value: None,
            stage: Stage::Unknown,
            seeded,
            n_eff,
            span_bars,
            reason: Some(reason.to_string()),
        }
    }
}

/// True range of bar `i`: `max(H-L, |H-prevClose|, |L-prevClose|)`, with the
/// first bar falling back to `H-L`.
fn true_range(candles: &[Candle], i: usize) -> f64 {
    let c = &candles[i];
    let hl = c.high - c.low;
    if i == 0 {
        return hl;
    }
    let prev_close = candles[i - 1].close;
    let hc = (c.high - prev_close).abs();
    let lc = (c.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Compute MACD-V over an ordered, contiguous (gap-filled) candle series.
pub fn compute(candles: &[Candle]) -> MacdVOutput {
    let n = candles.len();
    if n < MIN_BARS {
        return MacdVOutput::empty(n, 0, false, REASON_WARMUP);
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    // --- Price EMAs ---------------------------------------------------------
    // fast[j] pairs with bar FAST_PERIOD-1+j; slow[j] with bar SLOW_PERIOD-1+j.
    let fast = ema_series(&closes, FAST_PERIOD);
    let slow = ema_series(&closes, SLOW_PERIOD);

    // --- Informative ATR ----------------------------------------------------
    let mut atr_series: Vec<Option<f64>> = Vec::with_capacity(n);
    let mut atr: Option<f64> = None;
    let mut n_eff = 0usize;
    let mut seed_sum = 0.0;
    let k = smoothing(ATR_PERIOD);

    for i in 0..n {
        if !candles[i].is_synthetic {
            let tr = true_range(candles, i);
            n_eff += 1;
            if n_eff <= ATR_PERIOD {
                seed_sum += tr;
                atr = Some(seed_sum / n_eff as f64);
            } else {
                atr = atr.map(|a| tr * k + a * (1.0 - k));
            }
        }
        // Synthetic bars propagate the prior ATR unchanged.
        atr_series.push(atr);
    }
    let seeded = n_eff >= ATR_PERIOD;

    // --- MACD-V points ------------------------------------------------------
    // One point per bar where both the slow EMA and a positive ATR exist.
    let mut points: Vec<f64> = Vec::with_capacity(n - SLOW_PERIOD + 1);
    let mut last_point_bar = 0usize;
    let mut fast_at_last = 0.0;
    let mut slow_at_last = 0.0;
    let mut atr_at_last = 0.0;

    for i in (SLOW_PERIOD - 1)..n {
        let (Some(&f), Some(&s)) = (fast.get(i + 1 - FAST_PERIOD), slow.get(i + 1 - SLOW_PERIOD))
        else {
            break;
        };
        let Some(a) = atr_series[i] else { continue };
        if a <= 0.0 {
            continue;
        }
        points.push((f - s) / a * 100.0);
        last_point_bar = i;
        fast_at_last = f;
        slow_at_last = s;
        atr_at_last = a;
    }

    // The freshest bar must carry a value, otherwise the result is stale.
    if points.is_empty() || last_point_bar != n - 1 {
        let reason = match atr_series[n - 1] {
            Some(a) if a <= 0.0 => REASON_ALL_ZERO_RANGE,
            None => REASON_INSUFFICIENT_REAL_BARS,
            _ => REASON_WARMUP,
        };
        return MacdVOutput::empty(n, n_eff, seeded, reason);
    }

    // --- Signal & histogram -------------------------------------------------
    let signal_series = ema_series(&points, SIGNAL_PERIOD);
    if signal_series.is_empty() {
        let reason = if seeded {
            REASON_WARMUP
        } else {
            REASON_INSUFFICIENT_REAL_BARS
        };
        return MacdVOutput::empty(n, n_eff, seeded, reason);
    }

    // histogram[j] pairs with point SIGNAL_PERIOD-1+j.
    let histograms: Vec<f64> = signal_series
        .iter()
        .enumerate()
        .map(|(j, s)| points[SIGNAL_PERIOD - 1 + j] - s)
        .collect();

    let macd_v = points[points.len() - 1];
    let signal = signal_series[signal_series.len() - 1];
    let histogram = histograms[histograms.len() - 1];

    let stage = classify(macd_v, histogram_direction(&histograms));

    MacdVOutput {
        value: Some(MacdVValue {
            macd_v,
            signal,
            histogram,
            fast_ema: fast_at_last,
            slow_ema: slow_at_last,
            atr: atr_at_last,
        }),
        stage,
        seeded,
        n_eff,
        span_bars: n,
        reason: if seeded {
            None
        } else {
            Some(REASON_INSUFFICIENT_REAL_BARS.to_string())
        },
    }
}
