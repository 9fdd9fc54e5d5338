// =============================================================================
// Indicator engine
// =============================================================================
//
// Pure, side-effect-free computation: gap-fill the input series, run the
// MACD-V pipeline, classify the stage. Nothing in here performs I/O — the
// scheduler owns reading bars and publishing results.

pub mod ema;
pub mod gap_fill;
pub mod macd_v;
pub mod stage;
