// =============================================================================
// Chart renderer seam
// =============================================================================
//
// Rendering itself is a collaborator concern; the engine only fixes the
// interface and ships a null implementation. The caller owns the timeout —
// a renderer that cannot produce an image in time simply yields `None` and
// the alert goes out without one.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::timeframe::Timeframe;
use crate::types::Candle;

/// Everything a renderer needs for one MACD-V chart.
#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Oldest-first bars to draw.
    pub candles: Vec<Candle>,
    /// Label of the alert that asked for the chart ("level_-250", ...).
    pub trigger_label: String,
    /// How many of the most recent bars to display.
    pub display_bars: usize,
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Render a chart as PNG bytes, or `None` when no image is available.
    async fn render_macd_v_chart(&self, request: &ChartRequest)
        -> anyhow::Result<Option<Vec<u8>>>;
}

/// The shipped default: never produces an image.
pub struct NullRenderer;

#[async_trait]
impl ChartRenderer for NullRenderer {
    async fn render_macd_v_chart(
        &self,
        request: &ChartRequest,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        debug!(
            symbol = %request.symbol,
            tf = %request.timeframe,
            bars = request.candles.len(),
            display = request.display_bars,
            label = %request.trigger_label,
            "null renderer: no chart produced"
        );
        Ok(None)
    }
}
