// =============================================================================
// Market-data subsystem: tick generation, regimes, candles, news, books
// =============================================================================

pub mod candles;
pub mod engine;
pub mod news;
pub mod orderbook;
pub mod regime;

pub use candles::{Candle, CandleAggregator, INTERVALS};
pub use engine::{MarketEngine, Tick};
pub use news::{NewsEvent, NewsGenerator};
pub use orderbook::{BookLevel, BookSnapshot, OpenLimit};
pub use regime::{MarketRegime, RegimeMachine};
