// =============================================================================
// Event bus
// =============================================================================
//
// The sole coupling between the engine, the matcher and the hub. The engine
// publishes tick batches and news; the matcher publishes fills and margin
// calls; the hub subscribes to all four. Nothing holds a direct pointer to
// anything else.
//
// Built on tokio broadcast channels: publishing never blocks, and a receiver
// that falls behind loses old messages rather than stalling producers.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::market::{NewsEvent, Tick};
use crate::types::Side;

/// A booked fill, published after its repository transaction commits.
#[derive(Debug, Clone, Serialize)]
pub struct FillEvent {
    /// Routing key; the hub delivers fills only to the owning user.
    pub user_id: String,
    pub order_id: String,
    pub ticker: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
    pub slippage_bps: f64,
    pub borrow_cost: f64,
    pub pnl: f64,
    pub executed_at: i64,
}

/// Forced-liquidation notice, published before the covering fill.
#[derive(Debug, Clone, Serialize)]
pub struct MarginCallEvent {
    pub user_id: String,
    pub ticker: String,
    pub qty: f64,
    pub price: f64,
    pub pnl: f64,
}

/// Typed pub/sub fan-out. Cheap to clone via `Arc`.
pub struct EventBus {
    ticks: broadcast::Sender<Arc<Vec<Tick>>>,
    fills: broadcast::Sender<FillEvent>,
    news: broadcast::Sender<NewsEvent>,
    margin_calls: broadcast::Sender<MarginCallEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (ticks, _) = broadcast::channel(capacity);
        let (fills, _) = broadcast::channel(capacity);
        let (news, _) = broadcast::channel(capacity);
        let (margin_calls, _) = broadcast::channel(capacity);
        Self {
            ticks,
            fills,
            news,
            margin_calls,
        }
    }

    // Publishing to a bus with no subscribers is not an error; the send
    // results are deliberately discarded.

    pub fn publish_ticks(&self, batch: Arc<Vec<Tick>>) {
        let _ = self.ticks.send(batch);
    }

    pub fn publish_fill(&self, fill: FillEvent) {
        let _ = self.fills.send(fill);
    }

    pub fn publish_news(&self, event: NewsEvent) {
        let _ = self.news.send(event);
    }

    pub fn publish_margin_call(&self, event: MarginCallEvent) {
        let _ = self.margin_calls.send(event);
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Arc<Vec<Tick>>> {
        self.ticks.subscribe()
    }

    pub fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.fills.subscribe()
    }

    pub fn subscribe_news(&self) -> broadcast::Receiver<NewsEvent> {
        self.news.subscribe()
    }

    pub fn subscribe_margin_calls(&self) -> broadcast::Receiver<MarginCallEvent> {
        self.margin_calls.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::regime::MarketRegime;

    fn tick(sym: &str) -> Tick {
        Tick {
            ticker: sym.to_string(),
            price: 100.0,
            bid: 99.9,
            ask: 100.1,
            open: 100.0,
            high: 100.5,
            low: 99.5,
            prev_close: 100.0,
            volume: 1_000.0,
            change_pct: 0.0,
            regime: MarketRegime::Normal,
            volatility: 0.01,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_batches() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_ticks();
        bus.publish_ticks(Arc::new(vec![tick("MERX")]));
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].ticker, "MERX");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish_fill(FillEvent {
            user_id: "u".into(),
            order_id: "o".into(),
            ticker: "MERX".into(),
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            commission: 1.0,
            slippage_bps: 2.0,
            borrow_cost: 0.0,
            pnl: 0.0,
            executed_at: 0,
        });
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_a_copy() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe_ticks();
        let mut b = bus.subscribe_ticks();
        bus.publish_ticks(Arc::new(vec![tick("GLDR")]));
        assert_eq!(a.recv().await.unwrap()[0].ticker, "GLDR");
        assert_eq!(b.recv().await.unwrap()[0].ticker, "GLDR");
    }
}
