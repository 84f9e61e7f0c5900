// =============================================================================
// Broadcast hub
// =============================================================================
//
// Owns every push session. The WebSocket transport (api::ws) registers a
// session, forwards inbound frames here, and drains the session's bounded
// outbound queue to the socket. Fan-out never blocks a producer: a session
// whose queue is full is disconnected on the spot, and no session can stall
// another.
//
// Frames are JSON objects tagged by `type`, exactly the push-protocol shapes.
// Tick batches are delivered as ONE `ticks` message per session per pass,
// filtered to the session's subscription set. Market data flows only to
// authenticated sessions.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{FillEvent, MarginCallEvent};
use crate::market::orderbook::BookSnapshot;
use crate::market::{NewsEvent, Tick};
use crate::repo::Repository;
use crate::types::Principal;

/// Verifies opaque bearer tokens into principals. Implemented by the auth
/// collaborator; the hub knows nothing about token formats.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Principal>;
}

pub type SessionId = u64;

/// What a session wants to hear about.
#[derive(Debug, Clone)]
enum Subscription {
    All,
    Symbols(HashSet<String>),
}

impl Subscription {
    fn wants(&self, symbol: &str) -> bool {
        match self {
            Self::All => true,
            Self::Symbols(set) => set.contains(symbol),
        }
    }
}

/// Auth failures plus protocol errors a session may accumulate before the
/// hub closes it.
const MAX_STRIKES: u32 = 5;

struct Session {
    principal: Option<Principal>,
    subs: Subscription,
    last_seen: Instant,
    /// Repeated auth/protocol failures; the session closes at the cap.
    strikes: u32,
    tx: mpsc::Sender<String>,
}

impl Session {
    fn authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

pub struct Hub {
    sessions: RwLock<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
    queue_depth: usize,
    verifier: Arc<dyn TokenVerifier>,
    repo: Arc<Repository>,
}

impl Hub {
    pub fn new(verifier: Arc<dyn TokenVerifier>, repo: Arc<Repository>, queue_depth: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            verifier,
            repo,
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Register a connection; returns its id and the receiver the transport
    /// drains to the socket. A `connected` frame is already queued.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            principal: None,
            subs: Subscription::All,
            last_seen: Instant::now(),
            strikes: 0,
            tx,
        };
        let _ = session.tx.try_send(frame_str(&json!({"type": "connected"})));
        self.sessions.write().insert(id, session);
        info!(session_id = id, "hub session registered");
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) {
        if self.sessions.write().remove(&id).is_some() {
            info!(session_id = id, "hub session removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    // =========================================================================
    // Inbound protocol
    // =========================================================================

    /// Handle one inbound text frame. Malformed frames get an error reply and
    /// the session stays open.
    pub fn handle_inbound(&self, id: SessionId, raw: &str) {
        {
            let mut sessions = self.sessions.write();
            if let Some(s) = sessions.get_mut(&id) {
                s.last_seen = Instant::now();
            } else {
                return;
            }
        }

        let parsed: Result<Value, _> = serde_json::from_str(raw);
        let Ok(msg) = parsed else {
            self.send_to(id, &json!({"type": "error", "message": "malformed frame"}));
            self.strike(id);
            return;
        };

        match msg.get("type").and_then(Value::as_str) {
            Some("auth") => {
                let token = msg.get("token").and_then(Value::as_str).unwrap_or("");
                self.handle_auth(id, token);
            }
            Some("subscribe") => {
                let tickers: HashSet<String> = msg
                    .get("tickers")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let mut sessions = self.sessions.write();
                if let Some(s) = sessions.get_mut(&id) {
                    // Replaces the whole set; resubscribing is idempotent.
                    s.subs = Subscription::Symbols(tickers);
                }
            }
            Some("subscribe_all") => {
                let mut sessions = self.sessions.write();
                if let Some(s) = sessions.get_mut(&id) {
                    s.subs = Subscription::All;
                }
            }
            Some("unsubscribe") => {
                let ticker = msg.get("ticker").and_then(Value::as_str).unwrap_or("");
                let mut sessions = self.sessions.write();
                if let Some(s) = sessions.get_mut(&id) {
                    match &mut s.subs {
                        Subscription::Symbols(set) => {
                            set.remove(ticker);
                        }
                        Subscription::All => {
                            // Unsubscribing from ALL pins down the remainder
                            // explicitly; without a universe list the session
                            // keeps ALL minus nothing, so leave it.
                        }
                    }
                }
            }
            Some("ping") => {
                self.send_to(
                    id,
                    &json!({"type": "pong", "timestamp": Utc::now().timestamp_millis()}),
                );
            }
            other => {
                debug!(session_id = id, frame_type = ?other, "unknown inbound frame");
                self.send_to(id, &json!({"type": "error", "message": "unknown frame type"}));
                self.strike(id);
            }
        }
    }

    fn handle_auth(&self, id: SessionId, token: &str) {
        match self.verifier.verify(token) {
            Some(principal) => {
                let username = principal.username.clone();
                let user_id = principal.user_id.clone();
                {
                    let mut sessions = self.sessions.write();
                    if let Some(s) = sessions.get_mut(&id) {
                        s.principal = Some(principal);
                        // Fresh logins hear everything until they narrow it.
                        s.subs = Subscription::All;
                    }
                }
                info!(session_id = id, username = %username, "session authenticated");
                self.send_to(id, &json!({"type": "authenticated", "username": username}));
                self.push_portfolio(id, &user_id);
            }
            None => {
                warn!(session_id = id, "session auth failed");
                self.send_to(
                    id,
                    &json!({"type": "auth_error", "message": "invalid or expired token"}),
                );
                self.strike(id);
            }
        }
    }

    /// Count a misbehaviour; repeated offenders are closed.
    fn strike(&self, id: SessionId) {
        let over = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&id) {
                Some(s) => {
                    s.strikes += 1;
                    s.strikes >= MAX_STRIKES
                }
                None => false,
            }
        };
        if over {
            self.drop_sessions(&[id], "repeated protocol or auth errors");
        }
    }

    /// Initial portfolio snapshot sent right after authentication.
    fn push_portfolio(&self, id: SessionId, user_id: &str) {
        let cash = match self.repo.get_user(user_id) {
            Ok(Some(u)) => u.cash,
            _ => return,
        };
        let positions = self.repo.get_positions(user_id).unwrap_or_default();
        let open_orders = self.repo.get_open_orders_by_user(user_id).unwrap_or_default();
        self.send_to(
            id,
            &json!({
                "type": "portfolio",
                "cash": cash,
                "positions": positions,
                "openOrders": open_orders,
            }),
        );
    }

    // =========================================================================
    // Outbound fan-out
    // =========================================================================

    /// Deliver a tick batch: one filtered `ticks` message per authenticated
    /// session. Sessions with full queues are disconnected, not waited on.
    pub fn on_tick_batch(&self, batch: &[Tick]) {
        let mut overflowed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if !session.authenticated() {
                    continue;
                }
                let filtered: Vec<&Tick> = batch
                    .iter()
                    .filter(|t| session.subs.wants(&t.ticker))
                    .collect();
                if filtered.is_empty() {
                    continue;
                }
                let frame = frame_str(&json!({"type": "ticks", "data": filtered}));
                if session.tx.try_send(frame).is_err() {
                    overflowed.push(*id);
                }
            }
        }
        self.drop_sessions(&overflowed, "outbound queue overflow");
    }

    pub fn on_fill(&self, fill: &FillEvent) {
        let frame = json!({
            "type": "fill",
            "orderId": fill.order_id,
            "ticker": fill.ticker,
            "side": fill.side,
            "qty": fill.qty,
            "price": fill.price,
            "commission": fill.commission,
            "slippage_bps": fill.slippage_bps,
            "borrow_cost": fill.borrow_cost,
            "pnl": fill.pnl,
            "executed_at": fill.executed_at,
        });
        self.send_to_user(&fill.user_id, &frame);
    }

    pub fn on_margin_call(&self, call: &MarginCallEvent) {
        let frame = json!({
            "type": "margin_call",
            "ticker": call.ticker,
            "qty": call.qty,
            "price": call.price,
            "pnl": call.pnl,
        });
        self.send_to_user(&call.user_id, &frame);
    }

    pub fn on_news(&self, event: &NewsEvent) {
        let frame = frame_str(&json!({"type": "news", "data": event}));
        let mut overflowed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if !session.authenticated() {
                    continue;
                }
                if session.tx.try_send(frame.clone()).is_err() {
                    overflowed.push(*id);
                }
            }
        }
        self.drop_sessions(&overflowed, "outbound queue overflow");
    }

    /// Push an order-book snapshot to sessions subscribed to its symbol.
    pub fn on_orderbook(&self, book: &BookSnapshot) {
        let frame = frame_str(&json!({"type": "orderbook", "data": book}));
        let mut overflowed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if !session.authenticated() || !session.subs.wants(&book.ticker) {
                    continue;
                }
                if session.tx.try_send(frame.clone()).is_err() {
                    overflowed.push(*id);
                }
            }
        }
        self.drop_sessions(&overflowed, "outbound queue overflow");
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// Terminate sessions silent for more than two heartbeat intervals.
    pub fn heartbeat_pass(&self, interval_secs: u64) {
        let cutoff = std::time::Duration::from_secs(interval_secs * 2);
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(_, s)| s.last_seen.elapsed() > cutoff)
                .map(|(id, _)| *id)
                .collect()
        };
        self.drop_sessions(&stale, "heartbeat timeout");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn send_to(&self, id: SessionId, frame: &Value) {
        let overflow = {
            let sessions = self.sessions.read();
            match sessions.get(&id) {
                Some(s) => s.tx.try_send(frame_str(frame)).is_err(),
                None => false,
            }
        };
        if overflow {
            self.drop_sessions(&[id], "outbound queue overflow");
        }
    }

    fn send_to_user(&self, user_id: &str, frame: &Value) {
        let raw = frame_str(frame);
        let mut overflowed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                let owned = session
                    .principal
                    .as_ref()
                    .map(|p| p.user_id == user_id)
                    .unwrap_or(false);
                if owned && session.tx.try_send(raw.clone()).is_err() {
                    overflowed.push(*id);
                }
            }
        }
        self.drop_sessions(&overflowed, "outbound queue overflow");
    }

    fn drop_sessions(&self, ids: &[SessionId], reason: &str) {
        if ids.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write();
        for id in ids {
            if sessions.remove(id).is_some() {
                warn!(session_id = id, reason, "session disconnected");
            }
        }
    }
}

fn frame_str(v: &Value) -> String {
    v.to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;
    use crate::types::UserRole;

    struct StubVerifier;

    impl TokenVerifier for StubVerifier {
        fn verify(&self, token: &str) -> Option<Principal> {
            match token {
                "good" => Some(Principal {
                    user_id: "u1".into(),
                    username: "alice".into(),
                    role: UserRole::Trader,
                }),
                _ => None,
            }
        }
    }

    fn make_hub(queue_depth: usize) -> (Hub, tempfile::TempDir) {
        let (repo, dir) = test_repo();
        let hub = Hub::new(Arc::new(StubVerifier), Arc::new(repo), queue_depth);
        (hub, dir)
    }

    fn tick(sym: &str) -> Tick {
        Tick {
            ticker: sym.into(),
            price: 100.0,
            bid: 99.9,
            ask: 100.1,
            open: 100.0,
            high: 100.0,
            low: 100.0,
            prev_close: 100.0,
            volume: 0.0,
            change_pct: 0.0,
            regime: crate::market::regime::MarketRegime::Normal,
            volatility: 0.0,
            timestamp: 0,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn connect_then_auth_flow() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();

        hub.handle_inbound(id, r#"{"type":"auth","token":"good"}"#);
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "connected");
        assert_eq!(frames[1]["type"], "authenticated");
        assert_eq!(frames[1]["username"], "alice");
    }

    #[tokio::test]
    async fn bad_token_yields_auth_error_and_no_market_data() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();

        hub.handle_inbound(id, r#"{"type":"auth","token":"bad"}"#);
        hub.on_tick_batch(&[tick("MERX")]);

        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f["type"] == "auth_error"));
        assert!(!frames.iter().any(|f| f["type"] == "ticks"));
    }

    #[tokio::test]
    async fn tick_batches_filter_by_subscription() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();
        hub.handle_inbound(id, r#"{"type":"auth","token":"good"}"#);
        hub.handle_inbound(id, r#"{"type":"subscribe","tickers":["GLDR"]}"#);
        drain(&mut rx);

        hub.on_tick_batch(&[tick("MERX"), tick("GLDR")]);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let data = frames[0]["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["ticker"], "GLDR");
    }

    #[tokio::test]
    async fn subscribing_twice_is_idempotent() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();
        hub.handle_inbound(id, r#"{"type":"auth","token":"good"}"#);
        hub.handle_inbound(id, r#"{"type":"subscribe","tickers":["MERX","MERX"]}"#);
        hub.handle_inbound(id, r#"{"type":"subscribe","tickers":["MERX"]}"#);
        drain(&mut rx);

        hub.on_tick_batch(&[tick("MERX")]);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_message_per_session_per_batch() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();
        hub.handle_inbound(id, r#"{"type":"auth","token":"good"}"#);
        drain(&mut rx);

        hub.on_tick_batch(&[tick("MERX"), tick("GLDR"), tick("BTCX")]);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1, "batch must coalesce into one frame");
        assert_eq!(frames[0]["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn slow_session_is_dropped_without_stalling_others() {
        let (hub, _d) = make_hub(2);
        let (slow_id, _slow_rx) = hub.register(); // never drained
        let (fast_id, mut fast_rx) = hub.register();
        hub.handle_inbound(slow_id, r#"{"type":"auth","token":"good"}"#);
        hub.handle_inbound(fast_id, r#"{"type":"auth","token":"good"}"#);
        drain(&mut fast_rx);

        // Queue depth 2 is already partly used by connected/auth frames, so a
        // few batches overflow the slow session.
        for _ in 0..5 {
            hub.on_tick_batch(&[tick("MERX")]);
            drain(&mut fast_rx);
        }

        assert_eq!(hub.session_count(), 1, "slow session dropped");
        hub.on_tick_batch(&[tick("MERX")]);
        assert!(!drain(&mut fast_rx).is_empty(), "fast session still served");
    }

    #[tokio::test]
    async fn fills_route_only_to_owner() {
        let (hub, _d) = make_hub(16);
        let (owner, mut owner_rx) = hub.register();
        let (other, mut other_rx) = hub.register();
        hub.handle_inbound(owner, r#"{"type":"auth","token":"good"}"#);
        hub.handle_inbound(other, r#"{"type":"auth","token":"good"}"#);
        drain(&mut owner_rx);
        drain(&mut other_rx);

        hub.on_fill(&FillEvent {
            user_id: "u1".into(),
            order_id: "o1".into(),
            ticker: "MERX".into(),
            side: crate::types::Side::Buy,
            qty: 1.0,
            price: 100.0,
            commission: 1.0,
            slippage_bps: 3.0,
            borrow_cost: 0.0,
            pnl: 0.0,
            executed_at: 0,
        });

        // Both sessions belong to u1 here; both get it.
        assert!(drain(&mut owner_rx).iter().any(|f| f["type"] == "fill"));
        assert!(drain(&mut other_rx).iter().any(|f| f["type"] == "fill"));
    }

    #[tokio::test]
    async fn ping_gets_pong_and_malformed_gets_error() {
        let (hub, _d) = make_hub(16);
        let (id, mut rx) = hub.register();

        hub.handle_inbound(id, r#"{"type":"ping"}"#);
        hub.handle_inbound(id, "not json at all");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f["type"] == "pong"));
        assert!(frames.iter().any(|f| f["type"] == "error"));
        // Session survives the protocol error.
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn repeated_bad_auth_closes_the_session() {
        let (hub, _d) = make_hub(32);
        let (id, _rx) = hub.register();
        for _ in 0..MAX_STRIKES {
            hub.handle_inbound(id, r#"{"type":"auth","token":"bad"}"#);
        }
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_drops_silent_sessions() {
        let (hub, _d) = make_hub(16);
        let (_id, _rx) = hub.register();
        assert_eq!(hub.session_count(), 1);

        // Zero-interval heartbeat: anything older than "now" is stale.
        hub.heartbeat_pass(0);
        assert_eq!(hub.session_count(), 0);
    }
}
