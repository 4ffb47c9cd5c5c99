//! Broker adapter boundary
//!
//! The daemon consumes an abstract order/position capability; the concrete
//! transport lives outside this crate. Fill notifications arrive through a
//! callback hub that isolates each registered handler, so one misbehaving
//! handler cannot suppress the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::errors::{Result, SentinelError};
use crate::types::{BrokerFill, OrderRef, Side, StockCode};

/// One holding as reported by the broker
#[derive(Debug, Clone)]
pub struct BrokerHolding {
    pub stock_code: StockCode,
    pub volume: i64,
    pub available: i64,
    pub cost_price: f64,
}

/// Account summary as reported by the broker
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub cash: f64,
    pub total_asset: f64,
}

/// Outbound broker capability
///
/// Methods are synchronous; callers bound them with their own timeouts
/// (the monitor runs them on blocking workers under `monitor_call_timeout`).
pub trait BrokerAdapter: Send + Sync {
    /// Submit an order. Depending on the transport's call mode the result
    /// is the order id directly or a sequence number resolved later.
    fn order_stock(
        &self,
        account: &str,
        stock_code: &StockCode,
        side: Side,
        price: f64,
        volume: i64,
        strategy_tag: &str,
    ) -> Result<OrderRef>;

    fn cancel_order(&self, order_id: &str) -> Result<bool>;

    /// Raw broker-native status code; translate with `OrderStatus::from_raw`.
    fn query_order_status(&self, order_id: &str) -> Result<i32>;

    fn query_positions(&self, account: &str) -> Result<Vec<BrokerHolding>>;

    fn query_account(&self, account: &str) -> Result<AccountInfo>;
}

type FillHandler = Arc<dyn Fn(&BrokerFill) + Send + Sync>;

/// Registry of fill-callback handlers
///
/// Registration allows multiple independent handlers; dispatch invokes each
/// under a panic-isolating harness. A closed hub drops incoming fills,
/// which seals the callback path during shutdown before the store flushes.
#[derive(Clone, Default)]
pub struct CallbackHub {
    handlers: Arc<Mutex<Vec<FillHandler>>>,
    closed: Arc<AtomicBool>,
}

impl CallbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&BrokerFill) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("callback hub mutex poisoned")
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().expect("callback hub mutex poisoned").len()
    }

    /// Stop delivering fills. Late callbacks are logged and dropped; the
    /// share delta they carried is recovered by position reconciliation on
    /// the next start.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("callback hub closed, further fills will be dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver one fill to every handler; a panicking handler is logged
    /// and the remaining handlers still run.
    pub fn dispatch(&self, fill: &BrokerFill) {
        if self.is_closed() {
            debug!(
                "hub closed, dropping fill for order {} ({})",
                fill.order_id, fill.stock_code
            );
            return;
        }
        let handlers: Vec<FillHandler> = {
            let guard = self.handlers.lock().expect("callback hub mutex poisoned");
            guard.clone()
        };
        for (idx, handler) in handlers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(fill)));
            if outcome.is_err() {
                error!(
                    "fill handler #{idx} panicked on order {} ({}), continuing with the rest",
                    fill.order_id, fill.stock_code
                );
            }
        }
    }
}

/// In-process broker used for paper runs and tests
///
/// Orders are accepted immediately; with `auto_fill` on, a matching fill is
/// dispatched through the hub synchronously. With it off, orders sit in
/// `submitted` until the test marks them filled or cancels them, which is
/// how the sweeper slow path is exercised.
pub struct SimulatedBroker {
    hub: CallbackHub,
    seq: AtomicI64,
    auto_fill: bool,
    orders: Mutex<HashMap<String, SimOrder>>,
    holdings: Mutex<HashMap<StockCode, BrokerHolding>>,
    account: Mutex<AccountInfo>,
}

#[derive(Debug, Clone)]
struct SimOrder {
    stock_code: StockCode,
    side: Side,
    price: f64,
    volume: i64,
    status: i32,
}

impl SimulatedBroker {
    pub fn new(hub: CallbackHub, auto_fill: bool) -> Self {
        SimulatedBroker {
            hub,
            seq: AtomicI64::new(1),
            auto_fill,
            orders: Mutex::new(HashMap::new()),
            holdings: Mutex::new(HashMap::new()),
            account: Mutex::new(AccountInfo {
                cash: 1_000_000.0,
                total_asset: 1_000_000.0,
            }),
        }
    }

    pub fn hub(&self) -> &CallbackHub {
        &self.hub
    }

    /// Script the holdings reported by `query_positions`.
    pub fn set_holding(&self, holding: BrokerHolding) {
        self.holdings
            .lock()
            .unwrap()
            .insert(holding.stock_code.clone(), holding);
    }

    pub fn remove_holding(&self, stock_code: &StockCode) {
        self.holdings.lock().unwrap().remove(stock_code);
    }

    /// Force a resting order to fill now (sweeper tests: lost callbacks).
    pub fn mark_filled(&self, order_id: &str, dispatch: bool) {
        let fill = {
            let mut orders = self.orders.lock().unwrap();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };
            order.status = 56;
            BrokerFill {
                order_id: order_id.to_string(),
                stock_code: order.stock_code.clone(),
                side: order.side,
                traded_volume: order.volume,
                traded_price: order.price,
                traded_amount: order.volume as f64 * order.price,
                account_id: String::new(),
            }
        };
        if dispatch {
            self.hub.dispatch(&fill);
        }
    }

    fn next_order_id(&self, side: Side) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("SIMBRK_{}_{n}", side.as_str())
    }
}

impl BrokerAdapter for SimulatedBroker {
    fn order_stock(
        &self,
        _account: &str,
        stock_code: &StockCode,
        side: Side,
        price: f64,
        volume: i64,
        strategy_tag: &str,
    ) -> Result<OrderRef> {
        if price <= 0.0 || volume <= 0 {
            return Err(SentinelError::Broker(format!(
                "rejected order for {stock_code}: price={price} volume={volume}"
            )));
        }
        let order_id = self.next_order_id(side);
        self.orders.lock().unwrap().insert(
            order_id.clone(),
            SimOrder {
                stock_code: stock_code.clone(),
                side,
                price,
                volume,
                status: 50,
            },
        );
        debug!(
            "sim broker accepted {} {} x{} @ {:.3} [{}] -> {}",
            side, stock_code, volume, price, strategy_tag, order_id
        );
        if self.auto_fill {
            self.mark_filled(&order_id, true);
        }
        Ok(OrderRef::OrderId(order_id))
    }

    fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) if order.status < 53 => {
                order.status = 54;
                info!("sim broker cancelled {order_id}");
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    fn query_order_status(&self, order_id: &str) -> Result<i32> {
        let orders = self.orders.lock().unwrap();
        orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| SentinelError::Broker(format!("unknown order {order_id}")))
    }

    fn query_positions(&self, _account: &str) -> Result<Vec<BrokerHolding>> {
        Ok(self.holdings.lock().unwrap().values().cloned().collect())
    }

    fn query_account(&self, _account: &str) -> Result<AccountInfo> {
        Ok(self.account.lock().unwrap().clone())
    }
}
