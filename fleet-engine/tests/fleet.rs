//! Fleet reconciliation and panic isolation, driven through a mock broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use fleet_backtest::BacktestStorage;
use fleet_broker::{Broker, BrokerError, BrokerResult};
use fleet_core::{
    Instrument, LastPrice, OrderUpdate, PostOrderResult, Quotation, ShutdownSignal,
    TradingAvailability,
};
use fleet_engine::{FleetConfig, NoopHistory, TraderManager, TraderSpec};
use fleet_strategy::{
    register_builtin_strategies, register_strategy_factory, Strategy, StrategyAction,
    StrategyDeps, StrategyFactory, StrategyResult,
};

#[derive(Default)]
struct MockBroker {
    last_price_recipients: Mutex<HashSet<(String, Uuid)>>,
    order_state_recipients: Mutex<HashSet<(String, String, Uuid)>>,
    orders_placed: Mutex<Vec<String>>,
}

impl MockBroker {
    fn instrument(uid: &str) -> Instrument {
        Instrument {
            id: 1,
            uid: uid.to_string(),
            isin: "ISIN".into(),
            figi: "FIGI".into(),
            ticker: format!("T-{uid}"),
            class_code: "TQBR".into(),
            name: "Mock".into(),
            lot: 1,
            available_api: true,
            for_quals: false,
            first_candle_date: Utc::now(),
            instance_id: Uuid::new_v4(),
        }
    }

    fn last_price_recipient_count(&self) -> usize {
        self.last_price_recipients.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument> {
        Ok(Self::instrument(identifier))
    }

    async fn trading_availability(
        &self,
        _instrument: &Instrument,
    ) -> BrokerResult<TradingAvailability> {
        Ok(TradingAvailability::Available)
    }

    async fn register_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()> {
        self.last_price_recipients
            .lock()
            .unwrap()
            .insert((instrument.uid.clone(), instrument.instance_id));
        Ok(())
    }

    async fn unregister_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()> {
        self.last_price_recipients
            .lock()
            .unwrap()
            .remove(&(instrument.uid.clone(), instrument.instance_id));
        Ok(())
    }

    async fn register_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()> {
        self.order_state_recipients.lock().unwrap().insert((
            account_id.to_string(),
            instrument.uid.clone(),
            instrument.instance_id,
        ));
        Ok(())
    }

    async fn unregister_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()> {
        self.order_state_recipients.lock().unwrap().remove(&(
            account_id.to_string(),
            instrument.uid.clone(),
            instrument.instance_id,
        ));
        Ok(())
    }

    async fn receive_last_price(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
    ) -> BrokerResult<LastPrice> {
        if !shutdown.sleep(Duration::from_millis(2)).await {
            return Err(BrokerError::Cancelled(format!(
                "receiving last price for {}",
                instrument.ticker
            )));
        }
        Ok(LastPrice {
            uid: instrument.uid.clone(),
            figi: instrument.figi.clone(),
            price: Quotation::from_units(100),
            time: Utc::now(),
        })
    }

    async fn receive_orders_update(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
        _account_id: &str,
    ) -> BrokerResult<OrderUpdate> {
        shutdown.wait().await;
        Err(BrokerError::Cancelled(format!(
            "receiving orders update for {}",
            instrument.ticker
        )))
    }

    async fn make_buy_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        _account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        self.orders_placed.lock().unwrap().push(request_id.to_string());
        Ok(PostOrderResult {
            order_id: request_id.to_string(),
            instrument_uid: instrument.uid.clone(),
            executed_price: Quotation::from_units(100),
            executed_commission: Quotation::ZERO,
            lots_executed: lots,
            status: "FILL".into(),
        })
    }

    async fn make_sell_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        self.make_buy_order(instrument, lots, request_id, account_id).await
    }
}

/// Counts decisions; optionally panics on one specific call.
struct ProbeStrategy {
    name: &'static str,
    decisions: Arc<AtomicUsize>,
    panic_on: Option<usize>,
}

impl Strategy for ProbeStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn decide(
        &self,
        _trader_id: &str,
        _instrument: &Instrument,
        _last_price: &LastPrice,
    ) -> StrategyResult<Vec<StrategyAction>> {
        let call = self.decisions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on == Some(call) {
            panic!("probe strategy exploded on call {call}");
        }
        Ok(vec![StrategyAction::hold()])
    }

    fn update_config(&self, _params: &serde_json::Value) -> StrategyResult<()> {
        Ok(())
    }
}

struct ProbeFactory {
    name: &'static str,
    decisions: Arc<AtomicUsize>,
    panic_on: Option<usize>,
}

impl StrategyFactory for ProbeFactory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn build(
        &self,
        _params: &serde_json::Value,
        _deps: &StrategyDeps,
    ) -> StrategyResult<Arc<dyn Strategy>> {
        Ok(Arc::new(ProbeStrategy {
            name: self.name,
            decisions: self.decisions.clone(),
            panic_on: self.panic_on,
        }))
    }
}

fn manager_with(broker: Arc<MockBroker>, wait_on_panic: Duration) -> (TraderManager, ShutdownSignal) {
    let shutdown = ShutdownSignal::detached();
    let manager = TraderManager::new(
        shutdown.clone(),
        wait_on_panic,
        broker,
        Arc::new(BacktestStorage::new(Vec::new())),
        Arc::new(NoopHistory),
    );
    (manager, shutdown)
}

fn btdstf_spec(trader_id: &str, max_depth: i64) -> TraderSpec {
    TraderSpec {
        trader_id: trader_id.to_string(),
        uid: format!("uid-{trader_id}"),
        account_id: "acc-1".into(),
        strategy_cfg: serde_json::json!({
            "name": "btdstf",
            "max_depth": max_depth,
            "lots_to_buy": 1,
            "pct_down_to_buy": 0.01,
            "pct_up_to_sell": 0.02,
        }),
    }
}

fn fleet(traders: Vec<TraderSpec>) -> FleetConfig {
    FleetConfig {
        tick_delay: Duration::from_millis(0),
        on_trading_error_delay: Duration::from_millis(5),
        on_orders_error_delay: Duration::from_millis(5),
        traders,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_config_leaves_the_fleet_untouched() {
    register_builtin_strategies();
    let broker = Arc::new(MockBroker::default());
    let (manager, shutdown) = manager_with(broker.clone(), Duration::from_millis(10));

    manager.update_traders_with_config(&fleet(Vec::new())).await;
    assert_eq!(manager.trader_count(), 0);
    assert_eq!(broker.last_price_recipient_count(), 0);
    shutdown.trigger();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_modify_remove_reconciles_in_place() {
    register_builtin_strategies();
    let broker = Arc::new(MockBroker::default());
    let (manager, shutdown) = manager_with(broker.clone(), Duration::from_millis(10));

    // Config A: t1 appears.
    manager
        .update_traders_with_config(&fleet(vec![btdstf_spec("t1", 5)]))
        .await;
    assert_eq!(manager.trader_count(), 1);
    let trader_a = manager.find_trader("t1").expect("t1 running");
    let strategy_a = trader_a.strategy();
    assert_eq!(broker.last_price_recipient_count(), 1);

    // Config B: same trader, new strategy parameters. The trader and the
    // strategy instances survive; only the configuration changes.
    manager
        .update_traders_with_config(&fleet(vec![btdstf_spec("t1", 10)]))
        .await;
    let trader_b = manager.find_trader("t1").expect("t1 still running");
    assert!(Arc::ptr_eq(&trader_a, &trader_b));
    assert!(Arc::ptr_eq(&strategy_a, &trader_b.strategy()));
    assert_eq!(broker.last_price_recipient_count(), 1, "no duplicate subscription");

    // Config C: t1 is gone, t2 appears.
    manager
        .update_traders_with_config(&fleet(vec![btdstf_spec("t2", 3)]))
        .await;
    assert!(manager.find_trader("t1").is_none());
    assert!(manager.find_trader("t2").is_some());
    assert_eq!(manager.trader_count(), 1);
    assert_eq!(broker.last_price_recipient_count(), 1);

    shutdown.trigger();
    manager.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_panicking_trader_never_disturbs_its_siblings() {
    register_builtin_strategies();
    let healthy_decisions = Arc::new(AtomicUsize::new(0));
    let crashing_decisions = Arc::new(AtomicUsize::new(0));
    register_strategy_factory(Arc::new(ProbeFactory {
        name: "probe-healthy",
        decisions: healthy_decisions.clone(),
        panic_on: None,
    }));
    register_strategy_factory(Arc::new(ProbeFactory {
        name: "probe-crashing",
        decisions: crashing_decisions.clone(),
        panic_on: Some(2),
    }));

    let broker = Arc::new(MockBroker::default());
    let (manager, shutdown) = manager_with(broker.clone(), Duration::from_millis(40));

    let spec = |trader_id: &str, strategy: &str| TraderSpec {
        trader_id: trader_id.to_string(),
        uid: format!("uid-{trader_id}"),
        account_id: "acc-1".into(),
        strategy_cfg: serde_json::json!({ "name": strategy }),
    };
    manager
        .update_traders_with_config(&fleet(vec![
            spec("t-ok", "probe-healthy"),
            spec("t-crash", "probe-crashing"),
        ]))
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let healthy = healthy_decisions.load(Ordering::SeqCst);
    let crashing = crashing_decisions.load(Ordering::SeqCst);
    assert!(healthy >= 20, "sibling kept ticking, saw {healthy} decisions");
    assert!(
        crashing >= 3,
        "crashed trader re-entered its loop after the cooldown, saw {crashing}"
    );
    assert_eq!(manager.trader_count(), 2);

    shutdown.trigger();
    manager.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_reloads_converge_to_the_last_config() {
    register_builtin_strategies();
    let broker = Arc::new(MockBroker::default());
    let (manager, shutdown) = manager_with(broker.clone(), Duration::from_millis(10));

    let reloads = [
        vec![btdstf_spec("a", 2), btdstf_spec("b", 2)],
        vec![btdstf_spec("b", 4), btdstf_spec("c", 2), btdstf_spec("d", 2)],
        vec![btdstf_spec("d", 6)],
    ];
    for traders in reloads {
        let expected: HashSet<String> =
            traders.iter().map(|spec| spec.trader_id.clone()).collect();
        manager.update_traders_with_config(&fleet(traders)).await;

        assert_eq!(manager.trader_count(), expected.len());
        for trader_id in &expected {
            assert!(manager.find_trader(trader_id).is_some());
        }
        // One live subscription per running trader, none leaked.
        assert_eq!(broker.last_price_recipient_count(), expected.len());
    }

    shutdown.trigger();
    manager.wait().await;
}
