//! Fan-out of the two upstream streams to per-instance subscribers.
//!
//! At most one last-price stream and one order-state stream exist per
//! process; both are opened lazily on first registration. Each subscriber is
//! identified by the instrument's `instance_id` and owns a bounded channel.
//! Routing never blocks on a slow subscriber: delivery drops on a full
//! channel, and per-subscriber FIFO follows upstream order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::transport::{MarketDataTransport, PostOrderRequest, UpstreamStream};
use crate::{Broker, BrokerError, BrokerResult};
use fleet_core::{
    Direction, Instrument, LastPrice, OrderUpdate, PostOrderResult, ShutdownSignal,
    TradingAvailability,
};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;
const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(10);

/// One subscriber endpoint: the routing side sends, the receive side blocks
/// on the receiver without holding the fan-out table lock.
///
/// The sender becomes `None` when the upstream stream closes; the entry
/// itself stays registered until the subscriber unregisters, so buffered
/// messages remain receivable and a later receive reports a closed stream
/// rather than a missing registration.
struct Slot<T> {
    tx: Option<mpsc::Sender<T>>,
    rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Self {
            tx: Some(tx),
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    fn try_send(&self, message: T) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }
}

type LastPriceTable = HashMap<String, HashMap<Uuid, Slot<LastPrice>>>;
type OrderStateTable = HashMap<String, HashMap<String, HashMap<Uuid, Slot<OrderUpdate>>>>;

/// Live broker adapter multiplexing the upstream connection to arbitrarily
/// many trader subscriptions.
pub struct LiveBroker {
    transport: Arc<dyn MarketDataTransport>,
    shutdown: ShutdownSignal,
    last_price_stream: AsyncMutex<Option<Arc<dyn UpstreamStream>>>,
    order_state_stream: AsyncMutex<Option<Arc<dyn UpstreamStream>>>,
    last_prices: Arc<RwLock<LastPriceTable>>,
    order_states: Arc<RwLock<OrderStateTable>>,
}

impl LiveBroker {
    pub fn new(transport: Arc<dyn MarketDataTransport>, shutdown: ShutdownSignal) -> Self {
        Self {
            transport,
            shutdown,
            last_price_stream: AsyncMutex::new(None),
            order_state_stream: AsyncMutex::new(None),
            last_prices: Arc::new(RwLock::new(HashMap::new())),
            order_states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn ensure_last_price_stream(&self, uid: &str) -> BrokerResult<()> {
        let mut guard = self.last_price_stream.lock().await;
        match guard.as_ref() {
            Some(stream) => stream.subscribe(&[uid.to_string()]).await,
            None => {
                let (stream, upstream_rx) = self.transport.open_last_price_stream().await?;
                stream.subscribe(&[uid.to_string()]).await?;
                tokio::spawn(route_last_prices(
                    upstream_rx,
                    self.last_prices.clone(),
                    self.shutdown.clone(),
                ));
                tokio::spawn(run_listener(
                    "last-price",
                    stream.clone(),
                    self.shutdown.clone(),
                ));
                *guard = Some(stream);
                Ok(())
            }
        }
    }

    async fn ensure_order_state_stream(&self, uid: &str) -> BrokerResult<()> {
        let mut guard = self.order_state_stream.lock().await;
        match guard.as_ref() {
            Some(stream) => stream.subscribe(&[uid.to_string()]).await,
            None => {
                let (stream, upstream_rx) = self.transport.open_order_state_stream().await?;
                stream.subscribe(&[uid.to_string()]).await?;
                tokio::spawn(route_order_updates(
                    upstream_rx,
                    self.order_states.clone(),
                    self.shutdown.clone(),
                ));
                tokio::spawn(run_listener(
                    "order-state",
                    stream.clone(),
                    self.shutdown.clone(),
                ));
                *guard = Some(stream);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn last_price_subscribers(&self, uid: &str) -> usize {
        self.last_prices
            .read()
            .unwrap()
            .get(uid)
            .map_or(0, HashMap::len)
    }

    #[cfg(test)]
    fn last_price_table_is_empty(&self) -> bool {
        self.last_prices.read().unwrap().is_empty()
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument> {
        self.transport.find_instrument(identifier).await
    }

    async fn trading_availability(
        &self,
        instrument: &Instrument,
    ) -> BrokerResult<TradingAvailability> {
        self.transport.trading_status(&instrument.uid).await
    }

    async fn register_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()> {
        self.ensure_last_price_stream(&instrument.uid).await?;

        let mut table = self.last_prices.write().unwrap();
        table
            .entry(instrument.uid.clone())
            .or_default()
            .entry(instrument.instance_id)
            .or_insert_with(Slot::new);
        Ok(())
    }

    async fn unregister_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()> {
        let last_for_uid = {
            let mut table = self.last_prices.write().unwrap();
            match table.get_mut(&instrument.uid) {
                Some(per_uid) => {
                    per_uid.remove(&instrument.instance_id);
                    if per_uid.is_empty() {
                        table.remove(&instrument.uid);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last_for_uid {
            if let Some(stream) = self.last_price_stream.lock().await.as_ref() {
                stream.unsubscribe(&[instrument.uid.clone()]).await?;
            }
        }
        Ok(())
    }

    async fn register_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()> {
        self.ensure_order_state_stream(&instrument.uid).await?;

        let mut table = self.order_states.write().unwrap();
        table
            .entry(account_id.to_string())
            .or_default()
            .entry(instrument.uid.clone())
            .or_default()
            .entry(instrument.instance_id)
            .or_insert_with(Slot::new);
        Ok(())
    }

    async fn unregister_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()> {
        let last_for_uid = {
            let mut table = self.order_states.write().unwrap();
            let mut last = false;
            if let Some(per_account) = table.get_mut(account_id) {
                if let Some(per_uid) = per_account.get_mut(&instrument.uid) {
                    per_uid.remove(&instrument.instance_id);
                    if per_uid.is_empty() {
                        per_account.remove(&instrument.uid);
                        last = true;
                    }
                }
                if per_account.is_empty() {
                    table.remove(account_id);
                }
            }
            last
        };

        if last_for_uid {
            if let Some(stream) = self.order_state_stream.lock().await.as_ref() {
                stream.unsubscribe(&[instrument.uid.clone()]).await?;
            }
        }
        Ok(())
    }

    async fn receive_last_price(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
    ) -> BrokerResult<LastPrice> {
        let receiver = {
            let table = self.last_prices.read().unwrap();
            table
                .get(&instrument.uid)
                .and_then(|per_uid| per_uid.get(&instrument.instance_id))
                .map(|slot| slot.rx.clone())
        }
        .ok_or_else(|| {
            BrokerError::NotRegistered(format!("last price for {}", instrument.ticker))
        })?;

        let mut rx = receiver.lock().await;
        tokio::select! {
            _ = shutdown.wait() => Err(BrokerError::Cancelled(format!(
                "receiving last price for {}", instrument.ticker
            ))),
            message = rx.recv() => message.ok_or_else(|| BrokerError::StreamClosed(format!(
                "last price stream for {}", instrument.ticker
            ))),
        }
    }

    async fn receive_orders_update(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<OrderUpdate> {
        let receiver = {
            let table = self.order_states.read().unwrap();
            table
                .get(account_id)
                .and_then(|per_account| per_account.get(&instrument.uid))
                .and_then(|per_uid| per_uid.get(&instrument.instance_id))
                .map(|slot| slot.rx.clone())
        }
        .ok_or_else(|| {
            BrokerError::NotRegistered(format!("order state for {}", instrument.ticker))
        })?;

        let mut rx = receiver.lock().await;
        tokio::select! {
            _ = shutdown.wait() => Err(BrokerError::Cancelled(format!(
                "receiving orders update for {}", instrument.ticker
            ))),
            message = rx.recv() => message.ok_or_else(|| BrokerError::StreamClosed(format!(
                "order state stream for {}", instrument.ticker
            ))),
        }
    }

    async fn make_buy_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        if lots < 1 {
            return Err(BrokerError::InvalidRequest(format!(
                "incorrect lots to make order: {lots}"
            )));
        }
        self.transport
            .post_order(PostOrderRequest {
                instrument_uid: instrument.uid.clone(),
                lots,
                direction: Direction::Buy,
                account_id: account_id.to_string(),
                request_id: request_id.to_string(),
            })
            .await
    }

    async fn make_sell_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        if lots < 1 {
            return Err(BrokerError::InvalidRequest(format!(
                "incorrect lots to make order: {lots}"
            )));
        }
        self.transport
            .post_order(PostOrderRequest {
                instrument_uid: instrument.uid.clone(),
                lots,
                direction: Direction::Sell,
                account_id: account_id.to_string(),
                request_id: request_id.to_string(),
            })
            .await
    }
}

async fn route_last_prices(
    mut upstream: mpsc::Receiver<LastPrice>,
    table: Arc<RwLock<LastPriceTable>>,
    shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            message = upstream.recv() => match message {
                None => {
                    // Upstream closed: dropping the senders closes every
                    // subscriber channel.
                    let mut table = table.write().unwrap();
                    for subscribers in table.values_mut() {
                        for slot in subscribers.values_mut() {
                            slot.tx = None;
                        }
                    }
                    info!("last price stream closed; subscribers drained");
                    return;
                }
                Some(price) => {
                    let table = table.read().unwrap();
                    if let Some(subscribers) = table.get(&price.uid) {
                        for slot in subscribers.values() {
                            if !slot.try_send(price.clone()) {
                                trace!(uid = %price.uid, "subscriber channel full; last price dropped");
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn route_order_updates(
    mut upstream: mpsc::Receiver<OrderUpdate>,
    table: Arc<RwLock<OrderStateTable>>,
    shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            message = upstream.recv() => match message {
                None => {
                    let mut table = table.write().unwrap();
                    for per_account in table.values_mut() {
                        for per_uid in per_account.values_mut() {
                            for slot in per_uid.values_mut() {
                                slot.tx = None;
                            }
                        }
                    }
                    info!("order state stream closed; subscribers drained");
                    return;
                }
                Some(update) => {
                    let table = table.read().unwrap();
                    let subscribers = table
                        .get(&update.account_id)
                        .and_then(|per_account| per_account.get(&update.instrument_uid));
                    if let Some(subscribers) = subscribers {
                        for slot in subscribers.values() {
                            if !slot.try_send(update.clone()) {
                                debug!(
                                    uid = %update.instrument_uid,
                                    "subscriber channel full; order update dropped"
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn run_listener(label: &'static str, stream: Arc<dyn UpstreamStream>, shutdown: ShutdownSignal) {
    loop {
        if shutdown.triggered() {
            stream.stop();
            return;
        }
        let outcome = tokio::select! {
            _ = shutdown.wait() => {
                stream.stop();
                return;
            }
            result = stream.listen() => result,
        };
        if let Err(err) = outcome {
            error!(stream = label, error = %err, "upstream listen failed");
            if !shutdown.sleep(LISTEN_RETRY_DELAY).await {
                stream.stop();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::{CandleInterval, Quotation};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeStream {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
        stopped: AtomicBool,
        halt: tokio::sync::Notify,
    }

    impl FakeStream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscribed: Mutex::new(Vec::new()),
                unsubscribed: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                halt: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait]
    impl UpstreamStream for FakeStream {
        async fn subscribe(&self, uids: &[String]) -> BrokerResult<()> {
            self.subscribed.lock().unwrap().extend_from_slice(uids);
            Ok(())
        }

        async fn unsubscribe(&self, uids: &[String]) -> BrokerResult<()> {
            self.unsubscribed.lock().unwrap().extend_from_slice(uids);
            Ok(())
        }

        async fn listen(&self) -> BrokerResult<()> {
            self.halt.notified().await;
            Ok(())
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.halt.notify_waiters();
        }
    }

    struct FakeTransport {
        last_price_stream: Arc<FakeStream>,
        order_state_stream: Arc<FakeStream>,
        last_price_tx: Mutex<Option<mpsc::Sender<LastPrice>>>,
        order_state_tx: Mutex<Option<mpsc::Sender<OrderUpdate>>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                last_price_stream: FakeStream::new(),
                order_state_stream: FakeStream::new(),
                last_price_tx: Mutex::new(None),
                order_state_tx: Mutex::new(None),
            })
        }

        fn price_sender(&self) -> mpsc::Sender<LastPrice> {
            self.last_price_tx.lock().unwrap().clone().expect("stream not open")
        }
    }

    #[async_trait]
    impl MarketDataTransport for FakeTransport {
        async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument> {
            Ok(test_instrument(identifier))
        }

        async fn trading_status(&self, _uid: &str) -> BrokerResult<TradingAvailability> {
            Ok(TradingAvailability::Available)
        }

        async fn historic_candles(
            &self,
            _uid: &str,
            _interval: CandleInterval,
            _from: chrono::DateTime<Utc>,
            _to: chrono::DateTime<Utc>,
        ) -> BrokerResult<Vec<fleet_core::Candle>> {
            Ok(Vec::new())
        }

        async fn post_order(&self, request: PostOrderRequest) -> BrokerResult<PostOrderResult> {
            Ok(PostOrderResult {
                order_id: request.request_id,
                instrument_uid: request.instrument_uid,
                executed_price: Quotation::from_units(100),
                executed_commission: Quotation::ZERO,
                lots_executed: request.lots,
                status: "FILL".into(),
            })
        }

        async fn open_last_price_stream(
            &self,
        ) -> BrokerResult<(Arc<dyn UpstreamStream>, mpsc::Receiver<LastPrice>)> {
            let (tx, rx) = mpsc::channel(1024);
            *self.last_price_tx.lock().unwrap() = Some(tx);
            Ok((self.last_price_stream.clone(), rx))
        }

        async fn open_order_state_stream(
            &self,
        ) -> BrokerResult<(Arc<dyn UpstreamStream>, mpsc::Receiver<OrderUpdate>)> {
            let (tx, rx) = mpsc::channel(1024);
            *self.order_state_tx.lock().unwrap() = Some(tx);
            Ok((self.order_state_stream.clone(), rx))
        }
    }

    fn test_instrument(uid: &str) -> Instrument {
        Instrument {
            id: 1,
            uid: uid.to_string(),
            isin: "ISIN".into(),
            figi: "FIGI".into(),
            ticker: format!("T-{uid}"),
            class_code: "SPB".into(),
            name: "Test instrument".into(),
            lot: 1,
            available_api: true,
            for_quals: false,
            first_candle_date: Utc::now(),
            instance_id: Uuid::new_v4(),
        }
    }

    fn price(uid: &str, seq: i64) -> LastPrice {
        LastPrice {
            uid: uid.to_string(),
            figi: "FIGI".into(),
            price: Quotation::from_units(seq),
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_per_instance() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport.clone(), ShutdownSignal::detached());
        let instrument = test_instrument("uid-1");

        broker.register_last_price_recipient(&instrument).await.unwrap();
        broker.register_last_price_recipient(&instrument).await.unwrap();
        assert_eq!(broker.last_price_subscribers("uid-1"), 1);

        let other = instrument.with_new_instance();
        broker.register_last_price_recipient(&other).await.unwrap();
        assert_eq!(broker.last_price_subscribers("uid-1"), 2);
    }

    #[tokio::test]
    async fn unregister_of_last_subscriber_unsubscribes_upstream() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport.clone(), ShutdownSignal::detached());
        let a = test_instrument("uid-1");
        let b = a.with_new_instance();

        broker.register_last_price_recipient(&a).await.unwrap();
        broker.register_last_price_recipient(&b).await.unwrap();

        broker.unregister_last_price_recipient(&a).await.unwrap();
        assert!(transport.last_price_stream.unsubscribed.lock().unwrap().is_empty());

        broker.unregister_last_price_recipient(&b).await.unwrap();
        assert_eq!(
            *transport.last_price_stream.unsubscribed.lock().unwrap(),
            vec!["uid-1".to_string()]
        );
        assert!(broker.last_price_table_is_empty());
    }

    #[tokio::test]
    async fn receive_without_registration_fails() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport, ShutdownSignal::detached());
        let shutdown = ShutdownSignal::detached();
        let err = broker
            .receive_last_price(&shutdown, &test_instrument("uid-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_while_fast_subscriber_sees_everything() {
        let transport = FakeTransport::new();
        let broker = Arc::new(LiveBroker::new(transport.clone(), ShutdownSignal::detached()));
        let fast = test_instrument("uid-1");
        let slow = fast.with_new_instance();

        broker.register_last_price_recipient(&fast).await.unwrap();
        broker.register_last_price_recipient(&slow).await.unwrap();

        const TOTAL: i64 = 10_000;
        let reader_broker = broker.clone();
        let reader_instrument = fast.clone();
        let reader = tokio::spawn(async move {
            let shutdown = ShutdownSignal::detached();
            let mut received = Vec::with_capacity(TOTAL as usize);
            while received.len() < TOTAL as usize {
                let update = reader_broker
                    .receive_last_price(&shutdown, &reader_instrument)
                    .await
                    .unwrap();
                received.push(update.price.units);
            }
            received
        });

        let sender = transport.price_sender();
        for seq in 0..TOTAL {
            sender.send(price("uid-1", seq)).await.unwrap();
        }

        let received = reader.await.unwrap();
        assert_eq!(received, (0..TOTAL).collect::<Vec<_>>(), "fast subscriber is FIFO");

        // The slow subscriber never read: its channel filled and the rest
        // was dropped without stalling routing.
        let shutdown = ShutdownSignal::detached();
        let mut slow_count = 0usize;
        while slow_count <= SUBSCRIBER_CHANNEL_CAPACITY {
            let received = tokio::time::timeout(
                Duration::from_millis(50),
                broker.receive_last_price(&shutdown, &slow),
            )
            .await;
            match received {
                Ok(Ok(_)) => slow_count += 1,
                _ => break,
            }
        }
        assert!(slow_count <= SUBSCRIBER_CHANNEL_CAPACITY);
        assert!(slow_count > 0);
    }

    #[tokio::test]
    async fn upstream_close_drains_subscribers() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport.clone(), ShutdownSignal::detached());
        let instrument = test_instrument("uid-1");
        broker.register_last_price_recipient(&instrument).await.unwrap();

        let sender = transport.price_sender();
        sender.send(price("uid-1", 1)).await.unwrap();
        drop(sender);
        *transport.last_price_tx.lock().unwrap() = None;

        let shutdown = ShutdownSignal::detached();
        let first = broker.receive_last_price(&shutdown, &instrument).await.unwrap();
        assert_eq!(first.price.units, 1);

        let err = broker
            .receive_last_price(&shutdown, &instrument)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::StreamClosed(_)));
    }

    #[tokio::test]
    async fn order_updates_route_by_account_and_uid() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport.clone(), ShutdownSignal::detached());
        let instrument = test_instrument("uid-1");
        broker
            .register_order_state_recipient(&instrument, "acc-1")
            .await
            .unwrap();

        let sender = transport.order_state_tx.lock().unwrap().clone().unwrap();
        let update = OrderUpdate {
            account_id: "acc-1".into(),
            instrument_uid: "uid-1".into(),
            order_id: "req-1".into(),
            created_at: Some(Utc::now()),
            completion_time: None,
            direction: Direction::Buy,
            status: fleet_core::OrderStatus::Fill,
            price: Quotation::from_units(50),
            lots_requested: 2,
            lots_executed: 2,
        };
        sender.send(update.clone()).await.unwrap();
        // An update for another account must not reach this subscriber.
        let mut foreign = update.clone();
        foreign.account_id = "acc-2".into();
        foreign.order_id = "req-2".into();
        sender.send(foreign).await.unwrap();
        sender.send(OrderUpdate { order_id: "req-3".into(), ..update.clone() }).await.unwrap();

        let shutdown = ShutdownSignal::detached();
        let first = broker
            .receive_orders_update(&shutdown, &instrument, "acc-1")
            .await
            .unwrap();
        assert_eq!(first.order_id, "req-1");
        let second = broker
            .receive_orders_update(&shutdown, &instrument, "acc-1")
            .await
            .unwrap();
        assert_eq!(second.order_id, "req-3");
    }

    #[tokio::test]
    async fn shutdown_cancels_blocked_receive() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport, ShutdownSignal::detached());
        let instrument = test_instrument("uid-1");
        broker.register_last_price_recipient(&instrument).await.unwrap();

        let shutdown = ShutdownSignal::detached();
        let waiter = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waiter.trigger();
        });
        let err = broker
            .receive_last_price(&shutdown, &instrument)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled(_)));
    }

    #[tokio::test]
    async fn random_register_unregister_leaves_no_leaks() {
        let transport = FakeTransport::new();
        let broker = LiveBroker::new(transport.clone(), ShutdownSignal::detached());
        let mut rng = StdRng::seed_from_u64(7);

        let uids = ["uid-1", "uid-2", "uid-3"];
        let mut registered: Vec<Instrument> = Vec::new();
        for _ in 0..500 {
            let register = registered.is_empty() || rng.gen_bool(0.5);
            if register {
                let uid = uids[rng.gen_range(0..uids.len())];
                let instrument = test_instrument(uid);
                broker.register_last_price_recipient(&instrument).await.unwrap();
                registered.push(instrument);
            } else {
                let idx = rng.gen_range(0..registered.len());
                let instrument = registered.swap_remove(idx);
                broker.unregister_last_price_recipient(&instrument).await.unwrap();
            }

            // Every registered pair is present exactly once, nothing else is.
            for uid in uids {
                let expected = registered.iter().filter(|i| i.uid == uid).count();
                assert_eq!(broker.last_price_subscribers(uid), expected);
            }
        }

        for instrument in registered.drain(..) {
            broker.unregister_last_price_recipient(&instrument).await.unwrap();
        }
        assert!(broker.last_price_table_is_empty());
    }
}
