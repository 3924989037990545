use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use error_stack::{Report, ResultExt};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    adapter::{BlockPayload, ChainAdapter, HistoricalSource, Settings},
    error::{Result, WatcherError},
};

/// Blocks per historical index query.
const HISTORICAL_CHUNK: u64 = 256;

pub type SubscriptionId = u64;

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Capacity of each subscriber's outbound channel.
    pub subscriber_capacity: usize,
    /// How long a full outbound channel may block delivery before the
    /// subscriber is evicted.
    pub slow_consumer_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            subscriber_capacity: 128,
            slow_consumer_timeout: Duration::from_secs(15),
        }
    }
}

enum HubCommand<A: ChainAdapter> {
    Subscribe {
        settings: A::Settings,
        reply: oneshot::Sender<Result<(SubscriptionId, mpsc::Receiver<A::Response>)>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    HistoricalDone {
        id: SubscriptionId,
        up_to: u64,
        outcome: Result<()>,
    },
}

/// Client half of the hub actor. Cheap to clone; the server loop owns all
/// subscriber state.
pub struct HubHandle<A: ChainAdapter> {
    cmd_tx: mpsc::Sender<HubCommand<A>>,
}

impl<A: ChainAdapter> Clone for HubHandle<A> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<A: ChainAdapter> HubHandle<A> {
    /// Registers a subscriber and returns its outbound channel. Responses
    /// arrive in strictly increasing block-height order; the channel closes
    /// when the range completes, the hub shuts down, or the subscriber is
    /// evicted as a slow consumer.
    pub async fn subscribe(
        &self,
        settings: A::Settings,
    ) -> Result<(SubscriptionId, mpsc::Receiver<A::Response>)> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCommand::Subscribe { settings, reply })
            .await
            .map_err(|_| Report::new(WatcherError::Fatal))
            .attach_printable("subscription hub is not running")?;
        reply_rx
            .await
            .map_err(|_| Report::new(WatcherError::Fatal))
            .attach_printable("subscription hub dropped the reply")?
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.cmd_tx.send(HubCommand::Unsubscribe { id }).await;
    }
}

/// Tracks which block heights have been dispatched on the forward channel.
///
/// The watermark is the height below or at which every height since the
/// first observed one has been dispatched. Buffered responses at or below
/// it are safe to deliver in order: nothing smaller can still arrive.
#[derive(Debug, Default)]
struct OrderTracker {
    watermark: Option<u64>,
    ahead: BTreeSet<u64>,
}

impl OrderTracker {
    fn observe(&mut self, height: u64) {
        match self.watermark {
            None => self.watermark = Some(height),
            Some(w) if height <= w => {}
            Some(w) if height == w + 1 => {
                let mut w = height;
                while self.ahead.remove(&(w + 1)) {
                    w += 1;
                }
                self.watermark = Some(w);
            }
            Some(_) => {
                self.ahead.insert(height);
            }
        }
    }

    fn watermark(&self) -> Option<u64> {
        self.watermark
    }
}

struct SubscriberState<A: ChainAdapter> {
    settings: A::Settings,
    tx: mpsc::Sender<A::Response>,
    /// Responses waiting for the watermark, keyed by block number.
    pending: BTreeMap<u64, A::Response>,
    last_delivered: Option<u64>,
    /// False while a historical task owns delivery for this subscriber.
    live: bool,
}

/// Registry of active subscribers and the fan-out point of the pipeline.
///
/// Runs as a single task owning the subscriber map; registration,
/// deregistration, and dispatch all arrive as messages, so no lock is held
/// across I/O.
pub struct SubscriptionHub<A, H>
where
    A: ChainAdapter,
    H: HistoricalSource<A>,
{
    adapter: Arc<A>,
    historical: Arc<H>,
    options: HubOptions,
}

impl<A, H> SubscriptionHub<A, H>
where
    A: ChainAdapter,
    H: HistoricalSource<A>,
{
    pub fn new(adapter: Arc<A>, historical: Arc<H>, options: HubOptions) -> Self {
        Self {
            adapter,
            historical,
            options,
        }
    }

    pub fn start(
        self,
        forward_rx: mpsc::Receiver<A::Converted>,
        ct: CancellationToken,
    ) -> (HubHandle<A>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handle = HubHandle {
            cmd_tx: cmd_tx.clone(),
        };
        let server = HubServer {
            adapter: self.adapter,
            historical: self.historical,
            options: self.options,
            subscribers: HashMap::new(),
            order: OrderTracker::default(),
            next_id: 0,
            cmd_tx,
        };
        let task = tokio::spawn(server.run(cmd_rx, forward_rx, ct));
        (handle, task)
    }
}

struct HubServer<A, H>
where
    A: ChainAdapter,
    H: HistoricalSource<A>,
{
    adapter: Arc<A>,
    historical: Arc<H>,
    options: HubOptions,
    subscribers: HashMap<SubscriptionId, SubscriberState<A>>,
    order: OrderTracker,
    next_id: SubscriptionId,
    cmd_tx: mpsc::Sender<HubCommand<A>>,
}

impl<A, H> HubServer<A, H>
where
    A: ChainAdapter,
    H: HistoricalSource<A>,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<HubCommand<A>>,
        mut forward_rx: mpsc::Receiver<A::Converted>,
        ct: CancellationToken,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                payload = forward_rx.recv() => match payload {
                    Some(payload) => self.dispatch(payload).await,
                    None => break,
                },
                _ = ct.cancelled() => break,
            }
        }
        info!(
            subscribers = self.subscribers.len(),
            "subscription hub shutting down"
        );
        // Dropping the map closes every subscriber channel.
    }

    async fn handle_command(&mut self, cmd: HubCommand<A>) {
        match cmd {
            HubCommand::Subscribe { settings, reply } => {
                let result = self.add_subscriber(settings).await;
                let _ = reply.send(result);
            }
            HubCommand::Unsubscribe { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(id, "subscriber left");
                }
            }
            HubCommand::HistoricalDone { id, up_to, outcome } => {
                self.finish_historical(id, up_to, outcome).await;
            }
        }
    }

    async fn add_subscriber(
        &mut self,
        settings: A::Settings,
    ) -> Result<(SubscriptionId, mpsc::Receiver<A::Response>)> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.options.subscriber_capacity);
        let range = settings.range();
        let start = range.start.max(0) as u64;

        let indexed_head = self.historical.head().await.unwrap_or_else(|err| {
            warn!(err = ?err, "failed to read indexed head, serving live only");
            None
        });
        let historical_end = indexed_head
            .filter(|head| start <= *head)
            .map(|head| {
                if range.is_open_ended() {
                    head
                } else {
                    head.min(range.end as u64)
                }
            });

        let live = match historical_end {
            Some(end) => {
                self.spawn_historical(id, settings.clone(), start, end, tx.clone());
                false
            }
            None => true,
        };

        self.subscribers.insert(
            id,
            SubscriberState {
                settings,
                tx,
                pending: BTreeMap::new(),
                last_delivered: None,
                live,
            },
        );
        info!(id, start, historical_end = ?historical_end, "subscriber joined");
        Ok((id, rx))
    }

    /// Streams `[start, end]` from the index onto the subscriber's channel,
    /// then hands delivery back to the live dispatcher.
    fn spawn_historical(
        &self,
        id: SubscriptionId,
        settings: A::Settings,
        start: u64,
        end: u64,
        tx: mpsc::Sender<A::Response>,
    ) {
        let historical = self.historical.clone();
        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.options.slow_consumer_timeout;
        tokio::spawn(async move {
            let outcome =
                deliver_historical::<A, H>(historical, &settings, start, end, tx, timeout).await;
            let _ = cmd_tx
                .send(HubCommand::HistoricalDone {
                    id,
                    up_to: end,
                    outcome,
                })
                .await;
        });
    }

    async fn finish_historical(&mut self, id: SubscriptionId, up_to: u64, outcome: Result<()>) {
        if let Err(err) = outcome {
            warn!(id, err = ?err, "historical delivery failed, dropping subscriber");
            self.subscribers.remove(&id);
            return;
        }
        let Some(sub) = self.subscribers.get_mut(&id) else {
            return;
        };
        // Everything at or below the historical end has been covered; live
        // duplicates of those heights are dropped.
        sub.last_delivered = Some(up_to);
        sub.pending = sub.pending.split_off(&(up_to + 1));
        sub.live = true;
        debug!(id, up_to, "historical delivery complete, going live");
        self.flush_and_prune(id).await;
    }

    async fn dispatch(&mut self, payload: A::Converted) {
        let height = payload.block_number();
        self.order.observe(height);

        let mut flush_ids = Vec::new();
        for (id, sub) in self.subscribers.iter_mut() {
            match self.adapter.filter(&sub.settings, &payload) {
                Ok(Some(response)) => {
                    let duplicate = sub.last_delivered.is_some_and(|d| height <= d);
                    if !duplicate {
                        sub.pending.insert(height, response);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(id, height, err = ?err, "filter evaluation failed");
                }
            }
            if sub.live {
                flush_ids.push(*id);
            }
        }
        for id in flush_ids {
            self.flush_and_prune(id).await;
        }
    }

    /// Delivers ripe pending responses for one subscriber and removes it if
    /// it went slow, disconnected, or completed its closed range.
    async fn flush_and_prune(&mut self, id: SubscriptionId) {
        let watermark = self.order.watermark();
        let Some(sub) = self.subscribers.get_mut(&id) else {
            return;
        };
        let flushed = match watermark {
            Some(watermark) => {
                flush_subscriber(sub, watermark, self.options.slow_consumer_timeout).await
            }
            None => Ok(()),
        };
        match flushed {
            Ok(()) => {
                let range = sub.settings.range();
                let completed = !range.is_open_ended()
                    && sub
                        .last_delivered
                        .is_some_and(|d| d >= range.end as u64);
                if completed {
                    debug!(id, "subscription range complete");
                    self.subscribers.remove(&id);
                }
            }
            Err(err) => {
                match err.current_context() {
                    WatcherError::SlowConsumer => {
                        warn!(id, "evicting slow consumer");
                    }
                    _ => debug!(id, "subscriber disconnected"),
                }
                self.subscribers.remove(&id);
            }
        }
    }
}

async fn flush_subscriber<A: ChainAdapter>(
    sub: &mut SubscriberState<A>,
    watermark: u64,
    timeout: Duration,
) -> Result<()> {
    while let Some(entry) = sub.pending.first_entry() {
        let height = *entry.key();
        if height > watermark {
            break;
        }
        let response = entry.remove();
        send_response(&sub.tx, response, timeout).await?;
        sub.last_delivered = Some(height);
    }
    Ok(())
}

async fn deliver_historical<A, H>(
    historical: Arc<H>,
    settings: &A::Settings,
    start: u64,
    end: u64,
    tx: mpsc::Sender<A::Response>,
    timeout: Duration,
) -> Result<()>
where
    A: ChainAdapter,
    H: HistoricalSource<A>,
{
    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = end.min(chunk_start + HISTORICAL_CHUNK - 1);
        let (responses, shortfalls) = historical
            .responses(settings, chunk_start, chunk_end)
            .await?;
        // Partial responses still go out; the gap scan heals the store and
        // the subscriber is better served by incomplete data than silence.
        for shortfall in shortfalls {
            warn!(err = ?shortfall, "historical fetch returned fewer iplds than indexed");
        }
        for response in responses {
            send_response(&tx, response, timeout).await?;
        }
        chunk_start = chunk_end + 1;
    }
    Ok(())
}

async fn send_response<R: Send>(
    tx: &mpsc::Sender<R>,
    response: R,
    timeout: Duration,
) -> Result<()> {
    use mpsc::error::SendTimeoutError;
    match tx.send_timeout(response, timeout).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err(Report::new(WatcherError::SlowConsumer)),
        Err(SendTimeoutError::Closed(_)) => {
            Err(Report::new(WatcherError::Fatal).attach_printable("subscriber channel closed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::BlockRange,
        testing::{MockChain, MockConverted, MockHistorical, MockSettings},
    };

    fn start_hub(
        historical: Arc<MockHistorical>,
        options: HubOptions,
    ) -> (
        HubHandle<MockChain>,
        mpsc::Sender<MockConverted>,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let ct = CancellationToken::new();
        let (forward_tx, forward_rx) = mpsc::channel(64);
        let hub = SubscriptionHub::new(Arc::new(MockChain::default()), historical, options);
        let (handle, task) = hub.start(forward_rx, ct.clone());
        (handle, forward_tx, ct, task)
    }

    fn settings(start: i64, end: i64) -> MockSettings {
        MockSettings {
            range: BlockRange { start, end },
            only_even: false,
        }
    }

    #[tokio::test]
    async fn live_responses_are_delivered_in_height_order() {
        let (handle, forward_tx, ct, task) =
            start_hub(Arc::new(MockHistorical::default()), HubOptions::default());
        let (_, mut rx) = handle.subscribe(settings(0, 0)).await.unwrap();

        // Out-of-order arrival from parallel publish workers.
        for number in [1, 3, 2, 4] {
            forward_tx.send(MockConverted { number }).await.unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(rx.recv().await.unwrap().number);
        }
        assert_eq!(got, vec![1, 2, 3, 4]);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn filter_limits_what_a_subscriber_sees() {
        let (handle, forward_tx, ct, task) =
            start_hub(Arc::new(MockHistorical::default()), HubOptions::default());
        let odd_and_even = handle.subscribe(settings(0, 0)).await.unwrap();
        let even_only = handle
            .subscribe(MockSettings {
                range: BlockRange::default(),
                only_even: true,
            })
            .await
            .unwrap();
        let (_, mut all_rx) = odd_and_even;
        let (_, mut even_rx) = even_only;

        for number in 1..=4 {
            forward_tx.send(MockConverted { number }).await.unwrap();
        }
        for expected in 1..=4 {
            assert_eq!(all_rx.recv().await.unwrap().number, expected);
        }
        assert_eq!(even_rx.recv().await.unwrap().number, 2);
        assert_eq!(even_rx.recv().await.unwrap().number, 4);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn historical_then_live_without_duplicates_or_gaps() {
        // Index knows blocks up to 149; subscription starts at 100.
        let (handle, forward_tx, ct, task) =
            start_hub(MockHistorical::with_head(149), HubOptions::default());
        let (_, mut rx) = handle.subscribe(settings(100, 200)).await.unwrap();

        // Live payloads race with historical delivery, including a stale
        // height the historical pass already covers.
        for number in [149, 150, 151] {
            forward_tx.send(MockConverted { number }).await.unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..52 {
            got.push(rx.recv().await.unwrap().number);
        }
        let expected: Vec<u64> = (100..=151).collect();
        assert_eq!(got, expected);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn historical_shortfall_still_delivers_partials() {
        let historical = MockHistorical::with_head(5);
        historical.short_on(3);
        let (handle, _forward_tx, ct, task) = start_hub(historical, HubOptions::default());
        let (_, mut rx) = handle.subscribe(settings(1, 5)).await.unwrap();

        // The shortfall on block 3 is reported, not fatal: every response
        // still arrives and the range completes.
        for expected in 1..=5 {
            assert_eq!(rx.recv().await.unwrap().number, expected);
        }
        assert!(rx.recv().await.is_none());

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_range_completes_and_closes_the_channel() {
        let (handle, forward_tx, ct, task) =
            start_hub(Arc::new(MockHistorical::default()), HubOptions::default());
        let (_, mut rx) = handle.subscribe(settings(1, 2)).await.unwrap();

        for number in 1..=3 {
            forward_tx.send(MockConverted { number }).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().number, 1);
        assert_eq!(rx.recv().await.unwrap().number, 2);
        assert!(rx.recv().await.is_none());

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_others_keep_streaming() {
        let options = HubOptions {
            subscriber_capacity: 1,
            slow_consumer_timeout: Duration::from_millis(50),
        };
        let (handle, forward_tx, ct, task) =
            start_hub(Arc::new(MockHistorical::default()), options);
        let (_, mut slow_rx) = handle.subscribe(settings(0, 0)).await.unwrap();
        let (_, mut healthy_rx) = handle.subscribe(settings(0, 0)).await.unwrap();

        // The slow subscriber never drains; its capacity-1 channel fills on
        // block 1 and blocks delivery of block 2 past the timeout.
        for number in 1..=3 {
            forward_tx.send(MockConverted { number }).await.unwrap();
        }
        for expected in 1..=3 {
            assert_eq!(healthy_rx.recv().await.unwrap().number, expected);
        }

        // Eviction closed the slow channel after the one buffered response.
        assert_eq!(slow_rx.recv().await.unwrap().number, 1);
        assert!(slow_rx.recv().await.is_none());

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let (handle, _forward_tx, ct, task) =
            start_hub(Arc::new(MockHistorical::default()), HubOptions::default());
        let (id, mut rx) = handle.subscribe(settings(0, 0)).await.unwrap();
        handle.unsubscribe(id).await;
        assert!(rx.recv().await.is_none());

        ct.cancel();
        task.await.unwrap();
    }

    #[test]
    fn order_tracker_advances_through_holes() {
        let mut tracker = OrderTracker::default();
        tracker.observe(10);
        assert_eq!(tracker.watermark(), Some(10));
        tracker.observe(12);
        assert_eq!(tracker.watermark(), Some(10));
        tracker.observe(11);
        assert_eq!(tracker.watermark(), Some(12));
        // Duplicates and late fills do not move the watermark.
        tracker.observe(11);
        assert_eq!(tracker.watermark(), Some(12));
    }
}
