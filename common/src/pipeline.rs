use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{BlockPayload, ChainAdapter, CidIndexer},
    error::WatcherError,
    publisher::Publisher,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of the raw payload channel.
    pub raw_capacity: usize,
    /// Capacity of the converted payload channel.
    pub converted_capacity: usize,
    /// Workers draining the raw channel through `convert`.
    pub convert_workers: usize,
    /// Workers draining the converted channel through publish+index.
    pub publish_workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        // Publishing is the expensive stage, so it gets the parallelism.
        Self {
            raw_capacity: 1024,
            converted_capacity: 256,
            convert_workers: 1,
            publish_workers: 4,
        }
    }
}

/// The sync path: upstream stream → convert workers → publish+index workers
/// → forward tee.
///
/// Every inter-stage queue is a bounded mpsc channel; blocking sends are the
/// flow control. Block-height order is not preserved end to end because the
/// worker stages run in parallel; consumers tolerate out-of-order arrival.
pub struct Pipeline<A, I>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
{
    adapter: Arc<A>,
    publisher: Arc<Publisher<A, I>>,
    options: PipelineOptions,
}

impl<A, I> Pipeline<A, I>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
{
    pub fn new(adapter: Arc<A>, publisher: Arc<Publisher<A, I>>, options: PipelineOptions) -> Self {
        Self {
            adapter,
            publisher,
            options,
        }
    }

    /// Spawns the streamer and worker tasks. Converted payloads that publish
    /// successfully are teed onto `forward_tx` for the subscription hub.
    ///
    /// On cancellation the streamer stops producing and closes its channel;
    /// each worker stage drains its input before exiting, so the returned
    /// handles complete only once in-flight blocks are finished.
    pub fn start(
        self,
        forward_tx: mpsc::Sender<A::Converted>,
        ct: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let (raw_tx, raw_rx) = mpsc::channel::<A::Raw>(self.options.raw_capacity);
        let (converted_tx, converted_rx) =
            mpsc::channel::<A::Converted>(self.options.converted_capacity);

        handles.push(tokio::spawn(streamer_loop(
            self.adapter.clone(),
            raw_tx,
            ct.clone(),
        )));

        let raw_rx = Arc::new(Mutex::new(raw_rx));
        for worker in 0..self.options.convert_workers.max(1) {
            handles.push(tokio::spawn(convert_worker(
                worker,
                self.adapter.clone(),
                raw_rx.clone(),
                converted_tx.clone(),
            )));
        }
        drop(converted_tx);

        let converted_rx = Arc::new(Mutex::new(converted_rx));
        for worker in 0..self.options.publish_workers.max(1) {
            handles.push(tokio::spawn(publish_worker(
                worker,
                self.publisher.clone(),
                converted_rx.clone(),
                forward_tx.clone(),
            )));
        }

        handles
    }
}

/// Keeps the upstream subscription open, reopening with bounded exponential
/// backoff whenever it drops. Never fatal at this level.
async fn streamer_loop<A: ChainAdapter>(
    adapter: Arc<A>,
    raw_tx: mpsc::Sender<A::Raw>,
    ct: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if ct.is_cancelled() {
            break;
        }
        match adapter.stream_raw(raw_tx.clone(), ct.clone()).await {
            Ok(()) => {
                info!("upstream stream closed");
                break;
            }
            Err(err) => {
                warn!(err = ?err, backoff = ?backoff, "upstream unavailable, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ct.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    // Dropping the last sender closes the raw channel and lets the convert
    // workers drain out.
}

async fn convert_worker<A: ChainAdapter>(
    worker: usize,
    adapter: Arc<A>,
    raw_rx: Arc<Mutex<mpsc::Receiver<A::Raw>>>,
    converted_tx: mpsc::Sender<A::Converted>,
) {
    loop {
        let raw = { raw_rx.lock().await.recv().await };
        let Some(raw) = raw else {
            debug!(worker, "raw channel closed, convert worker exiting");
            break;
        };
        let block_number = raw.block_number();
        match adapter.convert(raw) {
            Ok(converted) => {
                if converted_tx.send(converted).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                // Skip the block; the gap scan will revisit it.
                warn!(worker, block_number, err = ?err, "failed to convert payload");
            }
        }
    }
}

async fn publish_worker<A, I>(
    worker: usize,
    publisher: Arc<Publisher<A, I>>,
    converted_rx: Arc<Mutex<mpsc::Receiver<A::Converted>>>,
    forward_tx: mpsc::Sender<A::Converted>,
) where
    A: ChainAdapter,
    I: CidIndexer<A>,
{
    loop {
        let payload = { converted_rx.lock().await.recv().await };
        let Some(payload) = payload else {
            debug!(worker, "converted channel closed, publish worker exiting");
            break;
        };
        let block_number = payload.block_number();
        match publisher.publish_and_index(&payload).await {
            Ok(_) => {
                if forward_tx.send(payload).await.is_err() {
                    debug!(worker, block_number, "forward channel closed, dropping payload");
                }
            }
            Err(err) if *err.current_context() == WatcherError::RootMismatch => {
                error!(worker, block_number, err = ?err, "rejecting block with bad root");
            }
            Err(err) => {
                // The block stays a gap for the backfiller.
                warn!(worker, block_number, err = ?err, "failed to publish block");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::BlockPayload,
        blockstore::{BlockStore, MemoryBlockStore, StoreMode},
        testing::{MockChain, MockIndexer, MockRaw},
    };

    fn pipeline(
        chain: MockChain,
        indexer: Arc<MockIndexer>,
        store: MemoryBlockStore,
    ) -> Pipeline<MockChain, MockIndexer> {
        let adapter = Arc::new(chain);
        let publisher = Arc::new(Publisher::new(
            adapter.clone(),
            Arc::new(store) as Arc<dyn BlockStore>,
            indexer,
            StoreMode::Memory,
        ));
        Pipeline::new(adapter, publisher, PipelineOptions::default())
    }

    #[tokio::test]
    async fn payloads_flow_end_to_end() {
        let chain = MockChain::with_blocks(1..=5);
        let indexer = Arc::new(MockIndexer::default());
        let store = MemoryBlockStore::new();
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let handles = pipeline(chain, indexer.clone(), store.clone()).start(forward_tx, ct.clone());

        let mut forwarded = Vec::new();
        for _ in 0..5 {
            forwarded.push(forward_rx.recv().await.unwrap().block_number());
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![1, 2, 3, 4, 5]);

        let mut indexed = indexer.indexed();
        indexed.sort_unstable();
        assert_eq!(indexed, vec![1, 2, 3, 4, 5]);
        // One IPLD node per mock block.
        assert_eq!(store.len(), 5);

        ct.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn malformed_payload_skips_only_that_block() {
        let mut chain = MockChain::with_blocks(1..=3);
        chain.fail_convert(2);
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let handles =
            pipeline(chain, indexer.clone(), MemoryBlockStore::new()).start(forward_tx, ct.clone());

        let mut forwarded = Vec::new();
        for _ in 0..2 {
            forwarded.push(forward_rx.recv().await.unwrap().block_number());
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![1, 3]);

        ct.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!indexer.indexed().contains(&2));
    }

    #[tokio::test]
    async fn root_mismatch_rejects_block_without_indexing() {
        let mut chain = MockChain::with_blocks(1..=3);
        chain.fail_encode(3);
        let indexer = Arc::new(MockIndexer::default());
        let store = MemoryBlockStore::new();
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let handles = pipeline(chain, indexer.clone(), store.clone()).start(forward_tx, ct.clone());

        let mut forwarded = Vec::new();
        for _ in 0..2 {
            forwarded.push(forward_rx.recv().await.unwrap().block_number());
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![1, 2]);

        ct.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!indexer.indexed().contains(&3));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_upstream_reconnects_and_resumes() {
        let mut chain = MockChain::with_blocks(1..=2);
        chain.fail_streams(2);
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let handles =
            pipeline(chain, indexer.clone(), MemoryBlockStore::new()).start(forward_tx, ct.clone());

        // Two failed attempts, two backoff sleeps, then the stream serves.
        let mut forwarded = Vec::new();
        for _ in 0..2 {
            forwarded.push(forward_rx.recv().await.unwrap().block_number());
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![1, 2]);

        ct.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_heights_are_idempotent() {
        let chain = MockChain::with_raw(vec![MockRaw::new(7), MockRaw::new(7)]);
        let indexer = Arc::new(MockIndexer::default());
        let store = MemoryBlockStore::new();
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let handles = pipeline(chain, indexer.clone(), store.clone()).start(forward_tx, ct.clone());

        for _ in 0..2 {
            assert_eq!(forward_rx.recv().await.unwrap().block_number(), 7);
        }
        // Same bytes, same CID: the store deduplicates.
        assert_eq!(store.len(), 1);

        ct.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
