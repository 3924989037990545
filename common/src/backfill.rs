use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    adapter::{BlockPayload, ChainAdapter, CidIndexer, CidRetriever},
    error::Result,
    publisher::Publisher,
};

#[derive(Debug, Clone)]
pub struct BackFillOptions {
    /// How often to scan the index for work.
    pub frequency: Duration,
    /// Heights per upstream fetch.
    pub batch_size: u64,
    /// Concurrent fetch batches.
    pub workers: usize,
    /// Re-fetch heights validated fewer times than this.
    pub validation_level: i32,
}

impl Default for BackFillOptions {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(30),
            batch_size: 100,
            workers: 4,
            validation_level: 1,
        }
    }
}

/// Periodically closes index gaps and re-validates stale heights by pulling
/// the missing ranges from the upstream HTTP endpoint and running them
/// through the same convert → publish → index tail as the sync path.
pub struct BackFiller<A, I, R>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
    R: CidRetriever,
{
    adapter: Arc<A>,
    publisher: Arc<Publisher<A, I>>,
    retriever: Arc<R>,
    options: BackFillOptions,
}

impl<A, I, R> BackFiller<A, I, R>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
    R: CidRetriever,
{
    pub fn new(
        adapter: Arc<A>,
        publisher: Arc<Publisher<A, I>>,
        retriever: Arc<R>,
        options: BackFillOptions,
    ) -> Self {
        Self {
            adapter,
            publisher,
            retriever,
            options,
        }
    }

    /// Spawns the periodic fill loop. Backfilled payloads are forwarded to
    /// the subscription tee so subscribers see one unified stream.
    pub fn start(
        self,
        forward_tx: mpsc::Sender<A::Converted>,
        ct: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.options.frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = self.fill(&forward_tx, &ct).await {
                            warn!(err = ?err, "backfill pass failed");
                        }
                    }
                    _ = ct.cancelled() => break,
                }
            }
            info!("backfiller stopped");
        })
    }

    async fn fill(
        &self,
        forward_tx: &mpsc::Sender<A::Converted>,
        ct: &CancellationToken,
    ) -> Result<()> {
        let Some(first) = self.retriever.first_block_number().await? else {
            debug!("index is empty, nothing to backfill");
            return Ok(());
        };
        let last = self.retriever.last_block_number().await?.unwrap_or(first);

        let mut heights = BTreeSet::new();
        for gap in self.retriever.gaps(first, last).await? {
            heights.extend(gap.start..=gap.end);
        }
        heights.extend(
            self.retriever
                .stale_heights(self.options.validation_level, first, last)
                .await?,
        );
        if heights.is_empty() {
            return Ok(());
        }
        info!(heights = heights.len(), first, last, "backfilling");

        let batches: Vec<Vec<u64>> = heights
            .into_iter()
            .collect::<Vec<_>>()
            .chunks(self.options.batch_size.max(1) as usize)
            .map(|chunk| chunk.to_vec())
            .collect();

        futures::stream::iter(batches)
            .for_each_concurrent(self.options.workers.max(1), |batch| async move {
                // Abort at the batch boundary on shutdown; in-flight batches
                // run to completion.
                if ct.is_cancelled() {
                    return;
                }
                if let Err(err) = self.process_batch(&batch, forward_tx).await {
                    warn!(
                        start = batch.first(),
                        end = batch.last(),
                        err = ?err,
                        "backfill batch failed"
                    );
                }
            })
            .await;
        Ok(())
    }

    async fn process_batch(
        &self,
        batch: &[u64],
        forward_tx: &mpsc::Sender<A::Converted>,
    ) -> Result<()> {
        let raws = self.adapter.fetch_raw(batch).await?;
        for raw in raws {
            let block_number = raw.block_number();
            let converted = match self.adapter.convert(raw) {
                Ok(converted) => converted,
                Err(err) => {
                    warn!(block_number, err = ?err, "skipping malformed backfill payload");
                    continue;
                }
            };
            if let Err(err) = self.publisher.publish_and_index(&converted).await {
                warn!(block_number, err = ?err, "failed to publish backfill block");
                continue;
            }
            if forward_tx.send(converted).await.is_err() {
                debug!(block_number, "forward channel closed, dropping backfill payload");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blockstore::{BlockStore, MemoryBlockStore, StoreMode},
        core::Gap,
        testing::{MockChain, MockIndexer, MockRetriever},
    };

    fn backfiller(
        chain: MockChain,
        indexer: Arc<MockIndexer>,
        retriever: Arc<MockRetriever>,
    ) -> BackFiller<MockChain, MockIndexer, MockRetriever> {
        let adapter = Arc::new(chain);
        let publisher = Arc::new(Publisher::new(
            adapter.clone(),
            Arc::new(MemoryBlockStore::new()) as Arc<dyn BlockStore>,
            indexer,
            StoreMode::Memory,
        ));
        BackFiller::new(
            adapter,
            publisher,
            retriever,
            BackFillOptions {
                frequency: Duration::from_millis(10),
                batch_size: 2,
                workers: 2,
                validation_level: 0,
            },
        )
    }

    #[tokio::test]
    async fn gaps_are_fetched_published_and_forwarded() {
        let retriever = Arc::new(MockRetriever::with_range(1, 10));
        retriever.add_gap(Gap { start: 4, end: 6 });
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let task = backfiller(MockChain::default(), indexer.clone(), retriever)
            .start(forward_tx, ct.clone());

        let mut forwarded = Vec::new();
        for _ in 0..3 {
            forwarded.push(forward_rx.recv().await.unwrap().number);
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![4, 5, 6]);

        let mut indexed = indexer.indexed();
        indexed.sort_unstable();
        assert_eq!(indexed, vec![4, 5, 6]);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stale_heights_are_revalidated() {
        let retriever = Arc::new(MockRetriever::with_range(1, 5));
        retriever.add_stale(3);
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let task = backfiller(MockChain::default(), indexer.clone(), retriever)
            .start(forward_tx, ct.clone());

        assert_eq!(forward_rx.recv().await.unwrap().number, 3);
        assert_eq!(indexer.indexed(), vec![3]);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn partial_fetch_fails_the_batch_but_not_the_pass() {
        let mut chain = MockChain::default();
        chain.missing_upstream(2);
        let retriever = Arc::new(MockRetriever::with_range(1, 10));
        // Heights 1..=2 land in one batch (batch_size 2), 8 in another.
        retriever.add_gap(Gap { start: 1, end: 2 });
        retriever.add_gap(Gap { start: 8, end: 8 });
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, mut forward_rx) = mpsc::channel(16);
        let task = backfiller(chain, indexer.clone(), retriever).start(forward_tx, ct.clone());

        assert_eq!(forward_rx.recv().await.unwrap().number, 8);
        assert_eq!(indexer.indexed(), vec![8]);

        ct.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_index_is_a_quiet_no_op() {
        let retriever = Arc::new(MockRetriever::default());
        let indexer = Arc::new(MockIndexer::default());
        let ct = CancellationToken::new();

        let (forward_tx, _forward_rx) = mpsc::channel(16);
        let task =
            backfiller(MockChain::default(), indexer.clone(), retriever).start(forward_tx, ct.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(indexer.indexed().is_empty());

        ct.cancel();
        task.await.unwrap();
    }
}
