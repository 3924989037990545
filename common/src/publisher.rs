use std::sync::Arc;

use error_stack::ResultExt;
use tracing::{debug, trace};

use crate::{
    adapter::{BlockPayload, ChainAdapter, CidIndexer},
    blockstore::{BlockStore, StoreMode},
    error::{Result, WatcherError},
};

/// Drives the adapter's encoder, persists the resulting IPLD nodes, and
/// hands the manifest to the indexer.
///
/// Publish and index for one block either both commit or neither does. In
/// direct mode the indexer writes bytes and rows in one transaction; in the
/// other modes puts run first and an index failure leaves already-written
/// CIDs behind, which is safe because re-publication is idempotent and the
/// gap scan will revisit the block.
pub struct Publisher<A, I>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
{
    adapter: Arc<A>,
    store: Arc<dyn BlockStore>,
    indexer: Arc<I>,
    mode: StoreMode,
}

impl<A, I> Publisher<A, I>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
{
    pub fn new(
        adapter: Arc<A>,
        store: Arc<dyn BlockStore>,
        indexer: Arc<I>,
        mode: StoreMode,
    ) -> Self {
        Self {
            adapter,
            store,
            indexer,
            mode,
        }
    }

    /// Encodes, stores, and indexes one converted payload.
    ///
    /// A `RootMismatch` from the encoder rejects the block before anything
    /// is written.
    pub async fn publish_and_index(&self, payload: &A::Converted) -> Result<A::Manifest> {
        let block_number = payload.block_number();
        let (nodes, manifest) = self.adapter.encode(payload)?;
        trace!(block_number, nodes = nodes.len(), "encoded ipld nodes");

        match self.mode {
            StoreMode::Direct => {
                // Bytes ride the indexer's transaction.
                self.indexer
                    .index(&manifest, &nodes)
                    .await
                    .change_context(WatcherError::IndexFailed)
                    .attach_printable_lazy(|| format!("block {block_number}"))?;
            }
            StoreMode::Memory | StoreMode::Remote => {
                for node in &nodes {
                    self.store
                        .put(node)
                        .await
                        .change_context(WatcherError::PublishFailed)
                        .attach_printable_lazy(|| {
                            format!("block {block_number} cid {}", node.cid)
                        })?;
                }
                self.indexer
                    .index(&manifest, &[])
                    .await
                    .change_context(WatcherError::IndexFailed)
                    .attach_printable_lazy(|| format!("block {block_number}"))?;
            }
        }

        debug!(block_number, "published and indexed block");
        Ok(manifest)
    }
}
