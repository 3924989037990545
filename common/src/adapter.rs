use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{BlockRange, Gap, IpldNode},
    error::{Result, WatcherError},
};

/// Anything keyed by a block height.
pub trait BlockPayload {
    fn block_number(&self) -> u64;
}

/// A subscriber's predicate. The per-chain filter blocks live behind this.
pub trait Settings {
    fn range(&self) -> BlockRange;
}

/// The per-chain leaf of the system: streaming, fetching, parsing raw
/// payloads into canonical form, encoding canonical form into IPLD nodes,
/// and evaluating subscription predicates.
///
/// Pipeline stages are generic over the adapter's associated types, so a
/// payload never changes type mid-flight and nothing downcasts.
#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
    /// What the upstream node emits for one block height.
    type Raw: BlockPayload + Send + 'static;
    /// Decoded in-memory representation of one block.
    type Converted: BlockPayload + Clone + Send + Sync + 'static;
    /// The CIDs produced by publishing one converted payload, with the
    /// metadata needed for indexed lookup.
    type Manifest: BlockPayload + Send + Sync + 'static;
    /// A parsed subscription predicate.
    type Settings: Settings + Clone + Send + Sync + 'static;
    /// The filtered, raw-byte-preserving payload shipped to a subscriber.
    type Response: BlockPayload + serde::Serialize + Clone + Send + Sync + 'static;

    /// Opens a live subscription to the upstream node and forwards payloads
    /// in block-height order until the connection drops or `ct` fires.
    /// Returns `UpstreamUnavailable` when the connection cannot be
    /// established or is lost; the caller reopens with backoff.
    async fn stream_raw(
        &self,
        out: mpsc::Sender<Self::Raw>,
        ct: CancellationToken,
    ) -> Result<()>;

    /// Bounded-parallel historical pull. Results come back in request order;
    /// any missing height is a `PartialFetch` error.
    async fn fetch_raw(&self, heights: &[u64]) -> Result<Vec<Self::Raw>>;

    /// Deterministic parse of a raw payload. `MalformedPayload` on decode
    /// errors.
    fn convert(&self, raw: Self::Raw) -> Result<Self::Converted>;

    /// Builds the canonical IPLD nodes for a payload and the manifest
    /// describing them. Verifies derived trie roots against the header;
    /// a mismatch is `RootMismatch` and the block must not be published.
    fn encode(&self, payload: &Self::Converted) -> Result<(Vec<IpldNode>, Self::Manifest)>;

    /// Evaluates a subscription predicate against a converted payload.
    /// `None` means nothing matched and no response is emitted.
    fn filter(
        &self,
        settings: &Self::Settings,
        payload: &Self::Converted,
    ) -> Result<Option<Self::Response>>;

    /// Deserializes a subscriber's parameters. `BadSubscription` on failure.
    fn parse_settings(&self, params: &serde_json::Value) -> Result<Self::Settings>;
}

/// Writes one block's manifest into the relational index.
///
/// Implementations are transactional per block: all rows commit or none do.
/// In direct-store mode the same transaction also writes the IPLD bytes,
/// which is why the nodes ride along.
#[async_trait]
pub trait CidIndexer<A: ChainAdapter>: Send + Sync + 'static {
    async fn index(&self, manifest: &A::Manifest, nodes: &[IpldNode]) -> Result<()>;
}

/// Reads the index back: gap detection, validation-level scanning, and the
/// high-water mark the hub uses to split historical from live delivery.
#[async_trait]
pub trait CidRetriever: Send + Sync + 'static {
    /// Block-height intervals inside `[from, to]` with no rows.
    async fn gaps(&self, from: u64, to: u64) -> Result<Vec<Gap>>;

    /// Heights whose rows sit below the validation level and should be
    /// re-fetched.
    async fn stale_heights(&self, level: i32, from: u64, to: u64) -> Result<Vec<u64>>;

    async fn first_block_number(&self) -> Result<Option<u64>>;

    async fn last_block_number(&self) -> Result<Option<u64>>;
}

/// Responses reconstructed from the store, paired with any shortfall
/// reports (`UnexpectedIpldCount`) hit while fetching them. A shortfall
/// does not void the partial responses; the caller decides policy.
pub type PartialResponses<A> = (
    Vec<<A as ChainAdapter>::Response>,
    Vec<Report<WatcherError>>,
);

/// The historical half of a subscription: reconstructs responses for
/// `[start, end]` from persisted CIDs.
///
/// This is the only capability the hub holds toward the storage side, so the
/// hub never references the streamer or the index directly.
#[async_trait]
pub trait HistoricalSource<A: ChainAdapter>: Send + Sync + 'static {
    /// Responses for the settings over `[start, end]`, ascending by block
    /// number. Blocks that match nothing are simply absent; blocks whose
    /// IPLD fetch came up short are returned as-is alongside a shortfall
    /// report per incomplete fetch.
    async fn responses(
        &self,
        settings: &A::Settings,
        start: u64,
        end: u64,
    ) -> Result<PartialResponses<A>>;

    /// Highest indexed block number, if any.
    async fn head(&self) -> Result<Option<u64>>;
}
