use std::{collections::HashMap, sync::Arc, sync::RwLock};

use async_trait::async_trait;
use cid::Cid;
use error_stack::{Report, ResultExt};
use futures::future;
use tracing::debug;

use crate::{
    core::{multihash_key, IpldNode},
    error::{Result, WatcherError},
};

/// Which backing holds the IPLD bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// In-process map. Test and single-shot tooling only.
    Memory,
    /// A separate content-addressed service reached over HTTP.
    Remote,
    /// Bytes live in the same database as the index, written in the same
    /// transaction as the metadata rows.
    Direct,
}

impl std::str::FromStr for StoreMode {
    type Err = Report<WatcherError>;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreMode::Memory),
            "remote" => Ok(StoreMode::Remote),
            "direct" => Ok(StoreMode::Direct),
            other => Err(Report::new(WatcherError::Configuration)
                .attach_printable(format!("unknown store mode: {other}"))),
        }
    }
}

/// Content-addressed put/get of raw IPLD bytes.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Idempotent: putting a CID already present is a no-op.
    async fn put(&self, node: &IpldNode) -> Result<()>;

    /// `NotFound` if the CID is absent.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>>;

    /// Best-effort batch get. Missing CIDs are skipped, not errors; callers
    /// reconcile the returned set against the request.
    async fn get_batch(&self, cids: &[Cid]) -> Result<Vec<IpldNode>>;
}

#[derive(Default, Clone)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .contains_key(cid)
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, node: &IpldNode) -> Result<()> {
        self.blocks
            .write()
            .expect("block store lock poisoned")
            .entry(node.cid)
            .or_insert_with(|| node.data.clone());
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .get(cid)
            .cloned()
            .ok_or_else(|| {
                Report::new(WatcherError::NotFound).attach_printable(format!("cid {cid}"))
            })
    }

    async fn get_batch(&self, cids: &[Cid]) -> Result<Vec<IpldNode>> {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        Ok(cids
            .iter()
            .filter_map(|cid| {
                blocks.get(cid).map(|data| IpldNode {
                    cid: *cid,
                    data: data.clone(),
                })
            })
            .collect())
    }
}

/// Block store backed by an external content-addressed service exposing
/// `PUT /blocks/{cid}` and `GET /blocks/{cid}`.
pub struct RemoteBlockStore {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteBlockStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn block_url(&self, cid: &Cid) -> String {
        format!("{}/blocks/{}", self.base_url.trim_end_matches('/'), cid)
    }
}

#[async_trait]
impl BlockStore for RemoteBlockStore {
    async fn put(&self, node: &IpldNode) -> Result<()> {
        let response = self
            .client
            .put(self.block_url(&node.cid))
            .body(node.data.clone())
            .send()
            .await
            .change_context(WatcherError::PublishFailed)
            .attach_printable("remote block store put failed")?;
        response
            .error_for_status()
            .change_context(WatcherError::PublishFailed)
            .attach_printable("remote block store rejected put")?;
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.block_url(cid))
            .send()
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable("remote block store get failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Report::new(WatcherError::NotFound).attach_printable(format!("cid {cid}")));
        }
        let body = response
            .error_for_status()
            .change_context(WatcherError::NotFound)?
            .bytes()
            .await
            .change_context(WatcherError::NotFound)?;
        Ok(body.to_vec())
    }

    async fn get_batch(&self, cids: &[Cid]) -> Result<Vec<IpldNode>> {
        let fetches = cids.iter().map(|cid| async move {
            match self.get(cid).await {
                Ok(data) => Some(IpldNode { cid: *cid, data }),
                Err(err) => {
                    debug!(cid = %cid, err = ?err, "batch get skipping missing cid");
                    None
                }
            }
        });
        Ok(future::join_all(fetches).await.into_iter().flatten().collect())
    }
}

/// Block store over the index database's `public.blocks (key, data)` table.
///
/// Sync-path writes in direct mode go through the indexer's transaction
/// instead; this store covers reads and standalone puts.
pub struct PostgresBlockStore {
    client: Arc<tokio_postgres::Client>,
}

impl PostgresBlockStore {
    pub fn new(client: Arc<tokio_postgres::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockStore for PostgresBlockStore {
    async fn put(&self, node: &IpldNode) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO public.blocks (key, data) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
                &[&node.store_key(), &node.data],
            )
            .await
            .change_context(WatcherError::PublishFailed)
            .attach_printable("failed to write blocks row")?;
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let row = self
            .client
            .query_opt(
                "SELECT data FROM public.blocks WHERE key = $1",
                &[&multihash_key(cid)],
            )
            .await
            .change_context(WatcherError::NotFound)
            .attach_printable("failed to read blocks row")?;
        match row {
            Some(row) => Ok(row.get(0)),
            None => {
                Err(Report::new(WatcherError::NotFound).attach_printable(format!("cid {cid}")))
            }
        }
    }

    async fn get_batch(&self, cids: &[Cid]) -> Result<Vec<IpldNode>> {
        let keys: Vec<String> = cids.iter().map(multihash_key).collect();
        let rows = self
            .client
            .query(
                "SELECT key, data FROM public.blocks WHERE key = ANY($1)",
                &[&keys],
            )
            .await
            .change_context(WatcherError::NotFound)
            .attach_printable("failed to batch read blocks rows")?;
        let mut by_key: HashMap<String, Vec<u8>> = rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, Vec<u8>>(1)))
            .collect();
        Ok(cids
            .iter()
            .zip(keys)
            .filter_map(|(cid, key)| {
                by_key.remove(&key).map(|data| IpldNode { cid: *cid, data })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IpldNode;

    fn node(byte: u8) -> IpldNode {
        IpldNode::from_digest(0x90, 0x1b, &[byte; 32], vec![byte; 4]).unwrap()
    }

    #[tokio::test]
    async fn memory_store_put_is_idempotent() {
        let store = MemoryBlockStore::new();
        let n = node(1);
        store.put(&n).await.unwrap();
        store.put(&n).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&n.cid).await.unwrap(), n.data);
    }

    #[tokio::test]
    async fn memory_store_get_missing_is_not_found() {
        let store = MemoryBlockStore::new();
        let err = store.get(&node(2).cid).await.unwrap_err();
        assert_eq!(*err.current_context(), WatcherError::NotFound);
    }

    #[tokio::test]
    async fn memory_store_batch_get_is_lossy() {
        let store = MemoryBlockStore::new();
        let present = node(3);
        let missing = node(4);
        store.put(&present).await.unwrap();
        let got = store.get_batch(&[present.cid, missing.cid]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cid, present.cid);
    }
}
