use std::collections::BTreeMap;

use alloy_consensus::{Block, Header, ReceiptEnvelope, TxEnvelope};
use alloy_primitives::{Address, Bytes, B256, U256};
use chainwatch_common::adapter::BlockPayload;
use serde::{Deserialize, Serialize};

/// Kind of a trie node, as the statediff service classifies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Branch,
    Extension,
    Leaf,
    Removed,
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NodeKind::Branch => 0,
            NodeKind::Extension => 1,
            NodeKind::Leaf => 2,
            NodeKind::Removed => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => NodeKind::Branch,
            1 => NodeKind::Extension,
            3 => NodeKind::Removed,
            _ => NodeKind::Leaf,
        }
    }
}

/// One state trie node as emitted by the statediff subscription, with the
/// storage trie nodes keyed under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStateNode {
    pub path: Bytes,
    pub node_type: NodeKind,
    pub state_key: B256,
    pub value: Bytes,
    #[serde(default)]
    pub storage: Vec<RawStorageNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStorageNode {
    pub path: Bytes,
    pub node_type: NodeKind,
    pub storage_key: B256,
    pub value: Bytes,
}

/// What the statediff service emits for one block height.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStateDiff {
    pub block_number: u64,
    pub block_rlp: Bytes,
    /// EIP-2718 encoded receipts, one per transaction, in block order.
    pub receipts_rlp: Vec<Bytes>,
    pub total_difficulty: U256,
    #[serde(default)]
    pub state_nodes: Vec<RawStateNode>,
}

impl BlockPayload for RawStateDiff {
    fn block_number(&self) -> u64 {
        self.block_number
    }
}

/// Per-transaction metadata derived during conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMeta {
    pub tx_hash: B256,
    pub index: u64,
    pub src: Address,
    pub dst: Option<Address>,
}

/// Per-receipt metadata derived during conversion: the four topic slots and
/// the contract the logs were emitted against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptMeta {
    pub tx_hash: B256,
    pub topics: [Vec<B256>; 4],
    pub contract: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNode {
    pub state_key: B256,
    pub kind: NodeKind,
    pub path: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageNode {
    pub state_key: B256,
    pub storage_key: B256,
    pub kind: NodeKind,
    pub path: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decoded in-memory representation of one Ethereum block and its diffs.
#[derive(Debug, Clone)]
pub struct ConvertedPayload {
    pub block: Block<TxEnvelope>,
    pub total_difficulty: U256,
    pub tx_meta: Vec<TxMeta>,
    pub receipts: Vec<ReceiptEnvelope>,
    pub receipt_meta: Vec<ReceiptMeta>,
    pub state_nodes: Vec<StateNode>,
    pub storage_nodes: Vec<StorageNode>,
}

impl ConvertedPayload {
    pub fn header(&self) -> &Header {
        &self.block.header
    }

    pub fn transactions(&self) -> &[TxEnvelope] {
        &self.block.body.transactions
    }

    pub fn uncles(&self) -> &[Header] {
        &self.block.body.ommers
    }
}

impl BlockPayload for ConvertedPayload {
    fn block_number(&self) -> u64 {
        self.block.header.number
    }
}

/// The CIDs produced by publishing one payload, with the metadata needed
/// for indexed lookup.
#[derive(Debug, Clone)]
pub struct CidManifest {
    pub header: HeaderModel,
    pub uncles: Vec<UncleModel>,
    pub transactions: Vec<TxModel>,
    pub receipts: Vec<ReceiptModel>,
    pub state_nodes: Vec<StateNodeModel>,
    pub storage_nodes: Vec<StorageNodeModel>,
}

impl BlockPayload for CidManifest {
    fn block_number(&self) -> u64 {
        self.header.block_number as u64
    }
}

#[derive(Debug, Clone)]
pub struct HeaderModel {
    pub cid: String,
    pub mh_key: String,
    pub block_number: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub total_difficulty: String,
    pub reward: String,
    pub state_root: String,
    pub tx_root: String,
    pub receipt_root: String,
    pub uncle_root: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct UncleModel {
    pub cid: String,
    pub mh_key: String,
    pub block_hash: String,
    pub parent_hash: String,
    pub reward: String,
}

#[derive(Debug, Clone)]
pub struct TxModel {
    pub cid: String,
    pub mh_key: String,
    pub tx_hash: String,
    pub index: i64,
    pub src: String,
    pub dst: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReceiptModel {
    pub cid: String,
    pub mh_key: String,
    pub tx_hash: String,
    pub contract: Option<String>,
    pub topic0s: Vec<String>,
    pub topic1s: Vec<String>,
    pub topic2s: Vec<String>,
    pub topic3s: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateNodeModel {
    pub cid: String,
    pub mh_key: String,
    pub state_key: String,
    pub node_type: i32,
    pub path: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StorageNodeModel {
    pub cid: String,
    pub mh_key: String,
    pub state_key: String,
    pub storage_key: String,
    pub node_type: i32,
    pub path: Vec<u8>,
}

/// The filtered payload shipped to a subscriber. Raw-byte-preserving: only
/// RLP of the included objects, never decoded form, so the wire payload is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub block_number: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers_rlp: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uncles_rlp: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions_rlp: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receipts_rlp: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_nodes_rlp: BTreeMap<B256, Bytes>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_nodes_rlp: BTreeMap<B256, BTreeMap<B256, Bytes>>,
}

impl StreamResponse {
    pub fn has_content(&self) -> bool {
        !self.headers_rlp.is_empty()
            || !self.uncles_rlp.is_empty()
            || !self.transactions_rlp.is_empty()
            || !self.receipts_rlp.is_empty()
            || !self.state_nodes_rlp.is_empty()
            || !self.storage_nodes_rlp.is_empty()
    }
}

impl BlockPayload for StreamResponse {
    fn block_number(&self) -> u64 {
        self.block_number
    }
}

/// One block's worth of query results: the CID rows a subscription's
/// predicate selected, grouped for fetching.
#[derive(Debug, Clone, Default)]
pub struct CidWrapper {
    pub block_number: i64,
    pub header: Option<HeaderModel>,
    pub uncles: Vec<UncleModel>,
    pub transactions: Vec<TxModel>,
    pub receipts: Vec<ReceiptModel>,
    pub state_nodes: Vec<StateNodeModel>,
    pub storage_nodes: Vec<StorageNodeModel>,
}

/// Formats an address the way the index stores it.
pub fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}

/// Formats a hash the way the index stores it.
pub fn hash_key(hash: &B256) -> String {
    format!("{hash:#x}")
}
