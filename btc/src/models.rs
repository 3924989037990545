use alloy_primitives::Bytes;
use bitcoin::Block;
use chainwatch_common::adapter::BlockPayload;
use serde::{Deserialize, Serialize};

/// Raw consensus-serialized block as pulled from bitcoind.
#[derive(Debug, Clone)]
pub struct RawBlockPayload {
    pub height: u64,
    pub block: Vec<u8>,
}

impl BlockPayload for RawBlockPayload {
    fn block_number(&self) -> u64 {
        self.height
    }
}

/// Standard script classes bitcoind distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptClass {
    Pubkey,
    PubkeyHash,
    ScriptHash,
    WitnessPubkeyHash,
    WitnessScriptHash,
    Taproot,
    Multisig,
    NullData,
    NonStandard,
}

impl ScriptClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptClass::Pubkey => "pubkey",
            ScriptClass::PubkeyHash => "pubkeyhash",
            ScriptClass::ScriptHash => "scripthash",
            ScriptClass::WitnessPubkeyHash => "witness_v0_keyhash",
            ScriptClass::WitnessScriptHash => "witness_v0_scripthash",
            ScriptClass::Taproot => "witness_v1_taproot",
            ScriptClass::Multisig => "multisig",
            ScriptClass::NullData => "nulldata",
            ScriptClass::NonStandard => "nonstandard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInputMeta {
    pub index: u64,
    pub outpoint_tx_hash: String,
    pub outpoint_index: u32,
    pub sig_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutputMeta {
    pub index: u64,
    pub value: i64,
    pub pk_script: Vec<u8>,
    pub script_class: ScriptClass,
    pub addresses: Vec<String>,
}

/// Per-transaction metadata derived during conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtcTxMeta {
    pub tx_hash: String,
    pub index: u64,
    pub segwit: bool,
    pub witness_hash: String,
    pub inputs: Vec<TxInputMeta>,
    pub outputs: Vec<TxOutputMeta>,
}

/// Decoded in-memory representation of one Bitcoin block.
#[derive(Debug, Clone)]
pub struct ConvertedPayload {
    pub height: u64,
    pub block: Block,
    pub tx_meta: Vec<BtcTxMeta>,
}

impl BlockPayload for ConvertedPayload {
    fn block_number(&self) -> u64 {
        self.height
    }
}

#[derive(Debug, Clone)]
pub struct HeaderModel {
    pub cid: String,
    pub mh_key: String,
    pub block_number: i64,
    pub block_hash: String,
    pub parent_hash: String,
    /// Nanoseconds, derived from the header's second-resolution field.
    pub timestamp: i64,
    pub bits: i64,
}

#[derive(Debug, Clone)]
pub struct TxModel {
    pub cid: String,
    pub mh_key: String,
    pub tx_hash: String,
    pub index: i64,
    pub segwit: bool,
    pub witness_hash: String,
    pub inputs: Vec<TxInputMeta>,
    pub outputs: Vec<TxOutputMeta>,
}

/// The CIDs produced by publishing one payload.
#[derive(Debug, Clone)]
pub struct CidManifest {
    pub header: HeaderModel,
    pub transactions: Vec<TxModel>,
}

impl BlockPayload for CidManifest {
    fn block_number(&self) -> u64 {
        self.header.block_number as u64
    }
}

/// The filtered payload shipped to a subscriber: consensus-serialized bytes
/// of the included objects, never decoded form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub block_number: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serialized_headers: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serialized_txs: Vec<Bytes>,
}

impl StreamResponse {
    pub fn has_content(&self) -> bool {
        !self.serialized_headers.is_empty() || !self.serialized_txs.is_empty()
    }
}

impl BlockPayload for StreamResponse {
    fn block_number(&self) -> u64 {
        self.block_number
    }
}

/// One block's worth of query results, grouped for fetching.
#[derive(Debug, Clone, Default)]
pub struct CidWrapper {
    pub block_number: i64,
    pub header: Option<HeaderModel>,
    pub transactions: Vec<TxModel>,
}
