use std::{fmt, str::FromStr};

use cid::Cid;
use error_stack::{Report, ResultExt};
use multihash::Multihash;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Which chain a payload belongs to. Every component dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Ethereum,
    Bitcoin,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainType::Ethereum => f.write_str("ethereum"),
            ChainType::Bitcoin => f.write_str("bitcoin"),
        }
    }
}

impl FromStr for ChainType {
    type Err = Report<WatcherError>;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ethereum" | "eth" => Ok(ChainType::Ethereum),
            "bitcoin" | "btc" => Ok(ChainType::Bitcoin),
            other => Err(Report::new(WatcherError::Configuration)
                .attach_printable(format!("unknown chain type: {other}"))),
        }
    }
}

/// Identity of the upstream chain node. Index rows are scoped to it so
/// multiple watcher deployments can share one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub client_name: String,
    pub genesis_block: String,
    pub network_id: String,
}

/// One chain object in content-addressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpldNode {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl IpldNode {
    /// Builds a node from canonical bytes and their digest. The CID is
    /// derivable from the bytes, the codec, and the hash function alone.
    pub fn from_digest(codec: u64, mh_code: u64, digest: &[u8], data: Vec<u8>) -> Result<Self> {
        let hash = Multihash::<64>::wrap(mh_code, digest)
            .change_context(WatcherError::Fatal)
            .attach_printable("digest does not fit in a multihash")?;
        Ok(Self {
            cid: Cid::new_v1(codec, hash),
            data,
        })
    }

    /// Key of this node's bytes in a direct-mode `blocks (key, data)` table.
    /// Derived from the multihash so index rows can join the bytes table.
    pub fn store_key(&self) -> String {
        multihash_key(&self.cid)
    }
}

/// Multihash-derived key for a `blocks (key, data)` row.
pub fn multihash_key(cid: &Cid) -> String {
    format!("/blocks/{}", hex::encode(cid.hash().to_bytes()))
}

/// Inclusive block-height interval with no rows in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

/// Subscription block-height range. `end <= 0` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockRange {
    pub start: i64,
    pub end: i64,
}

impl BlockRange {
    pub fn contains(&self, block_number: u64) -> bool {
        let actual = block_number as i64;
        (self.end <= 0 || self.end >= actual) && self.start <= actual
    }

    pub fn is_open_ended(&self) -> bool {
        self.end <= 0
    }
}

impl Default for BlockRange {
    fn default() -> Self {
        Self { start: 0, end: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_type_round_trips_through_str() {
        for (s, chain) in [
            ("ethereum", ChainType::Ethereum),
            ("eth", ChainType::Ethereum),
            ("Bitcoin", ChainType::Bitcoin),
            ("btc", ChainType::Bitcoin),
        ] {
            assert_eq!(s.parse::<ChainType>().unwrap(), chain);
        }
        assert!("dogecoin".parse::<ChainType>().is_err());
    }

    #[test]
    fn open_ended_range_accepts_everything_past_start() {
        let range = BlockRange { start: 10, end: 0 };
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(1_000_000));
    }

    #[test]
    fn closed_range_is_inclusive() {
        let range = BlockRange { start: 5, end: 7 };
        assert!(!range.contains(4));
        assert!(range.contains(5));
        assert!(range.contains(7));
        assert!(!range.contains(8));
    }

    #[test]
    fn ipld_node_cid_is_derived_from_digest() {
        let digest = [7u8; 32];
        let node = IpldNode::from_digest(0x90, 0x1b, &digest, vec![1, 2, 3]).unwrap();
        assert_eq!(node.cid.codec(), 0x90);
        assert_eq!(node.cid.hash().code(), 0x1b);
        assert_eq!(node.cid.hash().digest(), digest);
        assert!(node.store_key().starts_with("/blocks/"));
    }
}
