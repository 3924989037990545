use alloy_primitives::{Address, B256};
use chainwatch_common::{adapter::Settings, BlockRange};
use serde::{Deserialize, Serialize};

/// The predicate an Ethereum subscriber submits.
///
/// Filters default to on-and-match-everything; a subscriber switches a
/// section off explicitly. Empty address/topic lists mean "all".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriptionSettings {
    pub start: i64,
    pub end: i64,
    pub header_filter: HeaderFilter,
    pub tx_filter: TxFilter,
    pub receipt_filter: ReceiptFilter,
    pub state_filter: StateFilter,
    pub storage_filter: StorageFilter,
}

impl Settings for SubscriptionSettings {
    fn range(&self) -> BlockRange {
        BlockRange {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderFilter {
    pub off: bool,
    pub uncles: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TxFilter {
    pub off: bool,
    pub src: Vec<Address>,
    pub dst: Vec<Address>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiptFilter {
    pub off: bool,
    /// Up to four topic slots; a missing or empty slot matches anything.
    pub topics: Vec<Vec<B256>>,
    pub contracts: Vec<Address>,
    /// Also keep receipts whose transaction passed the tx filter.
    pub match_txs: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateFilter {
    pub off: bool,
    pub addresses: Vec<Address>,
    pub intermediate_nodes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageFilter {
    pub off: bool,
    pub addresses: Vec<Address>,
    pub storage_keys: Vec<B256>,
    pub intermediate_nodes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_params_mean_watch_everything_live() {
        let settings: SubscriptionSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.range().is_open_ended());
        assert!(!settings.header_filter.off);
        assert!(!settings.tx_filter.off);
        assert!(settings.tx_filter.src.is_empty());
    }

    #[test]
    fn params_round_trip() {
        let json = serde_json::json!({
            "start": 100,
            "end": 200,
            "headerFilter": { "off": true },
            "txFilter": { "src": ["0x00000000000000000000000000000000000000aa"] },
            "receiptFilter": {
                "topics": [["0x1111111111111111111111111111111111111111111111111111111111111111"]],
                "matchTxs": true
            }
        });
        let settings: SubscriptionSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.range(), BlockRange { start: 100, end: 200 });
        assert!(settings.header_filter.off);
        assert_eq!(settings.tx_filter.src.len(), 1);
        assert_eq!(settings.receipt_filter.topics.len(), 1);
        assert!(settings.receipt_filter.match_txs);
    }
}
