use chainwatch_common::{adapter::Settings, BlockRange};
use serde::{Deserialize, Serialize};

use crate::models::ScriptClass;

/// The predicate a Bitcoin subscriber submits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriptionSettings {
    pub start: i64,
    pub end: i64,
    pub header_filter: HeaderFilter,
    pub tx_filter: TxFilter,
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
}

/// Empty lists mean "all"; a transaction matches when any list hits it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TxFilter {
    pub off: bool,
    pub indexes: Vec<i64>,
    pub pk_script_classes: Vec<ScriptClass>,
    pub addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_with_defaults() {
        let settings: SubscriptionSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.range().is_open_ended());
        assert!(!settings.tx_filter.off);

        let json = serde_json::json!({
            "start": 5,
            "txFilter": { "indexes": [1], "pkScriptClasses": ["pubkey-hash"] }
        });
        let settings: SubscriptionSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.tx_filter.indexes, vec![1]);
        assert_eq!(settings.tx_filter.pk_script_classes, vec![ScriptClass::PubkeyHash]);
    }
}
