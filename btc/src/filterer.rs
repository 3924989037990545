use chainwatch_common::adapter::Settings;
use chainwatch_common::error::Result;

use crate::{
    models::{BtcTxMeta, ConvertedPayload, StreamResponse},
    settings::{SubscriptionSettings, TxFilter},
};

/// Evaluates a subscription predicate against a converted payload. Pure and
/// deterministic; `None` when the block is out of range or nothing matched.
pub fn filter(
    settings: &SubscriptionSettings,
    payload: &ConvertedPayload,
) -> Result<Option<StreamResponse>> {
    if !settings.range().contains(payload.height) {
        return Ok(None);
    }

    let mut response = StreamResponse {
        block_number: payload.height,
        ..Default::default()
    };
    if !settings.header_filter.off {
        response
            .serialized_headers
            .push(bitcoin::consensus::serialize(&payload.block.header).into());
    }
    if !settings.tx_filter.off {
        for (tx, meta) in payload.block.txdata.iter().zip(&payload.tx_meta) {
            if check_transaction(&settings.tx_filter, meta) {
                response
                    .serialized_txs
                    .push(bitcoin::consensus::serialize(tx).into());
            }
        }
    }

    Ok(response.has_content().then_some(response))
}

/// A transaction matches when any of the filter's lists hits it; no lists
/// at all means every transaction is a go.
fn check_transaction(filter: &TxFilter, meta: &BtcTxMeta) -> bool {
    if filter.indexes.is_empty()
        && filter.pk_script_classes.is_empty()
        && filter.addresses.is_empty()
    {
        return true;
    }
    if filter.indexes.contains(&(meta.index as i64)) {
        return true;
    }
    for output in &meta.outputs {
        if filter.pk_script_classes.contains(&output.script_class) {
            return true;
        }
        if output
            .addresses
            .iter()
            .any(|address| filter.addresses.contains(address))
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{converter, models::RawBlockPayload, settings::HeaderFilter, test_utils::two_tx_block};

    fn payload() -> ConvertedPayload {
        converter::convert(RawBlockPayload {
            height: 700_000,
            block: bitcoin::consensus::serialize(&two_tx_block()),
        })
        .unwrap()
    }

    #[test]
    fn default_settings_emit_header_and_all_txs() {
        let payload = payload();
        let response = filter(&SubscriptionSettings::default(), &payload)
            .unwrap()
            .unwrap();
        assert_eq!(response.serialized_headers.len(), 1);
        assert_eq!(response.serialized_txs.len(), 2);
    }

    #[test]
    fn index_filter_selects_only_the_second_tx() {
        let payload = payload();
        let settings = SubscriptionSettings {
            header_filter: HeaderFilter { off: true },
            tx_filter: TxFilter {
                off: false,
                indexes: vec![1],
                pk_script_classes: vec![],
                addresses: vec![],
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.serialized_txs.len(), 1);
        assert_eq!(
            response.serialized_txs[0],
            alloy_primitives::Bytes::from(bitcoin::consensus::serialize(&payload.block.txdata[1]))
        );
    }

    #[test]
    fn address_filter_matches_p2pkh_outputs() {
        let payload = payload();
        let address = payload.tx_meta[1].outputs[0].addresses[0].clone();
        let settings = SubscriptionSettings {
            header_filter: HeaderFilter { off: true },
            tx_filter: TxFilter {
                off: false,
                indexes: vec![],
                pk_script_classes: vec![],
                addresses: vec![address],
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert!(!response.serialized_txs.is_empty());
    }

    #[test]
    fn out_of_range_blocks_fail_closed() {
        let payload = payload();
        let settings = SubscriptionSettings {
            start: 800_000,
            ..Default::default()
        };
        assert!(filter(&settings, &payload).unwrap().is_none());
    }

    #[test]
    fn everything_off_yields_no_response() {
        let payload = payload();
        let settings = SubscriptionSettings {
            header_filter: HeaderFilter { off: true },
            tx_filter: TxFilter {
                off: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(filter(&settings, &payload).unwrap().is_none());
    }
}
