use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{keccak256, Address, B256};

use chainwatch_common::adapter::Settings;
use chainwatch_common::error::Result;

use crate::{
    models::{ConvertedPayload, StreamResponse},
    settings::{
        HeaderFilter, ReceiptFilter, StateFilter, StorageFilter, SubscriptionSettings, TxFilter,
    },
};

/// Evaluates a subscription predicate against a converted payload.
///
/// Pure and deterministic: the same inputs always produce the same response
/// bytes, so it can run in parallel across subscribers. Returns `None` when
/// the block is out of range or nothing matched.
pub fn filter(
    settings: &SubscriptionSettings,
    payload: &ConvertedPayload,
) -> Result<Option<StreamResponse>> {
    if !settings.range().contains(payload.header().number) {
        return Ok(None);
    }

    let mut response = StreamResponse {
        block_number: payload.header().number,
        ..Default::default()
    };
    filter_headers(&settings.header_filter, &mut response, payload);
    let tx_hashes = filter_transactions(&settings.tx_filter, &mut response, payload);
    let match_txs = if settings.receipt_filter.match_txs {
        tx_hashes
    } else {
        Vec::new()
    };
    filter_receipts(&settings.receipt_filter, &mut response, payload, &match_txs);
    filter_state(&settings.state_filter, &mut response, payload);
    filter_storage(&settings.storage_filter, &mut response, payload);

    Ok(response.has_content().then_some(response))
}

fn filter_headers(filter: &HeaderFilter, response: &mut StreamResponse, payload: &ConvertedPayload) {
    if filter.off {
        return;
    }
    response
        .headers_rlp
        .push(alloy_rlp::encode(payload.header()).into());
    if filter.uncles {
        for uncle in payload.uncles() {
            response.uncles_rlp.push(alloy_rlp::encode(uncle).into());
        }
    }
}

/// Emits matching transactions and returns the hash of every one emitted,
/// for the optional receipt join.
fn filter_transactions(
    filter: &TxFilter,
    response: &mut StreamResponse,
    payload: &ConvertedPayload,
) -> Vec<B256> {
    let mut hashes = Vec::with_capacity(payload.transactions().len());
    if filter.off {
        return hashes;
    }
    for (tx, meta) in payload.transactions().iter().zip(&payload.tx_meta) {
        if check_transaction_addrs(&filter.src, &filter.dst, &meta.src, meta.dst.as_ref()) {
            hashes.push(meta.tx_hash);
            response.transactions_rlp.push(tx.encoded_2718().into());
        }
    }
    hashes
}

/// True when either the src or the dst is one of the wanted addresses.
/// No wanted addresses at all means every transaction is a go.
fn check_transaction_addrs(
    wanted_src: &[Address],
    wanted_dst: &[Address],
    actual_src: &Address,
    actual_dst: Option<&Address>,
) -> bool {
    if wanted_src.is_empty() && wanted_dst.is_empty() {
        return true;
    }
    wanted_src.contains(actual_src) || actual_dst.is_some_and(|dst| wanted_dst.contains(dst))
}

fn filter_receipts(
    filter: &ReceiptFilter,
    response: &mut StreamResponse,
    payload: &ConvertedPayload,
    match_txs: &[B256],
) {
    if filter.off {
        return;
    }
    for (receipt, meta) in payload.receipts.iter().zip(&payload.receipt_meta) {
        if check_receipt(filter, &meta.topics, meta.contract.as_ref(), meta.tx_hash, match_txs) {
            response.receipts_rlp.push(receipt.encoded_2718().into());
        }
    }
}

fn check_receipt(
    filter: &ReceiptFilter,
    actual_topics: &[Vec<B256>; 4],
    actual_contract: Option<&Address>,
    tx_hash: B256,
    match_txs: &[B256],
) -> bool {
    // Not filtering on anything: all receipts are a go.
    if filter.topics.is_empty() && filter.contracts.is_empty() && match_txs.is_empty() {
        return true;
    }
    // Receipts of watched transactions are always kept.
    if match_txs.contains(&tx_hash) {
        return true;
    }
    // No wanted contracts: the topic filter alone decides.
    if filter.contracts.is_empty() {
        return topics_match(&filter.topics, actual_topics);
    }
    // Otherwise the receipt must belong to a wanted contract and match the
    // topic filter.
    actual_contract.is_some_and(|contract| filter.contracts.contains(contract))
        && topics_match(&filter.topics, actual_topics)
}

/// Four-slot topic rule: slot `i` matches iff the filter has no entries for
/// it or shares at least one topic with the receipt's slot-`i` topics. All
/// four slots must match.
fn topics_match(wanted: &[Vec<B256>], actual: &[Vec<B256>; 4]) -> bool {
    actual.iter().enumerate().all(|(slot, actual_topics)| {
        match wanted.get(slot) {
            Some(wanted_topics) if !wanted_topics.is_empty() => {
                wanted_topics.iter().any(|topic| actual_topics.contains(topic))
            }
            _ => true,
        }
    })
}

fn filter_state(filter: &StateFilter, response: &mut StreamResponse, payload: &ConvertedPayload) {
    if filter.off {
        return;
    }
    let key_filters: Vec<B256> = filter
        .addresses
        .iter()
        .map(|address| keccak256(address.as_slice()))
        .collect();
    for node in &payload.state_nodes {
        if check_node_keys(&key_filters, &node.state_key)
            && (node.kind.is_leaf() || filter.intermediate_nodes)
        {
            response
                .state_nodes_rlp
                .insert(node.state_key, node.value.clone().into());
        }
    }
}

fn filter_storage(filter: &StorageFilter, response: &mut StreamResponse, payload: &ConvertedPayload) {
    if filter.off {
        return;
    }
    let state_key_filters: Vec<B256> = filter
        .addresses
        .iter()
        .map(|address| keccak256(address.as_slice()))
        .collect();
    for node in &payload.storage_nodes {
        if check_node_keys(&state_key_filters, &node.state_key)
            && check_node_keys(&filter.storage_keys, &node.storage_key)
            && (node.kind.is_leaf() || filter.intermediate_nodes)
        {
            response
                .storage_nodes_rlp
                .entry(node.state_key)
                .or_default()
                .insert(node.storage_key, node.value.clone().into());
        }
    }
}

/// No wanted keys means all nodes are a go.
fn check_node_keys(wanted: &[B256], actual: &B256) -> bool {
    wanted.is_empty() || wanted.contains(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{converted_payload, payload_with_state, payload_with_uncle, C1, T0};

    fn everything() -> SubscriptionSettings {
        SubscriptionSettings::default()
    }

    #[test]
    fn out_of_range_blocks_fail_closed() {
        let payload = converted_payload(1, 1);
        let settings = SubscriptionSettings {
            start: 2_000_000,
            ..Default::default()
        };
        assert!(filter(&settings, &payload).unwrap().is_none());
    }

    #[test]
    fn default_settings_emit_everything() {
        let payload = converted_payload(3, 3);
        let response = filter(&everything(), &payload).unwrap().unwrap();
        assert_eq!(response.block_number, 1_000_000);
        assert_eq!(response.headers_rlp.len(), 1);
        assert_eq!(response.transactions_rlp.len(), 3);
        assert_eq!(response.receipts_rlp.len(), 3);
    }

    #[test]
    fn header_filter_off_suppresses_header() {
        let payload = converted_payload(1, 1);
        let settings = SubscriptionSettings {
            header_filter: crate::settings::HeaderFilter {
                off: true,
                uncles: false,
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert!(response.headers_rlp.is_empty());
        assert_eq!(response.transactions_rlp.len(), 1);
    }

    #[test]
    fn uncles_are_emitted_on_request() {
        let payload = payload_with_uncle();
        let mut settings = everything();
        assert!(filter(&settings, &payload).unwrap().unwrap().uncles_rlp.is_empty());
        settings.header_filter.uncles = true;
        assert_eq!(filter(&settings, &payload).unwrap().unwrap().uncles_rlp.len(), 1);
    }

    #[test]
    fn src_filter_selects_matching_transactions() {
        let payload = converted_payload(3, 3);
        let settings = SubscriptionSettings {
            tx_filter: crate::settings::TxFilter {
                off: false,
                src: vec![payload.tx_meta[1].src],
                dst: vec![],
            },
            receipt_filter: crate::settings::ReceiptFilter {
                off: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.transactions_rlp.len(), 1);
    }

    #[test]
    fn topic0_filter_returns_exactly_the_matching_receipt() {
        let payload = converted_payload(3, 3);
        let settings = SubscriptionSettings {
            header_filter: crate::settings::HeaderFilter {
                off: true,
                uncles: false,
            },
            tx_filter: crate::settings::TxFilter {
                off: true,
                ..Default::default()
            },
            receipt_filter: crate::settings::ReceiptFilter {
                off: false,
                topics: vec![vec![T0]],
                contracts: vec![],
                match_txs: false,
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.receipts_rlp.len(), 1);
        assert_eq!(
            response.receipts_rlp[0],
            alloy_primitives::Bytes::from(payload.receipts[0].encoded_2718())
        );
    }

    #[test]
    fn contract_filter_selects_the_deploy_receipt() {
        let payload = converted_payload(3, 3);
        let settings = SubscriptionSettings {
            receipt_filter: crate::settings::ReceiptFilter {
                off: false,
                topics: vec![],
                contracts: vec![C1],
                match_txs: false,
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.receipts_rlp.len(), 1);
        assert_eq!(
            response.receipts_rlp[0],
            alloy_primitives::Bytes::from(payload.receipts[1].encoded_2718())
        );
    }

    #[test]
    fn match_txs_joins_receipts_to_watched_transactions() {
        let payload = converted_payload(3, 3);
        let unmatched_topic = B256::repeat_byte(0xFF);
        let settings = SubscriptionSettings {
            tx_filter: crate::settings::TxFilter {
                off: false,
                src: vec![payload.tx_meta[2].src],
                dst: vec![],
            },
            receipt_filter: crate::settings::ReceiptFilter {
                off: false,
                topics: vec![vec![unmatched_topic]],
                contracts: vec![],
                match_txs: true,
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        // The topic filter matches nothing, but the watched tx's receipt
        // rides along.
        assert_eq!(response.receipts_rlp.len(), 1);
        assert_eq!(
            response.receipts_rlp[0],
            alloy_primitives::Bytes::from(payload.receipts[2].encoded_2718())
        );
    }

    #[test]
    fn state_filter_keys_on_keccak_of_address() {
        let payload = payload_with_state();
        let settings = SubscriptionSettings {
            state_filter: crate::settings::StateFilter {
                off: false,
                addresses: vec![crate::test_utils::STATE_ADDRESS],
                intermediate_nodes: false,
            },
            ..Default::default()
        };
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.state_nodes_rlp.len(), 1);
        let expected_key = keccak256(crate::test_utils::STATE_ADDRESS.as_slice());
        assert!(response.state_nodes_rlp.contains_key(&expected_key));
    }

    #[test]
    fn intermediate_state_nodes_are_excluded_by_default() {
        let payload = payload_with_state();
        let mut settings = everything();
        let response = filter(&settings, &payload).unwrap().unwrap();
        // Only the leaf node; the branch node is intermediate.
        assert_eq!(response.state_nodes_rlp.len(), 1);

        settings.state_filter.intermediate_nodes = true;
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert_eq!(response.state_nodes_rlp.len(), 2);
    }

    #[test]
    fn storage_filter_applies_a_second_key_layer() {
        let payload = payload_with_state();
        let storage_key = payload.storage_nodes[0].storage_key;
        let mut settings = everything();
        settings.storage_filter.storage_keys = vec![storage_key];
        let response = filter(&settings, &payload).unwrap().unwrap();
        let state_key = payload.storage_nodes[0].state_key;
        assert_eq!(response.storage_nodes_rlp[&state_key].len(), 1);

        settings.storage_filter.storage_keys = vec![B256::repeat_byte(0xFF)];
        let response = filter(&settings, &payload).unwrap().unwrap();
        assert!(response.storage_nodes_rlp.is_empty());
    }

    #[test]
    fn filter_is_idempotent() {
        let payload = converted_payload(3, 3);
        let settings = everything();
        let first = filter(&settings, &payload).unwrap();
        let second = filter(&settings, &payload).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn widening_a_filter_never_drops_objects() {
        let payload = converted_payload(3, 3);
        let narrow = SubscriptionSettings {
            tx_filter: crate::settings::TxFilter {
                off: false,
                src: vec![payload.tx_meta[0].src],
                dst: vec![],
            },
            ..Default::default()
        };
        let narrow_response = filter(&narrow, &payload).unwrap().unwrap();

        // Emptying the src list widens the filter to all transactions.
        let wide = SubscriptionSettings::default();
        let wide_response = filter(&wide, &payload).unwrap().unwrap();
        for tx in &narrow_response.transactions_rlp {
            assert!(wide_response.transactions_rlp.contains(tx));
        }
        assert!(wide_response.transactions_rlp.len() >= narrow_response.transactions_rlp.len());
    }

    #[test]
    fn everything_off_yields_no_response() {
        let payload = converted_payload(2, 2);
        let settings = SubscriptionSettings {
            header_filter: crate::settings::HeaderFilter {
                off: true,
                uncles: false,
            },
            tx_filter: crate::settings::TxFilter {
                off: true,
                ..Default::default()
            },
            receipt_filter: crate::settings::ReceiptFilter {
                off: true,
                ..Default::default()
            },
            state_filter: crate::settings::StateFilter {
                off: true,
                ..Default::default()
            },
            storage_filter: crate::settings::StorageFilter {
                off: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(filter(&settings, &payload).unwrap().is_none());
    }
}
