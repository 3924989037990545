pub mod adapter;
pub mod converter;
pub mod fetcher;
pub mod filterer;
pub mod indexer;
pub mod ipld;
pub mod ipld_fetcher;
pub mod models;
pub mod retriever;
pub mod rpc;
pub mod settings;
pub mod streamer;
#[cfg(test)]
mod test_utils;

pub use adapter::BtcAdapter;
pub use indexer::BtcCidIndexer;
pub use ipld_fetcher::BtcIpldFetcher;
pub use retriever::BtcCidRetriever;
pub use rpc::BtcRpcClient;
