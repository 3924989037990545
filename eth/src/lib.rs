pub mod adapter;
pub mod converter;
pub mod fetcher;
pub mod filterer;
pub mod indexer;
pub mod ipld;
pub mod ipld_fetcher;
pub mod models;
pub mod retriever;
pub mod settings;
pub mod streamer;
#[cfg(test)]
mod test_utils;

pub use adapter::EthAdapter;
pub use indexer::EthCidIndexer;
pub use ipld_fetcher::EthIpldFetcher;
pub use retriever::EthCidRetriever;
