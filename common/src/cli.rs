use std::time::Duration;

use clap::Args;

use crate::{backfill::BackFillOptions, core::NodeInfo, hub::HubOptions, pipeline::PipelineOptions};

#[derive(Args, Debug, Clone)]
pub struct WatcherArgs {
    /// Which chain to watch: ethereum or bitcoin.
    #[arg(long, env)]
    pub chain: String,
    /// Stream live chain data into the store and index.
    #[arg(long, env, default_value = "false")]
    pub sync: bool,
    /// Expose the subscription RPC server.
    #[arg(long, env, default_value = "false")]
    pub serve: bool,
    /// Periodically scan for and fill index gaps.
    #[arg(long, env, default_value = "false")]
    pub back_fill: bool,
    /// Where IPLD bytes live: memory, remote, or direct.
    #[arg(long, env, default_value = "direct")]
    pub store_mode: String,
    /// Base URL of the remote block store (remote mode only).
    #[arg(long, env)]
    pub remote_store_url: Option<String>,
    #[clap(flatten)]
    pub pipeline: PipelineArgs,
    #[clap(flatten)]
    pub node: NodeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Workers decoding raw payloads.
    #[arg(long, env, default_value = "1")]
    pub convert_workers: usize,
    /// Workers publishing and indexing converted payloads.
    #[arg(long, env, default_value = "4")]
    pub publish_workers: usize,
    /// Raw payload channel capacity.
    #[arg(long, env, default_value = "1024")]
    pub raw_capacity: usize,
    /// Converted payload channel capacity.
    #[arg(long, env, default_value = "256")]
    pub converted_capacity: usize,
}

impl PipelineArgs {
    pub fn to_options(&self) -> PipelineOptions {
        PipelineOptions {
            raw_capacity: self.raw_capacity,
            converted_capacity: self.converted_capacity,
            convert_workers: self.convert_workers,
            publish_workers: self.publish_workers,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Subscription server listen address.
    #[arg(long, env, default_value = "127.0.0.1:8546")]
    pub server_address: String,
    /// Per-subscriber response channel capacity.
    #[arg(long, env, default_value = "128")]
    pub subscriber_capacity: usize,
    /// Seconds a full subscriber channel may stall before eviction.
    #[arg(long, env, default_value = "15")]
    pub slow_consumer_timeout: u64,
}

impl ServerArgs {
    pub fn to_hub_options(&self) -> HubOptions {
        HubOptions {
            subscriber_capacity: self.subscriber_capacity,
            slow_consumer_timeout: Duration::from_secs(self.slow_consumer_timeout),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BackFillArgs {
    /// Seconds between gap scans.
    #[arg(long, env, default_value = "30")]
    pub frequency: u64,
    /// Heights per historical fetch batch.
    #[arg(long, env, default_value = "100")]
    pub batch_size: u64,
    /// Concurrent fetch batches.
    #[arg(long, env, default_value = "4")]
    pub backfill_workers: usize,
    /// Re-fetch heights validated fewer times than this.
    #[arg(long, env, default_value = "1")]
    pub validation_level: i32,
}

impl BackFillArgs {
    pub fn to_options(&self) -> BackFillOptions {
        BackFillOptions {
            frequency: Duration::from_secs(self.frequency.max(1)),
            batch_size: self.batch_size,
            workers: self.backfill_workers,
            validation_level: self.validation_level,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string for the index (and direct-mode bytes).
    #[arg(long, env, default_value = "host=localhost user=postgres dbname=chainwatch")]
    pub database_url: String,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Identity of the upstream chain node.
    #[arg(long, env, default_value = "")]
    pub node_id: String,
    /// Client name of the upstream chain node.
    #[arg(long, env, default_value = "")]
    pub client_name: String,
    /// Genesis block hash of the watched network.
    #[arg(long, env, default_value = "")]
    pub genesis_block: String,
    /// Network id of the watched network.
    #[arg(long, env, default_value = "")]
    pub network_id: String,
}

impl NodeArgs {
    pub fn to_node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            client_name: self.client_name.clone(),
            genesis_block: self.genesis_block.clone(),
            network_id: self.network_id.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct UpstreamArgs {
    /// WebSocket endpoint for live streaming.
    #[arg(long, env)]
    pub ws_url: Option<String>,
    /// HTTP endpoint for historical fetch.
    #[arg(long, env)]
    pub http_url: Option<String>,
    /// Upstream fetch timeout, in seconds.
    #[arg(long, env, default_value = "30")]
    pub upstream_timeout: u64,
    /// Upstream RPC username (bitcoin only).
    #[arg(long, env)]
    pub upstream_user: Option<String>,
    /// Upstream RPC password (bitcoin only).
    #[arg(long, env)]
    pub upstream_password: Option<String>,
}
