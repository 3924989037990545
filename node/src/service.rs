use std::{sync::Arc, time::Duration};

use clap::Args;
use error_stack::{Report, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chainwatch_btc::{
    fetcher::BtcPayloadFetcher, streamer::BtcHttpStreamer, BtcAdapter, BtcCidIndexer,
    BtcCidRetriever, BtcIpldFetcher, BtcRpcClient,
};
use chainwatch_common::{
    adapter::{ChainAdapter, CidIndexer, CidRetriever, HistoricalSource},
    backfill::BackFiller,
    blockstore::{BlockStore, MemoryBlockStore, PostgresBlockStore, RemoteBlockStore, StoreMode},
    cli::{BackFillArgs, DatabaseArgs, ServerArgs, UpstreamArgs, WatcherArgs},
    db,
    error::{Result, WatcherError},
    hub::SubscriptionHub,
    pipeline::Pipeline,
    publisher::Publisher,
    ChainType,
};
use chainwatch_eth::{
    fetcher::StateDiffFetcher, streamer::StateDiffStreamer, EthAdapter, EthCidIndexer,
    EthCidRetriever, EthIpldFetcher,
};

use crate::server::{self, WatchRpc};

const FORWARD_CHAN_CAPACITY: usize = 1024;
const BTC_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Args, Debug, Clone)]
pub struct WatchCmd {
    #[clap(flatten)]
    pub watcher: WatcherArgs,
    #[clap(flatten)]
    pub database: DatabaseArgs,
    #[clap(flatten)]
    pub server: ServerArgs,
    #[clap(flatten)]
    pub backfill: BackFillArgs,
    #[clap(flatten)]
    pub upstream: UpstreamArgs,
}

/// Resolves the chain adapter and its database components, then runs the
/// enabled processes until interrupted.
pub async fn run(args: WatchCmd) -> Result<()> {
    let chain: ChainType = args.watcher.chain.parse()?;
    let mode: StoreMode = args.watcher.store_mode.parse()?;
    info!(%chain, ?mode, sync = args.watcher.sync, serve = args.watcher.serve,
        back_fill = args.watcher.back_fill, "starting watcher");

    let query_client = Arc::new(db::connect(&args.database.database_url).await?);
    let node_db_id = db::register_node(&query_client, &args.watcher.node.to_node_info()).await?;
    let store = build_store(&args, mode, query_client.clone())?;

    match chain {
        ChainType::Ethereum => {
            let mut adapter = EthAdapter::new();
            if let Some(ws_url) = &args.upstream.ws_url {
                adapter = adapter.with_streamer(StateDiffStreamer::new(ws_url.clone()));
            }
            if let Some(http_url) = &args.upstream.http_url {
                let timeout = Duration::from_secs(args.upstream.upstream_timeout);
                adapter = adapter.with_fetcher(StateDiffFetcher::new(http_url, timeout)?);
            }
            let indexer_client = db::connect(&args.database.database_url).await?;
            let indexer = Arc::new(EthCidIndexer::new(indexer_client, node_db_id).await?);
            let retriever = Arc::new(EthCidRetriever::new(query_client, node_db_id));
            let historical = Arc::new(EthIpldFetcher::new(retriever.clone(), store.clone()));
            run_watcher(Arc::new(adapter), indexer, retriever, historical, store, mode, &args).await
        }
        ChainType::Bitcoin => {
            let mut adapter = BtcAdapter::new();
            let timeout = Duration::from_secs(args.upstream.upstream_timeout);
            if let Some(http_url) = &args.upstream.http_url {
                let rpc = BtcRpcClient::new(
                    http_url.clone(),
                    args.upstream.upstream_user.clone(),
                    args.upstream.upstream_password.clone(),
                    timeout,
                )?;
                // Bitcoin core only speaks HTTP POST; live data is a poll of
                // the same endpoint.
                adapter = adapter
                    .with_streamer(BtcHttpStreamer::new(rpc.clone(), BTC_POLL_INTERVAL))
                    .with_fetcher(BtcPayloadFetcher::new(rpc));
            }
            let indexer_client = db::connect(&args.database.database_url).await?;
            let indexer = Arc::new(BtcCidIndexer::new(indexer_client, node_db_id).await?);
            let retriever = Arc::new(BtcCidRetriever::new(query_client, node_db_id));
            let historical = Arc::new(BtcIpldFetcher::new(retriever.clone(), store.clone()));
            run_watcher(Arc::new(adapter), indexer, retriever, historical, store, mode, &args).await
        }
    }
}

fn build_store(
    args: &WatchCmd,
    mode: StoreMode,
    client: Arc<tokio_postgres::Client>,
) -> Result<Arc<dyn BlockStore>> {
    match mode {
        StoreMode::Memory => {
            warn!("memory store mode holds ipld bytes in-process only");
            Ok(Arc::new(MemoryBlockStore::new()))
        }
        StoreMode::Remote => {
            let url = args.watcher.remote_store_url.as_ref().ok_or_else(|| {
                Report::new(WatcherError::Configuration)
                    .attach_printable("remote store mode requires --remote-store-url")
            })?;
            Ok(Arc::new(RemoteBlockStore::new(url.clone())))
        }
        StoreMode::Direct => Ok(Arc::new(PostgresBlockStore::new(client))),
    }
}

async fn run_watcher<A, I, R, H>(
    adapter: Arc<A>,
    indexer: Arc<I>,
    retriever: Arc<R>,
    historical: Arc<H>,
    store: Arc<dyn BlockStore>,
    mode: StoreMode,
    args: &WatchCmd,
) -> Result<()>
where
    A: ChainAdapter,
    I: CidIndexer<A>,
    R: CidRetriever,
    H: HistoricalSource<A>,
{
    let ct = CancellationToken::new();
    let mut handles = Vec::new();
    let publisher = Arc::new(Publisher::new(adapter.clone(), store, indexer, mode));

    // The forward channel is the tee point between the pipeline, the
    // backfiller, and the subscription hub. The sender stays alive for the
    // whole run so a serve-only deployment keeps its hub open.
    let (forward_tx, forward_rx) = mpsc::channel(FORWARD_CHAN_CAPACITY);

    let server_handle = if args.watcher.serve {
        let hub = SubscriptionHub::new(
            adapter.clone(),
            historical,
            args.server.to_hub_options(),
        );
        let (hub_handle, hub_task) = hub.start(forward_rx, ct.clone());
        handles.push(hub_task);
        let rpc = WatchRpc::new(adapter.clone(), hub_handle);
        Some(server::start(&args.server.server_address, rpc).await?)
    } else {
        // Nothing is subscribed; drain the tee so the pipeline never blocks.
        handles.push(tokio::spawn(async move {
            let mut forward_rx = forward_rx;
            while forward_rx.recv().await.is_some() {}
        }));
        None
    };

    if args.watcher.sync {
        let pipeline = Pipeline::new(
            adapter.clone(),
            publisher.clone(),
            args.watcher.pipeline.to_options(),
        );
        handles.extend(pipeline.start(forward_tx.clone(), ct.clone()));
    }

    if args.watcher.back_fill {
        let backfiller = BackFiller::new(
            adapter.clone(),
            publisher.clone(),
            retriever,
            args.backfill.to_options(),
        );
        handles.push(backfiller.start(forward_tx.clone(), ct.clone()));
    }

    tokio::signal::ctrl_c()
        .await
        .change_context(WatcherError::Fatal)
        .attach_printable("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining");

    ct.cancel();
    if let Some(server_handle) = server_handle {
        let _ = server_handle.stop();
        server_handle.stopped().await;
    }
    drop(forward_tx);
    for handle in handles {
        let _ = handle.await;
    }
    info!("watcher stopped");
    Ok(())
}
