use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainwatch_common::{
    adapter::ChainAdapter,
    error::{Result, WatcherError},
    IpldNode,
};

use crate::{
    converter, filterer,
    fetcher::StateDiffFetcher,
    ipld,
    models::{CidManifest, ConvertedPayload, RawStateDiff, StreamResponse},
    settings::SubscriptionSettings,
    streamer::StateDiffStreamer,
};

/// The Ethereum chain leaf: statediff streaming and fetching, RLP decode,
/// IPLD encoding, and subscription filtering.
#[derive(Default)]
pub struct EthAdapter {
    streamer: Option<StateDiffStreamer>,
    fetcher: Option<StateDiffFetcher>,
}

impl EthAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streamer(mut self, streamer: StateDiffStreamer) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_fetcher(mut self, fetcher: StateDiffFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }
}

#[async_trait]
impl ChainAdapter for EthAdapter {
    type Raw = RawStateDiff;
    type Converted = ConvertedPayload;
    type Manifest = CidManifest;
    type Settings = SubscriptionSettings;
    type Response = StreamResponse;

    async fn stream_raw(
        &self,
        out: mpsc::Sender<Self::Raw>,
        ct: CancellationToken,
    ) -> Result<()> {
        let streamer = self
            .streamer
            .as_ref()
            .ok_or_else(|| Report::new(WatcherError::Configuration))
            .attach_printable("no websocket endpoint configured")?;
        streamer.stream(out, ct).await
    }

    async fn fetch_raw(&self, heights: &[u64]) -> Result<Vec<Self::Raw>> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| Report::new(WatcherError::Configuration))
            .attach_printable("no http endpoint configured")?;
        fetcher.fetch(heights).await
    }

    fn convert(&self, raw: Self::Raw) -> Result<Self::Converted> {
        converter::convert(raw)
    }

    fn encode(&self, payload: &Self::Converted) -> Result<(Vec<IpldNode>, Self::Manifest)> {
        ipld::encode(payload)
    }

    fn filter(
        &self,
        settings: &Self::Settings,
        payload: &Self::Converted,
    ) -> Result<Option<Self::Response>> {
        filterer::filter(settings, payload)
    }

    fn parse_settings(&self, params: &serde_json::Value) -> Result<Self::Settings> {
        serde_json::from_value(params.clone()).map_err(|err| {
            Report::new(WatcherError::BadSubscription).attach_printable(err.to_string())
        })
    }
}
