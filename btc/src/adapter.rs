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
    converter,
    fetcher::BtcPayloadFetcher,
    filterer, ipld,
    models::{CidManifest, ConvertedPayload, RawBlockPayload, StreamResponse},
    settings::SubscriptionSettings,
    streamer::BtcHttpStreamer,
};

/// The Bitcoin chain leaf: polling HTTP streamer, consensus decode, IPLD
/// encoding, and subscription filtering.
#[derive(Default)]
pub struct BtcAdapter {
    streamer: Option<BtcHttpStreamer>,
    fetcher: Option<BtcPayloadFetcher>,
}

impl BtcAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streamer(mut self, streamer: BtcHttpStreamer) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_fetcher(mut self, fetcher: BtcPayloadFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }
}

#[async_trait]
impl ChainAdapter for BtcAdapter {
    type Raw = RawBlockPayload;
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
            .attach_printable("no bitcoind endpoint configured")?;
        streamer.stream(out, ct).await
    }

    async fn fetch_raw(&self, heights: &[u64]) -> Result<Vec<Self::Raw>> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| Report::new(WatcherError::Configuration))
            .attach_printable("no bitcoind endpoint configured")?;
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
