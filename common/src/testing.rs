//! In-process fakes for exercising the pipeline, hub, and backfiller
//! without a chain or a database.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{
        BlockPayload, ChainAdapter, CidIndexer, HistoricalSource, PartialResponses,
        Settings as SettingsTrait,
    },
    core::{BlockRange, IpldNode},
    error::{Result, WatcherError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRaw {
    pub number: u64,
}

impl MockRaw {
    pub fn new(number: u64) -> Self {
        Self { number }
    }
}

impl BlockPayload for MockRaw {
    fn block_number(&self) -> u64 {
        self.number
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConverted {
    pub number: u64,
}

impl BlockPayload for MockConverted {
    fn block_number(&self) -> u64 {
        self.number
    }
}

#[derive(Debug, Clone)]
pub struct MockManifest {
    pub number: u64,
}

impl BlockPayload for MockManifest {
    fn block_number(&self) -> u64 {
        self.number
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSettings {
    pub range: BlockRange,
    pub only_even: bool,
}

impl SettingsTrait for MockSettings {
    fn range(&self) -> BlockRange {
        self.range
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MockResponse {
    pub number: u64,
}

impl BlockPayload for MockResponse {
    fn block_number(&self) -> u64 {
        self.number
    }
}

fn matches(settings: &MockSettings, number: u64) -> bool {
    settings.range.contains(number) && (!settings.only_even || number % 2 == 0)
}

#[derive(Clone, Default)]
pub struct MockChain {
    raw: Vec<MockRaw>,
    fail_convert: HashSet<u64>,
    fail_encode: HashSet<u64>,
    missing_upstream: HashSet<u64>,
    stream_failures: Arc<Mutex<u32>>,
}

impl MockChain {
    pub fn with_raw(raw: Vec<MockRaw>) -> Self {
        Self {
            raw,
            ..Default::default()
        }
    }

    pub fn with_blocks(range: std::ops::RangeInclusive<u64>) -> Self {
        Self::with_raw(range.map(MockRaw::new).collect())
    }

    pub fn fail_convert(&mut self, number: u64) {
        self.fail_convert.insert(number);
    }

    pub fn fail_encode(&mut self, number: u64) {
        self.fail_encode.insert(number);
    }

    pub fn missing_upstream(&mut self, number: u64) {
        self.missing_upstream.insert(number);
    }

    /// Makes the next `count` stream attempts fail before any payload is
    /// delivered.
    pub fn fail_streams(&mut self, count: u32) {
        *self.stream_failures.lock().unwrap() = count;
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    type Raw = MockRaw;
    type Converted = MockConverted;
    type Manifest = MockManifest;
    type Settings = MockSettings;
    type Response = MockResponse;

    async fn stream_raw(
        &self,
        out: mpsc::Sender<Self::Raw>,
        ct: CancellationToken,
    ) -> Result<()> {
        {
            let mut failures = self.stream_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Report::new(WatcherError::UpstreamUnavailable)
                    .attach_printable("injected stream failure"));
            }
        }
        for raw in &self.raw {
            if out.send(raw.clone()).await.is_err() {
                return Ok(());
            }
        }
        ct.cancelled().await;
        Ok(())
    }

    async fn fetch_raw(&self, heights: &[u64]) -> Result<Vec<Self::Raw>> {
        let missing: Vec<u64> = heights
            .iter()
            .copied()
            .filter(|h| self.missing_upstream.contains(h))
            .collect();
        if !missing.is_empty() {
            return Err(Report::new(WatcherError::PartialFetch)
                .attach_printable(format!("missing heights {missing:?}")));
        }
        Ok(heights.iter().copied().map(MockRaw::new).collect())
    }

    fn convert(&self, raw: Self::Raw) -> Result<Self::Converted> {
        if self.fail_convert.contains(&raw.number) {
            return Err(Report::new(WatcherError::MalformedPayload)
                .attach_printable(format!("block {}", raw.number)));
        }
        Ok(MockConverted { number: raw.number })
    }

    fn encode(&self, payload: &Self::Converted) -> Result<(Vec<IpldNode>, Self::Manifest)> {
        if self.fail_encode.contains(&payload.number) {
            return Err(Report::new(WatcherError::RootMismatch)
                .attach_printable(format!("block {}", payload.number)));
        }
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&payload.number.to_be_bytes());
        let node = IpldNode::from_digest(0x90, 0x1b, &digest, digest[..8].to_vec())?;
        Ok((
            vec![node],
            MockManifest {
                number: payload.number,
            },
        ))
    }

    fn filter(
        &self,
        settings: &Self::Settings,
        payload: &Self::Converted,
    ) -> Result<Option<Self::Response>> {
        Ok(matches(settings, payload.number).then_some(MockResponse {
            number: payload.number,
        }))
    }

    fn parse_settings(&self, params: &serde_json::Value) -> Result<Self::Settings> {
        serde_json::from_value(params.clone()).map_err(|err| {
            Report::new(WatcherError::BadSubscription).attach_printable(err.to_string())
        })
    }
}

#[derive(Default)]
pub struct MockIndexer {
    indexed: Mutex<Vec<u64>>,
    fail: Mutex<HashSet<u64>>,
}

impl MockIndexer {
    pub fn fail_for(&self, number: u64) {
        self.fail.lock().unwrap().insert(number);
    }

    pub fn indexed(&self) -> Vec<u64> {
        self.indexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CidIndexer<MockChain> for MockIndexer {
    async fn index(&self, manifest: &MockManifest, _nodes: &[IpldNode]) -> Result<()> {
        if self.fail.lock().unwrap().contains(&manifest.number) {
            return Err(Report::new(WatcherError::IndexFailed)
                .attach_printable(format!("block {}", manifest.number)));
        }
        self.indexed.lock().unwrap().push(manifest.number);
        Ok(())
    }
}

/// Hands out a configured set of gaps and stale heights, once. Draining on
/// read keeps periodic backfill tests from re-processing the same work.
#[derive(Default)]
pub struct MockRetriever {
    range: Mutex<Option<(u64, u64)>>,
    gaps: Mutex<Vec<crate::core::Gap>>,
    stale: Mutex<Vec<u64>>,
}

impl MockRetriever {
    pub fn with_range(first: u64, last: u64) -> Self {
        Self {
            range: Mutex::new(Some((first, last))),
            ..Default::default()
        }
    }

    pub fn add_gap(&self, gap: crate::core::Gap) {
        self.gaps.lock().unwrap().push(gap);
    }

    pub fn add_stale(&self, height: u64) {
        self.stale.lock().unwrap().push(height);
    }
}

#[async_trait]
impl crate::adapter::CidRetriever for MockRetriever {
    async fn gaps(&self, _from: u64, _to: u64) -> Result<Vec<crate::core::Gap>> {
        Ok(std::mem::take(&mut *self.gaps.lock().unwrap()))
    }

    async fn stale_heights(&self, _level: i32, _from: u64, _to: u64) -> Result<Vec<u64>> {
        Ok(std::mem::take(&mut *self.stale.lock().unwrap()))
    }

    async fn first_block_number(&self) -> Result<Option<u64>> {
        Ok(self.range.lock().unwrap().map(|(first, _)| first))
    }

    async fn last_block_number(&self) -> Result<Option<u64>> {
        Ok(self.range.lock().unwrap().map(|(_, last)| last))
    }
}

/// Serves historical responses for every height up to a fixed head.
#[derive(Default)]
pub struct MockHistorical {
    pub head: Mutex<Option<u64>>,
    short_heights: Mutex<HashSet<u64>>,
}

impl MockHistorical {
    pub fn with_head(head: u64) -> Arc<Self> {
        Arc::new(Self {
            head: Mutex::new(Some(head)),
            short_heights: Mutex::default(),
        })
    }

    /// Makes the given height come back with a shortfall report (the
    /// response itself is still served, as a partial).
    pub fn short_on(&self, number: u64) {
        self.short_heights.lock().unwrap().insert(number);
    }
}

#[async_trait]
impl HistoricalSource<MockChain> for MockHistorical {
    async fn responses(
        &self,
        settings: &MockSettings,
        start: u64,
        end: u64,
    ) -> Result<PartialResponses<MockChain>> {
        let mut shortfalls = Vec::new();
        let responses = (start..=end)
            .filter(|number| matches(settings, *number))
            .inspect(|number| {
                if self.short_heights.lock().unwrap().contains(number) {
                    shortfalls.push(
                        Report::new(WatcherError::UnexpectedIpldCount)
                            .attach_printable(format!("block {number}")),
                    );
                }
            })
            .map(|number| MockResponse { number })
            .collect();
        Ok((responses, shortfalls))
    }

    async fn head(&self) -> Result<Option<u64>> {
        Ok(*self.head.lock().unwrap())
    }
}
