// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! A [`LogOperator`] speaking the CT v1 HTTP API.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context as _, anyhow, bail, ensure};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{
    bias::Entrypoint,
    chain::{ChainGenerator, ChainKind},
    error::ConfigError,
    hammer::{CampaignParameters, LogOperator},
    op_generator::LogOp,
};

/// Number of leaves remembered for proof requests.
const MAX_KNOWN_LEAVES: usize = 1000;
/// Size of the get-entries request used to learn leaves when none is known.
const FALLBACK_ENTRIES: u64 = 16;
/// How far past the latest tree size an invalid proof request reaches.
const INVALID_TREE_SIZE_OFFSET: u64 = 1 << 40;

/// Interchangeable servers hosting the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPool {
    servers: Vec<String>,
}

impl ServerPool {
    /// Parses a comma-separated list of servers; entries without a scheme use `http`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let servers: Vec<_> = list
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(|server| {
                let server = server.trim_end_matches('/');
                if server.contains("://") {
                    server.to_owned()
                } else {
                    format!("http://{server}")
                }
            })
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        Ok(Self { servers })
    }

    /// The base URLs of all servers.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Picks a random server.
    pub fn pick<R: Rng>(&self, rng: &mut R) -> &str {
        self.servers
            .choose(rng)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Builds the URL of `entrypoint` of the log `prefix` on `server`.
pub fn entrypoint_url(server: &str, prefix: &str, entrypoint: Entrypoint) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{server}/ct/v1/{entrypoint}")
    } else {
        format!("{server}/{prefix}/ct/v1/{entrypoint}")
    }
}

/// Computes the Merkle leaf hash of a leaf input.
pub fn leaf_hash(leaf_input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0u8]);
    hasher.update(leaf_input);
    hasher.finalize().into()
}

/// Creates the HTTP client shared by all operators.
pub fn build_http_client(request_timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("ct-hammer/", env!("CARGO_PKG_VERSION")))
        .timeout(request_timeout)
        .build()
        .context("failed to build the HTTP client")
}

/// A signed tree head as far as the hammer cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SthView {
    /// Number of leaves in the tree.
    pub tree_size: u64,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

/// A leaf whose position in the log is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownLeaf {
    /// Position of the leaf.
    pub index: u64,
    /// Merkle leaf hash.
    pub hash: [u8; 32],
}

/// What a client has learned about a log.
#[derive(Debug, Default)]
pub struct LogView {
    sth: Option<SthView>,
    leaves: VecDeque<KnownLeaf>,
    pending_scts: Vec<u64>,
}

impl LogView {
    /// The newest tree head seen so far.
    pub fn sth(&self) -> Option<SthView> {
        self.sth
    }

    /// Timestamps of SCTs not yet covered by a tree head.
    pub fn pending_scts(&self) -> &[u64] {
        &self.pending_scts
    }

    /// Remembers the timestamp of an SCT returned by a submission.
    pub fn record_sct(&mut self, timestamp: u64) {
        self.pending_scts.push(timestamp);
    }

    /// Remembers a leaf, forgetting the oldest one when full.
    pub fn learn_leaf(&mut self, leaf: KnownLeaf) {
        if self.leaves.len() == MAX_KNOWN_LEAVES {
            self.leaves.pop_front();
        }
        self.leaves.push_back(leaf);
    }

    /// Picks a random known leaf.
    pub fn pick_leaf<R: Rng>(&self, rng: &mut R) -> Option<KnownLeaf> {
        if self.leaves.is_empty() {
            return None;
        }
        self.leaves.get(rng.gen_range(0..self.leaves.len())).copied()
    }

    /// Absorbs a freshly fetched tree head and checks the merge delay.
    ///
    /// Older tree heads never replace newer ones. SCTs covered by the newest tree head are
    /// released; any SCT older than `mmd` at `now_ms` that is still uncovered is an error.
    pub fn absorb_sth(&mut self, sth: SthView, now_ms: u64, mmd: Duration) -> anyhow::Result<()> {
        if self
            .sth
            .is_none_or(|current| sth.timestamp >= current.timestamp)
        {
            self.sth = Some(sth);
        }
        let covered_until = self.sth.map_or(sth.timestamp, |current| current.timestamp);
        self.pending_scts
            .retain(|&timestamp| timestamp > covered_until);

        let mmd_ms = u64::try_from(mmd.as_millis()).unwrap_or(u64::MAX);
        let overdue: Vec<_> = self
            .pending_scts
            .iter()
            .filter(|&&timestamp| now_ms.saturating_sub(timestamp) > mmd_ms)
            .collect();
        if let Some(oldest) = overdue.iter().min() {
            bail!(
                "{} SCTs are older than the merge delay {mmd:?} but not covered by the STH at \
                 {covered_until}, oldest at {oldest}",
                overdue.len()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AddChainRequest {
    chain: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddChainResponse {
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct GetSthResponse {
    tree_size: u64,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct GetSthConsistencyResponse {
    #[serde(default)]
    consistency: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GetProofByHashResponse {
    leaf_index: u64,
    #[serde(default)]
    audit_path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LeafEntry {
    leaf_input: String,
}

#[derive(Debug, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<LeafEntry>,
}

#[derive(Debug, Deserialize)]
struct GetRootsResponse {
    certificates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GetEntryAndProofResponse {
    leaf_input: String,
    #[serde(default)]
    audit_path: Vec<String>,
}

/// Drives one log through its HTTP API.
pub struct HttpLogOperator {
    prefix: String,
    pool: Arc<ServerPool>,
    http: reqwest::Client,
    chains: Option<Arc<dyn ChainGenerator>>,
    not_after: DateTime<Utc>,
    mmd: Duration,
    view: Mutex<LogView>,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for HttpLogOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpLogOperator")
            .field("prefix", &self.prefix)
            .field("pool", &self.pool)
            .field("not_after", &self.not_after)
            .field("mmd", &self.mmd)
            .finish_non_exhaustive()
    }
}

impl HttpLogOperator {
    /// Creates an operator for the log of `params`.
    pub fn new(
        params: &CampaignParameters,
        pool: Arc<ServerPool>,
        http: reqwest::Client,
        chains: Option<Arc<dyn ChainGenerator>>,
    ) -> Self {
        Self {
            prefix: params.target.prefix.clone(),
            pool,
            http,
            chains,
            not_after: params.not_after,
            mmd: params.mmd,
            view: Mutex::new(LogView::default()),
            rng: Mutex::new(StdRng::seed_from_u64(params.seed.rotate_left(32))),
        }
    }

    fn view(&self) -> std::sync::MutexGuard<'_, LogView> {
        self.view.lock().expect("log view lock is never poisoned")
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        f(&mut self.rng.lock().expect("rng lock is never poisoned"))
    }

    fn url(&self, entrypoint: Entrypoint) -> String {
        let server = self.with_rng(|rng| self.pool.pick(rng).to_owned());
        entrypoint_url(&server, &self.prefix, entrypoint)
    }

    fn get(&self, entrypoint: Entrypoint, query: &[(&str, String)]) -> reqwest::RequestBuilder {
        self.http.get(self.url(entrypoint)).query(query)
    }

    /// Sends a well-formed request and decodes the response.
    async fn fetch<T: DeserializeOwned>(
        &self,
        entrypoint: Entrypoint,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("{entrypoint} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{entrypoint} returned {status}: {}", body.trim());
        }
        response
            .json()
            .await
            .with_context(|| format!("{entrypoint} returned an unparseable body"))
    }

    /// Sends a malformed request and checks that the log rejects it.
    async fn expect_rejection(
        &self,
        entrypoint: Entrypoint,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<()> {
        let response = request
            .send()
            .await
            .with_context(|| format!("invalid {entrypoint} request failed"))?;
        let status = response.status();
        ensure!(
            status.is_client_error(),
            "invalid {entrypoint} request was answered with {status}"
        );
        Ok(())
    }

    async fn current_sth(&self) -> anyhow::Result<SthView> {
        let known = self.view().sth();
        match known {
            Some(sth) => Ok(sth),
            None => self.get_sth().await,
        }
    }

    async fn get_sth(&self) -> anyhow::Result<SthView> {
        let response: GetSthResponse = self
            .fetch(Entrypoint::GetSth, self.get(Entrypoint::GetSth, &[]))
            .await?;
        let sth = SthView {
            tree_size: response.tree_size,
            timestamp: response.timestamp,
        };
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.view().absorb_sth(sth, now_ms, self.mmd)?;
        tracing::debug!(tree_size = sth.tree_size, timestamp = sth.timestamp, "got STH");
        Ok(sth)
    }

    async fn add_chain(&self, kind: ChainKind, invalid: bool) -> anyhow::Result<()> {
        let entrypoint = match kind {
            ChainKind::Certificate => Entrypoint::AddChain,
            ChainKind::Precertificate => Entrypoint::AddPreChain,
        };
        let url = self.url(entrypoint);
        if invalid {
            let request = self.http.post(url).json(&AddChainRequest { chain: vec![] });
            return self.expect_rejection(entrypoint, request).await;
        }

        let chain = self
            .chains
            .as_ref()
            .ok_or_else(|| anyhow!("no chain material for {entrypoint}"))?
            .chain(kind, self.not_after)
            .with_context(|| format!("failed to build a chain for {entrypoint}"))?;
        let request = self.http.post(url).json(&AddChainRequest {
            chain: chain.iter().map(|der| STANDARD.encode(der)).collect(),
        });
        let sct: AddChainResponse = self.fetch(entrypoint, request).await?;
        self.view().record_sct(sct.timestamp);
        Ok(())
    }

    async fn get_sth_consistency(&self, invalid: bool) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetSthConsistency;
        let sth = self.current_sth().await?;
        let second = sth.tree_size;
        if invalid {
            let query = [("first", (second + 1).to_string()), ("second", second.to_string())];
            return self
                .expect_rejection(entrypoint, self.get(entrypoint, &query))
                .await;
        }

        let first = self.with_rng(|rng| rng.gen_range(0..=second));
        let query = [("first", first.to_string()), ("second", second.to_string())];
        let response: GetSthConsistencyResponse =
            self.fetch(entrypoint, self.get(entrypoint, &query)).await?;
        tracing::trace!(
            first,
            second,
            proof_len = response.consistency.len(),
            "got consistency proof"
        );
        Ok(())
    }

    async fn get_proof_by_hash(&self, invalid: bool) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetProofByHash;
        let sth = self.current_sth().await?;
        if invalid {
            // No tree of that size exists, so even an unknown hash must be rejected.
            let hash = match self.known_leaf() {
                Some(leaf) => leaf.hash,
                None => self.with_rng(|rng| rng.r#gen()),
            };
            let tree_size = sth.tree_size.saturating_add(INVALID_TREE_SIZE_OFFSET);
            let query = [
                ("hash", STANDARD.encode(hash)),
                ("tree_size", tree_size.to_string()),
            ];
            return self
                .expect_rejection(entrypoint, self.get(entrypoint, &query))
                .await;
        }
        let Some(leaf) = self.known_leaf() else {
            return self.learn_leaves(sth).await;
        };

        let query = [
            ("hash", STANDARD.encode(leaf.hash)),
            ("tree_size", sth.tree_size.to_string()),
        ];
        let response: GetProofByHashResponse =
            self.fetch(entrypoint, self.get(entrypoint, &query)).await?;
        ensure!(
            response.leaf_index == leaf.index,
            "inclusion proof for leaf {} reports index {}",
            leaf.index,
            response.leaf_index
        );
        tracing::trace!(
            leaf_index = leaf.index,
            proof_len = response.audit_path.len(),
            "got inclusion proof"
        );
        Ok(())
    }

    async fn get_entries(
        &self,
        count: u64,
        allow_oversized: bool,
        invalid: bool,
    ) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetEntries;
        let sth = self.current_sth().await?;
        if invalid {
            let end = self
                .with_rng(|rng| rng.gen_range(0..=sth.tree_size))
                .min(u64::MAX - 1);
            let query = [("start", (end + 1).to_string()), ("end", end.to_string())];
            return self
                .expect_rejection(entrypoint, self.get(entrypoint, &query))
                .await;
        }
        if sth.tree_size == 0 {
            // Nothing to fetch until the log has integrated a leaf.
            self.get_sth().await?;
            return Ok(());
        }

        let start = self.with_rng(|rng| rng.gen_range(0..sth.tree_size));
        let mut end = start.saturating_add(count.saturating_sub(1));
        if !allow_oversized {
            end = end.min(sth.tree_size - 1);
        }
        self.fetch_entries(start, end).await
    }

    async fn fetch_entries(&self, start: u64, end: u64) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetEntries;
        let query = [("start", start.to_string()), ("end", end.to_string())];
        let response: GetEntriesResponse =
            self.fetch(entrypoint, self.get(entrypoint, &query)).await?;
        ensure!(
            !response.entries.is_empty(),
            "get-entries [{start}, {end}] returned no entries"
        );
        ensure!(
            response.entries.len() as u64 <= end - start + 1,
            "get-entries [{start}, {end}] returned {} entries",
            response.entries.len()
        );

        let mut leaves = Vec::with_capacity(response.entries.len());
        for (index, entry) in (start..).zip(&response.entries) {
            let leaf_input = STANDARD
                .decode(&entry.leaf_input)
                .with_context(|| format!("entry {index} has an undecodable leaf_input"))?;
            leaves.push(KnownLeaf {
                index,
                hash: leaf_hash(&leaf_input),
            });
        }
        let mut view = self.view();
        for leaf in leaves {
            view.learn_leaf(leaf);
        }
        Ok(())
    }

    async fn learn_leaves(&self, sth: SthView) -> anyhow::Result<()> {
        if sth.tree_size == 0 {
            self.get_sth().await?;
            return Ok(());
        }
        let start = self.with_rng(|rng| rng.gen_range(0..sth.tree_size));
        let end = start
            .saturating_add(FALLBACK_ENTRIES - 1)
            .min(sth.tree_size - 1);
        tracing::debug!(start, end, "no known leaf, fetching entries first");
        self.fetch_entries(start, end).await
    }

    fn known_leaf(&self) -> Option<KnownLeaf> {
        let view = self.view();
        self.with_rng(|rng| view.pick_leaf(rng))
    }

    async fn get_roots(&self) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetRoots;
        let response: GetRootsResponse =
            self.fetch(entrypoint, self.get(entrypoint, &[])).await?;
        ensure!(!response.certificates.is_empty(), "log accepts no roots");
        Ok(())
    }

    async fn get_entry_and_proof(&self) -> anyhow::Result<()> {
        let entrypoint = Entrypoint::GetEntryAndProof;
        let sth = self.current_sth().await?;
        let Some(leaf) = self.known_leaf() else {
            return self.learn_leaves(sth).await;
        };
        let query = [
            ("leaf_index", leaf.index.to_string()),
            ("tree_size", sth.tree_size.to_string()),
        ];
        let response: GetEntryAndProofResponse =
            self.fetch(entrypoint, self.get(entrypoint, &query)).await?;
        let leaf_input = STANDARD
            .decode(&response.leaf_input)
            .context("get-entry-and-proof returned an undecodable leaf_input")?;
        ensure!(
            leaf_hash(&leaf_input) == leaf.hash,
            "entry {} does not match the leaf learned earlier",
            leaf.index
        );
        tracing::trace!(
            leaf_index = leaf.index,
            proof_len = response.audit_path.len(),
            "got entry and proof"
        );
        Ok(())
    }
}

#[async_trait]
impl LogOperator for HttpLogOperator {
    async fn execute(&self, op: &LogOp, invalid: bool) -> anyhow::Result<()> {
        match *op {
            LogOp::AddChain => self.add_chain(ChainKind::Certificate, invalid).await,
            LogOp::AddPreChain => self.add_chain(ChainKind::Precertificate, invalid).await,
            LogOp::GetSth => self.get_sth().await.map(|_| ()),
            LogOp::GetSthConsistency => self.get_sth_consistency(invalid).await,
            LogOp::GetProofByHash => self.get_proof_by_hash(invalid).await,
            LogOp::GetEntries {
                count,
                allow_oversized,
            } => self.get_entries(count, allow_oversized, invalid).await,
            LogOp::GetRoots => self.get_roots().await,
            LogOp::GetEntryAndProof => self.get_entry_and_proof().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn parses_server_pool() {
        let pool = ServerPool::parse("localhost:8092, https://ct.example.com/ ,").unwrap();
        assert_eq!(
            pool.servers(),
            ["http://localhost:8092", "https://ct.example.com"]
        );
        assert!(matches!(ServerPool::parse(" , "), Err(ConfigError::NoServers)));
    }

    #[test]
    fn builds_entrypoint_urls() {
        assert_eq!(
            entrypoint_url("http://localhost:8092", "athos", Entrypoint::GetSth),
            "http://localhost:8092/athos/ct/v1/get-sth"
        );
        assert_eq!(
            entrypoint_url("http://localhost:8092", "/logs/2024/", Entrypoint::AddPreChain),
            "http://localhost:8092/logs/2024/ct/v1/add-pre-chain"
        );
    }

    #[test]
    fn leaf_hash_prefixes_zero_byte() {
        let mut hasher = Sha256::new();
        hasher.update(b"\x00leaf");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(leaf_hash(b"leaf"), expected);
    }

    #[test]
    fn newer_sth_wins() {
        let mut view = LogView::default();
        let newer = SthView { tree_size: 10, timestamp: 2_000 };
        let older = SthView { tree_size: 5, timestamp: 1_000 };
        view.absorb_sth(newer, 2_000, MINUTE).unwrap();
        view.absorb_sth(older, 2_000, MINUTE).unwrap();
        assert_eq!(view.sth(), Some(newer));
    }

    #[test]
    fn covered_scts_are_released() {
        let mut view = LogView::default();
        view.record_sct(1_000);
        view.record_sct(5_000);
        view.absorb_sth(SthView { tree_size: 1, timestamp: 1_000 }, 6_000, MINUTE)
            .unwrap();
        assert_eq!(view.pending_scts(), [5_000]);
    }

    #[test]
    fn uncovered_sct_past_merge_delay_fails() {
        let mut view = LogView::default();
        view.record_sct(1_000);
        let sth = SthView { tree_size: 0, timestamp: 500 };
        assert!(view.absorb_sth(sth, 1_000 + 59_000, MINUTE).is_ok());
        let error = view.absorb_sth(sth, 1_000 + 61_000, MINUTE).unwrap_err();
        assert!(error.to_string().contains("older than the merge delay"));

        // A later tree head covering the SCT resolves the violation.
        view.absorb_sth(SthView { tree_size: 1, timestamp: 1_500 }, 70_000, MINUTE)
            .unwrap();
        assert!(view.pending_scts().is_empty());
    }

    #[test]
    fn known_leaves_are_bounded() {
        let mut view = LogView::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(view.pick_leaf(&mut rng).is_none());
        for index in 0..(MAX_KNOWN_LEAVES as u64 + 10) {
            view.learn_leaf(KnownLeaf { index, hash: [0; 32] });
        }
        assert_eq!(view.leaves.len(), MAX_KNOWN_LEAVES);
        assert!(view.pick_leaf(&mut rng).unwrap().index >= 10);
    }
}
