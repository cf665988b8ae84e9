//! Scripted collaborators and a wired-up engine for end-to-end tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use content_sync::assets::{AssetDownloader, AssetFetcher};
use content_sync::db::{self, Pool};
use content_sync::model::{AssetType, CachedAsset, OutboxRecord, PayloadMode};
use content_sync::remote::model::{
    PullRequest, PullResponse, ServerAsset, ServerLesson, ServerUnitEntry, ServerUnitSummary,
    SharingUpdate,
};
use content_sync::remote::{ContentRepo, OutboxProcessor, PullTransport, StaticIdentity};
use content_sync::service::ContentService;
use content_sync::sync::SyncEngine;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn unit_entry(id: &str, title: &str) -> ServerUnitEntry {
    let mut extra = Map::new();
    extra.insert("owner_id".into(), json!("user-1"));
    ServerUnitEntry {
        summary: ServerUnitSummary {
            id: id.into(),
            title: title.into(),
            description: Some(format!("About {}", title)),
            learner_level: Some("A2".into()),
            is_global: false,
            updated_at: ts(10),
            schema_version: 1,
            lesson_order: Vec::new(),
            extra,
        },
        lessons: Vec::new(),
        assets: Vec::new(),
    }
}

pub fn with_lessons(mut entry: ServerUnitEntry, ids: &[&str]) -> ServerUnitEntry {
    entry.summary.lesson_order = ids.iter().map(|s| s.to_string()).collect();
    entry.lessons = ids
        .iter()
        .map(|id| ServerLesson {
            id: id.to_string(),
            title: format!("Lesson {}", id),
            updated_at: ts(20),
            schema_version: 1,
            payload: json!({ "exercises": [id] }),
        })
        .collect();
    entry
}

pub fn with_assets(mut entry: ServerUnitEntry, ids: &[&str]) -> ServerUnitEntry {
    entry.assets = ids
        .iter()
        .map(|id| ServerAsset {
            id: id.to_string(),
            asset_type: AssetType::Audio,
            remote_uri: format!("https://cdn.example.test/{}.mp3", id),
            checksum: None,
            updated_at: ts(30),
        })
        .collect();
    entry
}

pub fn response(units: Vec<ServerUnitEntry>, cursor: &str) -> PullResponse {
    PullResponse {
        units,
        cursor: Some(cursor.into()),
        ..Default::default()
    }
}

/// Pull transport answering from a script; an exhausted script answers with
/// an empty page. Built with [`ScriptedPull::serving`] it instead behaves
/// like a delta server over a fixed corpus.
#[derive(Clone, Default)]
pub struct ScriptedPull {
    responses: Arc<Mutex<VecDeque<Result<PullResponse>>>>,
    corpus: Option<Arc<Vec<ServerUnitEntry>>>,
    calls: Arc<Mutex<Vec<PullRequest>>>,
    delay: Option<std::time::Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedPull {
    pub fn with_responses(responses: Vec<Result<PullResponse>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    /// Answers every request from `corpus`: a request carrying a cursor sees
    /// nothing changed, scoped requests see only their units, and minimal
    /// requests get no lesson bodies.
    pub fn serving(corpus: Vec<ServerUnitEntry>) -> Self {
        Self {
            corpus: Some(Arc::new(corpus)),
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, response: Result<PullResponse>) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn calls(&self) -> Vec<PullRequest> {
        self.calls.lock().await.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PullTransport for ScriptedPull {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().await.push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = match &self.corpus {
            Some(corpus) => Ok(serve_from(corpus, request)),
            None => self
                .responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(PullResponse::default())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next
    }
}

fn serve_from(corpus: &[ServerUnitEntry], request: &PullRequest) -> PullResponse {
    const HEAD: &str = "server-head";
    if request.cursor.as_deref() == Some(HEAD) {
        return response(Vec::new(), HEAD);
    }
    let units = corpus
        .iter()
        .filter(|e| request.unit_ids.is_empty() || request.unit_ids.contains(&e.summary.id))
        .cloned()
        .map(|mut e| {
            if request.payload == PayloadMode::Minimal {
                e.lessons.clear();
            }
            e
        })
        .collect();
    response(units, HEAD)
}

#[derive(Clone, Default)]
pub struct RecordingProcessor {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingProcessor {
    pub async fn fail_next(&self, message: &str) {
        self.responses.lock().await.push_back(Err(anyhow!(message.to_string())));
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl OutboxProcessor for RecordingProcessor {
    async fn process(&self, record: &OutboxRecord) -> Result<()> {
        self.calls.lock().await.push(record.idempotency_key.clone());
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

/// Serves `bytes-of-<asset id>` unless the asset id is marked failing.
#[derive(Clone, Default)]
pub struct FakeDownloader {
    failing: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
    latency: Arc<Mutex<Option<std::time::Duration>>>,
}

impl FakeDownloader {
    pub async fn slow_down(&self, latency: std::time::Duration) {
        *self.latency.lock().await = Some(latency);
    }

    pub async fn fail(&self, asset_id: &str) {
        self.failing.lock().await.insert(asset_id.to_string());
    }

    pub async fn heal(&self, asset_id: &str) {
        self.failing.lock().await.remove(asset_id);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AssetDownloader for FakeDownloader {
    async fn fetch(&self, asset: &CachedAsset) -> Result<Vec<u8>> {
        self.calls.lock().await.push(asset.id.clone());
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().await.contains(&asset.id) {
            return Err(anyhow!("connection reset fetching {}", asset.remote_uri));
        }
        Ok(format!("bytes-of-{}", asset.id).into_bytes())
    }
}

#[derive(Clone, Default)]
pub struct FakeRepo {
    details: Arc<Mutex<HashMap<String, ServerUnitEntry>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRepo {
    pub async fn insert(&self, entry: ServerUnitEntry) {
        self.details
            .lock()
            .await
            .insert(entry.summary.id.clone(), entry);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ContentRepo for FakeRepo {
    async fn fetch_unit_detail(&self, unit_id: &str) -> Result<ServerUnitEntry> {
        self.calls.lock().await.push(format!("GET {}", unit_id));
        self.details
            .lock()
            .await
            .get(unit_id)
            .cloned()
            .ok_or_else(|| anyhow!("server error 404 for unit {}", unit_id))
    }

    async fn add_to_my_units(&self, unit_id: &str) -> Result<()> {
        self.calls.lock().await.push(format!("ADD {}", unit_id));
        Ok(())
    }

    async fn remove_from_my_units(&self, unit_id: &str) -> Result<()> {
        self.calls.lock().await.push(format!("REMOVE {}", unit_id));
        Ok(())
    }

    async fn update_sharing(&self, unit_id: &str, update: &SharingUpdate) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(format!("SHARE {} {}", unit_id, update.is_global));
        Ok(())
    }
}

/// Engine and service over an in-memory cache and a temporary media dir.
pub struct Harness {
    pub pool: Pool,
    pub engine: Arc<SyncEngine>,
    pub service: ContentService,
    pub pull: ScriptedPull,
    pub push: RecordingProcessor,
    pub downloader: FakeDownloader,
    pub repo: FakeRepo,
    pub media: TempDir,
}

impl Harness {
    pub async fn new(pull: ScriptedPull) -> Self {
        Self::build(pull, Some("user-1"), Duration::hours(1)).await
    }

    pub async fn anonymous(pull: ScriptedPull) -> Self {
        Self::build(pull, None, Duration::hours(1)).await
    }

    pub async fn with_stale_after(pull: ScriptedPull, stale_after: Duration) -> Self {
        Self::build(pull, Some("user-1"), stale_after).await
    }

    async fn build(pull: ScriptedPull, user: Option<&str>, stale_after: Duration) -> Self {
        let pool = db::open_in_memory().await.unwrap();
        let media = tempfile::tempdir().unwrap();
        let push = RecordingProcessor::default();
        let downloader = FakeDownloader::default();
        let repo = FakeRepo::default();
        let fetcher = Arc::new(AssetFetcher::new(
            pool.clone(),
            Arc::new(downloader.clone()),
            media.path().to_path_buf(),
            2,
        ));
        let engine = Arc::new(SyncEngine::new(
            pool.clone(),
            fetcher,
            Arc::new(pull.clone()),
            Arc::new(push.clone()),
            Arc::new(StaticIdentity::new(user.map(str::to_string))),
        ));
        let service = ContentService::new(engine.clone(), Arc::new(repo.clone()), stale_after);
        Self {
            pool,
            engine,
            service,
            pull,
            push,
            downloader,
            repo,
            media,
        }
    }
}
