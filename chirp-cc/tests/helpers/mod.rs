//! Shared test harness
//!
//! Builds a full coordinator instance on an in-memory database with
//! programmable inference mocks and memory-backed blob stores, then
//! drives the real router with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chirp_cc::api::auth::token_digest;
use chirp_cc::db;
use chirp_cc::dispatch::Dispatcher;
use chirp_cc::inference::breaker::{BreakerConfig, CircuitBreaker};
use chirp_cc::inference::{
    Classification, Classifier, GeneratedArt, Generator, InferenceError,
};
use chirp_cc::pipeline::CapturePipeline;
use chirp_cc::ratelimit::DeviceRateLimiter;
use chirp_cc::store::{content_key, BlobStore, MemoryBlobStore};
use chirp_cc::{build_router, AppState};
use chirp_common::events::EventBus;
use chirp_common::ids::RandomIds;
use chirp_common::time::{Clock, ManualClock};
use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const TEST_TOKEN: &str = "tok-ada";
pub const TEST_DEVICE: &str = "CHIRP-AABBCCDDEEFF";

/// A classifier double with a sticky scripted response, a call counter,
/// an optional artificial latency, and the same breaker admission logic
/// the HTTP client applies.
pub struct MockClassifier {
    response: Mutex<Result<Classification, InferenceError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    pub breaker: Arc<CircuitBreaker>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            response: Mutex::new(Ok(classification("amerob"))),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            breaker: Arc::new(CircuitBreaker::new("classifier", BreakerConfig::default())),
        }
    }

    pub fn respond_with(&self, response: Result<Classification, InferenceError>) {
        *self.response.lock() = response;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running classify calls observed
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Classifier for MockClassifier {
    async fn classify(
        &self,
        _clip: &[u8],
        _content_type: &str,
        _request_id: Uuid,
    ) -> Result<Classification, InferenceError> {
        use chirp_cc::inference::breaker::Admission;
        if self.breaker.admit() == Admission::Denied {
            return Err(InferenceError::Unavailable);
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.response.lock().clone();
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_retriable() => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}

/// A generator double mirroring the classifier mock; `download` serves
/// fixed bytes for any URL the scripted art response mentions.
pub struct MockGenerator {
    response: Mutex<Result<GeneratedArt, InferenceError>>,
    calls: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            response: Mutex::new(Ok(GeneratedArt {
                image_url: "https://generated/amerob.webp".to_string(),
                gif_url: None,
            })),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn respond_with(&self, response: Result<GeneratedArt, InferenceError>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        _species_code: &str,
        _common_name: &str,
        _scientific_name: &str,
        _request_id: Uuid,
    ) -> Result<GeneratedArt, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone()
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, InferenceError> {
        Ok(b"generated-art-bytes".to_vec())
    }
}

pub fn classification(code: &str) -> Classification {
    let (common, scientific) = match code {
        "amerob" => ("American Robin", "Turdus migratorius"),
        "pilwoo" => ("Pileated Woodpecker", "Dryocopus pileatus"),
        "cowbrd" => ("Brown-headed Cowbird", "Molothrus ater"),
        _ => ("Unknown Bird", "Avis incognita"),
    };
    Classification {
        species_code: code.to_string(),
        common_name: common.to_string(),
        scientific_name: scientific.to_string(),
        confidence: 0.92,
    }
}

/// Knobs for the harness
pub struct TestOptions {
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub job_deadline: Duration,
    pub max_upload_bytes: usize,
    pub rate_per_minute: u32,
    pub rate_burst: u32,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            pool_size: 2,
            queue_capacity: 16,
            job_deadline: Duration::from_secs(10),
            max_upload_bytes: 64 * 1024,
            rate_per_minute: 600,
            rate_burst: 100,
        }
    }
}

/// Fully wired coordinator over in-memory stores
pub struct TestApp {
    pub db: SqlitePool,
    pub bus: Arc<EventBus>,
    pub clock: ManualClock,
    pub classifier: Arc<MockClassifier>,
    pub generator: Arc<MockGenerator>,
    pub clip_store: Arc<MemoryBlobStore>,
    pub asset_store: Arc<MemoryBlobStore>,
    pub pipeline: Arc<CapturePipeline>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Router,
    pub user_id: Uuid,
    pub shutdown: CancellationToken,
}

impl TestApp {
    pub async fn start() -> Self {
        Self::start_with(TestOptions::default()).await
    }

    pub async fn start_with(options: TestOptions) -> Self {
        let pool = db::init_memory_pool().await.unwrap();
        let clock = ManualClock::at_epoch();
        let bus = Arc::new(EventBus::new(64));
        let classifier = Arc::new(MockClassifier::new());
        let generator = Arc::new(MockGenerator::new());
        let clip_store = Arc::new(MemoryBlobStore::new("mem://clips"));
        let asset_store = Arc::new(MemoryBlobStore::new("mem://assets"));
        let ids = Arc::new(RandomIds);

        let user_id = Uuid::new_v4();
        db::users::insert(
            &pool,
            user_id,
            "ada",
            "credential-hash",
            Some(&token_digest(TEST_TOKEN)),
            clock.now_micros(),
        )
        .await
        .unwrap();
        db::devices::register_or_update(
            &pool,
            TEST_DEVICE,
            user_id,
            "1.2.0",
            Some(r#"{"dual_mic":true}"#),
            clock.now_micros(),
        )
        .await
        .unwrap();

        let pipeline = Arc::new(CapturePipeline::new(
            pool.clone(),
            clip_store.clone() as Arc<dyn BlobStore>,
            asset_store.clone() as Arc<dyn BlobStore>,
            classifier.clone() as Arc<dyn Classifier>,
            generator.clone() as Arc<dyn Generator>,
            Arc::clone(&bus),
            Arc::new(clock.clone()) as Arc<dyn Clock>,
            ids.clone(),
        ));

        let dispatcher = Dispatcher::start(
            Arc::clone(&pipeline),
            pool.clone(),
            Arc::clone(&bus),
            Arc::new(clock.clone()),
            options.pool_size,
            options.queue_capacity,
            options.job_deadline,
        );

        let shutdown = CancellationToken::new();
        let state = AppState {
            db: pool.clone(),
            bus: Arc::clone(&bus),
            clock: Arc::new(clock.clone()),
            ids,
            clip_store: clip_store.clone(),
            dispatcher: Arc::clone(&dispatcher),
            limiter: Arc::new(DeviceRateLimiter::new(
                options.rate_per_minute,
                options.rate_burst,
            )),
            shutdown: shutdown.clone(),
            max_upload_bytes: options.max_upload_bytes,
            ws_ping_interval: Duration::from_secs(20),
        };
        let router = build_router(state);

        Self {
            db: pool,
            bus,
            clock,
            classifier,
            generator,
            clip_store,
            asset_store,
            pipeline,
            dispatcher,
            router,
            user_id,
            shutdown,
        }
    }

    /// Perform a multipart upload through the real router
    pub async fn upload(&self, device_id: &str, seq: i64, clip: &[u8]) -> Response {
        self.upload_as(Some(TEST_TOKEN), device_id, seq, clip, "audio/wav")
            .await
    }

    pub async fn upload_as(
        &self,
        token: Option<&str>,
        device_id: &str,
        seq: i64,
        clip: &[u8],
        content_type: &str,
    ) -> Response {
        // Distinct received timestamps keep list ordering deterministic.
        self.clock.advance(ChronoDuration::seconds(1));

        let (boundary_header, body) = multipart_body(device_id, seq, clip, content_type);
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/captures")
            .header(header::CONTENT_TYPE, boundary_header);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.router
            .clone()
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap()
    }

    /// GET with the seeded bearer token
    pub async fn get(&self, uri: &str) -> Response {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    /// Seed a pending capture row plus its clip bytes, bypassing HTTP
    pub async fn seed_capture(&self, seq: i64, clip: &[u8]) -> Uuid {
        self.clock.advance(ChronoDuration::seconds(1));
        let key = content_key(clip);
        self.clip_store.put(&key, clip, "audio/wav").await.unwrap();

        match db::captures::create(
            &self.db,
            Uuid::new_v4(),
            self.user_id,
            TEST_DEVICE,
            &key,
            seq,
            "audio/wav",
            None,
            self.clock.now_micros(),
        )
        .await
        .unwrap()
        {
            db::captures::CreateOutcome::Created(capture) => capture.id,
            other => panic!("expected fresh capture, got {:?}", other),
        }
    }

    /// Run the pipeline directly for one capture
    pub async fn run_pipeline(&self, capture_id: Uuid) {
        self.pipeline
            .run(capture_id, &CancellationToken::new())
            .await
            .unwrap();
    }

    /// Wait until the capture reaches a terminal state (dispatcher path)
    pub async fn wait_terminal(&self, capture_id: Uuid) -> chirp_cc::models::Capture {
        for _ in 0..200 {
            let capture = db::captures::get(&self.db, capture_id)
                .await
                .unwrap()
                .unwrap();
            if capture.status().is_terminal() {
                return capture;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture {} never reached a terminal state", capture_id);
    }
}

/// Build a multipart body for the upload endpoint
pub fn multipart_body(
    device_id: &str,
    seq: i64,
    clip: &[u8],
    content_type: &str,
) -> (String, Vec<u8>) {
    const BOUNDARY: &str = "chirp-test-boundary";
    let mut body = Vec::new();

    for (name, value) in [
        ("device_id", device_id.to_string()),
        ("device_sequence", seq.to_string()),
    ] {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }

    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"audio_file\"; \
             filename=\"clip.wav\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(clip);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={BOUNDARY}"),
        body,
    )
}

/// Parse a JSON response body
pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Assert status and return the parsed body
pub async fn expect_status(response: Response, status: StatusCode) -> serde_json::Value {
    assert_eq!(response.status(), status, "unexpected HTTP status");
    json_body(response).await
}
