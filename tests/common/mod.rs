#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use sealdrop::{
    config::AppConfig,
    crypto::{KdfParams, container::ContainerWriter},
    db, routes,
    services::{
        backend::{BackendError, BackendResult, ObjectBackend, ObjectRef, UploadTarget},
        filesystem_backend::FilesystemBackend,
    },
    state::AppState,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Argon2id parameters cheap enough for tests.
pub fn cheap_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

/// Wraps the filesystem backend, fails part uploads on demand and counts
/// multipart finishes and aborts.
pub struct FlakyBackend {
    inner: FilesystemBackend,
    pub fail_uploads: AtomicBool,
    pub finishes: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl FlakyBackend {
    pub fn finish_count(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectBackend for FlakyBackend {
    async fn init_upload(&self) -> BackendResult<UploadTarget> {
        self.inner.init_upload().await
    }

    async fn init_multipart(&self, name: &str) -> BackendResult<UploadTarget> {
        self.inner.init_multipart(name).await
    }

    async fn upload_single(
        &self,
        target: &UploadTarget,
        name: &str,
        data: Bytes,
    ) -> BackendResult<ObjectRef> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        self.inner.upload_single(target, name, data).await
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        data: Bytes,
    ) -> BackendResult<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        self.inner.upload_part(target, part_number, data).await
    }

    async fn finish_multipart(
        &self,
        target: &UploadTarget,
        part_ids: &[String],
    ) -> BackendResult<ObjectRef> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.inner.finish_multipart(target, part_ids).await
    }

    async fn abort_multipart(&self, target: &UploadTarget) -> BackendResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart(target).await
    }

    async fn read_range(&self, object: &ObjectRef, range: Range<u64>) -> BackendResult<Bytes> {
        self.inner.read_range(object, range).await
    }

    async fn delete(&self, object: &ObjectRef) -> BackendResult<()> {
        self.inner.delete(object).await
    }

    async fn probe(&self) -> BackendResult<()> {
        self.inner.probe().await
    }
}

pub struct TestServer {
    pub state: AppState,
    pub router: Router,
    pub flaky: Arc<FlakyBackend>,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = AppConfig {
            storage_dir: dir.path().join("objects").display().to_string(),
            database_url: format!("sqlite://{}", dir.path().join("sealdrop.db").display()),
            ..AppConfig::default()
        };
        tweak(&mut config);

        let pool = db::connect(&config.database_url).await.expect("connect sqlite");
        db::run_migrations(&pool).await.expect("run migrations");
        let flaky = Arc::new(FlakyBackend {
            inner: FilesystemBackend::new(&config.storage_dir)
                .await
                .expect("create backend"),
            fail_uploads: AtomicBool::new(false),
            finishes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        });

        let state = AppState::new(config, pool, flaky.clone());
        let router = routes::routes::routes().with_state(state.clone());
        Self {
            state,
            router,
            flaky,
            dir,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(body.into()).expect("build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        (status, headers, body)
    }

    pub async fn send_json(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Value,
    ) -> (StatusCode, Value) {
        let mut all = vec![("content-type", "application/json")];
        all.extend_from_slice(headers);
        let (status, _, bytes) = self.send(method, uri, &all, body.to_string()).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Create an account over HTTP and return its id.
    pub async fn signup(&self, email: Option<&str>) -> String {
        let (status, body) = self
            .send_json(
                Method::POST,
                "/account",
                &[],
                json!({
                    "email": email,
                    "login_key": b64(b"login-key"),
                    "protected_key": b64(b"protected"),
                    "public_key": b64(b"public"),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().expect("account id").to_string()
    }

    /// Declare an upload and return its id.
    pub async fn initiate(&self, owner: Option<&str>, body: Value) -> String {
        let headers: Vec<(&str, &str)> = owner.map(|o| ("x-account-id", o)).into_iter().collect();
        let (status, resp) = self.send_json(Method::POST, "/u", &headers, body).await;
        assert_eq!(status, StatusCode::CREATED, "{}", resp);
        resp["id"].as_str().expect("upload id").to_string()
    }

    pub async fn upload_chunk(&self, id: &str, index: usize, chunk: &[u8]) -> (StatusCode, Value) {
        let (status, _, bytes) = self
            .send(
                Method::POST,
                &format!("/u/{}/{}", id, index),
                &[("content-type", "application/octet-stream")],
                chunk.to_vec(),
            )
            .await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Upload every chunk and return the public path.
    pub async fn upload_all(&self, id: &str, chunks: &[Vec<u8>]) -> String {
        let mut path = None;
        for (index, chunk) in chunks.iter().enumerate() {
            let (status, receipt) = self.upload_chunk(id, index, chunk).await;
            assert_eq!(status, StatusCode::OK, "{}", receipt);
            path = receipt["path"].as_str().map(str::to_string);
        }
        path.expect("final chunk returns the path")
    }

    /// Install a trigger that aborts any transition of an object into `state`.
    pub async fn block_transition(&self, name: &str, state: &str) {
        sqlx::query(&format!(
            "CREATE TRIGGER {name} BEFORE UPDATE OF state ON objects \
             WHEN NEW.state = '{state}' BEGIN SELECT RAISE(ABORT, 'blocked'); END"
        ))
        .execute(&*self.state.db)
        .await
        .expect("create trigger");
    }

    pub async fn unblock_transition(&self, name: &str) {
        sqlx::query(&format!("DROP TRIGGER {name}"))
            .execute(&*self.state.db)
            .await
            .expect("drop trigger");
    }

    pub async fn row_count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&*self.state.db)
            .await
            .expect("count rows")
    }
}

pub fn b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Encrypt `plaintext` into upload-ready chunks. The last chunk carries the salt.
pub fn seal(plaintext: &[u8]) -> ([u8; 32], Vec<Vec<u8>>) {
    let passphrase = SecretString::from(PASSPHRASE);
    let mut writer = ContainerWriter::new(&passphrase, &cheap_kdf()).expect("writer");
    let salt = *writer.salt();
    let mut chunks = writer.write(plaintext).expect("write");
    chunks.push(writer.finish().expect("finish"));
    (salt, chunks)
}

/// A deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn upload_request(salt: &[u8], chunks: usize, downloads: i64, kind: &str) -> Value {
    json!({
        "name": b64(b"encrypted-name"),
        "chunks": chunks,
        "salt": b64(salt),
        "downloads": downloads,
        "expiration": "1d",
        "kind": kind,
    })
}
