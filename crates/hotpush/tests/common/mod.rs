//! Shared fixtures for the integration suites: gzip payload builders, a
//! recording event sink, a settable update source, and a minimal TCP HTTP
//! server with fault-injection modes.

use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hotpush::{
    BundleDescriptor, EngineConfig, EventSink, ProgressEvent, ResolvedBundle, UpdateError,
    UpdatePhase, UpdateSource,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

pub fn gzip_payload(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic incompressible content, so the gzip payload stays large
/// enough to stream in many chunks.
pub fn noisy_content(len: usize) -> Vec<u8> {
    let mut state = 0x2545f491u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn descriptor_for(version: &str, url: String, payload: &[u8]) -> BundleDescriptor {
    BundleDescriptor {
        version: version.to_string(),
        url,
        checksum: sha256_hex(payload),
        size: payload.len() as u64,
    }
}

pub fn test_config(root: &Path, temp: &TempDir) -> EngineConfig {
    let fallback = temp.path().join("shipped.bundle.gz");
    if !fallback.exists() {
        std::fs::write(&fallback, gzip_payload(b"shipped bundle")).unwrap();
    }
    let mut config = EngineConfig::with_root(root, &fallback);
    config.download_stall_timeout_secs = 10;
    config.request_timeout_secs = 10;
    config
}

// ---------------------------------------------------------------------------
// Update source
// ---------------------------------------------------------------------------

/// Update source backed by a shared, settable descriptor slot.
#[derive(Clone, Default)]
pub struct StaticSource {
    descriptor: Arc<Mutex<Option<BundleDescriptor>>>,
}

impl StaticSource {
    pub fn new(descriptor: Option<BundleDescriptor>) -> Self {
        Self {
            descriptor: Arc::new(Mutex::new(descriptor)),
        }
    }

    pub fn set(&self, descriptor: Option<BundleDescriptor>) {
        *self.descriptor.lock().unwrap() = descriptor;
    }
}

#[async_trait]
impl UpdateSource for StaticSource {
    async fn latest(&self) -> Result<Option<BundleDescriptor>> {
        Ok(self.descriptor.lock().unwrap().clone())
    }
}

/// Update source whose endpoint is always down.
pub struct BrokenSource;

#[async_trait]
impl UpdateSource for BrokenSource {
    async fn latest(&self) -> Result<Option<BundleDescriptor>> {
        anyhow::bail!("update endpoint unreachable")
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    pub phases: Mutex<Vec<UpdatePhase>>,
    pub progress: Mutex<Vec<ProgressEvent>>,
    pub errors: Mutex<Vec<String>>,
    pub reloads: Mutex<Vec<ResolvedBundle>>,
}

impl RecordingSink {
    pub fn phase_log(&self) -> Vec<UpdatePhase> {
        self.phases.lock().unwrap().clone()
    }

    pub fn progress_log(&self) -> Vec<ProgressEvent> {
        self.progress.lock().unwrap().clone()
    }

    pub fn error_log(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn on_progress(&self, event: &ProgressEvent) {
        self.progress.lock().unwrap().push(event.clone());
    }

    fn on_phase(&self, phase: UpdatePhase) {
        self.phases.lock().unwrap().push(phase);
    }

    fn on_error(&self, error: &UpdateError) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_reload_requested(&self, bundle: &ResolvedBundle) {
        self.reloads.lock().unwrap().push(bundle.clone());
    }
}

// ---------------------------------------------------------------------------
// Fixture HTTP server
// ---------------------------------------------------------------------------

/// How the fixture server treats a request for the payload.
#[derive(Clone)]
pub enum ServeMode {
    /// Serve the complete payload.
    Full,
    /// Declare the full length but drop the connection after this fraction.
    Abort { after_fraction: f64 },
    /// Respond with this HTTP status and an empty body.
    Status(u16),
    /// Serve same-length bytes that do not match the checksum.
    Corrupted,
    /// Serve the payload in fixed-size chunks with a delay between them.
    Drip { chunk_size: usize, delay: Duration },
}

/// Spawn a one-route HTTP server returning its address. Each connection is
/// handled per `mode`; the task lives until the test process exits.
pub async fn serve(payload: Vec<u8>, mode: ServeMode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            let payload = payload.clone();
            let mode = mode.clone();
            tokio::spawn(async move {
                let _ = handle_connection(socket, payload, mode).await;
            });
        }
    });
    addr
}

async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    payload: Vec<u8>,
    mode: ServeMode,
) -> std::io::Result<()> {
    // Drain the request head; a single GET fits comfortably.
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    match mode {
        ServeMode::Full => {
            write_head(&mut socket, 200, payload.len()).await?;
            socket.write_all(&payload).await?;
        }
        ServeMode::Abort { after_fraction } => {
            let n = (payload.len() as f64 * after_fraction) as usize;
            write_head(&mut socket, 200, payload.len()).await?;
            socket.write_all(&payload[..n]).await?;
            socket.flush().await?;
            // Dropping the socket here severs the body mid-transfer.
        }
        ServeMode::Status(status) => {
            write_head(&mut socket, status, 0).await?;
        }
        ServeMode::Corrupted => {
            let mut bogus = payload.clone();
            for byte in bogus.iter_mut() {
                *byte = byte.wrapping_add(1);
            }
            write_head(&mut socket, 200, bogus.len()).await?;
            socket.write_all(&bogus).await?;
        }
        ServeMode::Drip { chunk_size, delay } => {
            write_head(&mut socket, 200, payload.len()).await?;
            for chunk in payload.chunks(chunk_size) {
                socket.write_all(chunk).await?;
                socket.flush().await?;
                tokio::time::sleep(delay).await;
            }
        }
    }
    socket.shutdown().await
}

async fn write_head(
    socket: &mut tokio::net::TcpStream,
    status: u16,
    content_length: usize,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
    );
    socket.write_all(head.as_bytes()).await
}
