use std::{
    env,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod dispatch;
mod framing;
mod services;
#[cfg(test)]
mod test_support;

use framing::{FrameError, FrameReader, FrameWriter};
use services::{query, ExecutableLocator, ProcessRegistry, QueryService};

const LOG_FILE_PREFIX: &str = "fire-claude-bridge";
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 180;

#[derive(Clone, Debug)]
struct BridgeConfig {
    cli_bin: Option<PathBuf>,
    query_timeout: Duration,
    default_model: String,
    log_dir: PathBuf,
    prompt_dir: PathBuf,
}

impl BridgeConfig {
    fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let cli_bin = read("CLAUDE_CLI_BIN").map(PathBuf::from);
        let query_timeout = read("BRIDGE_QUERY_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS));
        let default_model = read("BRIDGE_DEFAULT_MODEL")
            .filter(|model| query::MODEL_ALIASES.contains(&model.as_str()))
            .unwrap_or_else(|| query::DEFAULT_MODEL.to_string());
        let log_dir = read("BRIDGE_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        Self {
            cli_bin,
            query_timeout,
            default_model,
            log_dir,
            prompt_dir: env::temp_dir(),
        }
    }
}

struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    locator: Arc<ExecutableLocator>,
    registry: Arc<ProcessRegistry>,
    query: Arc<QueryService>,
}

impl AppState {
    fn new(config: BridgeConfig, locator: ExecutableLocator) -> Arc<Self> {
        let config = Arc::new(config);
        let locator = Arc::new(locator);
        let registry = Arc::new(ProcessRegistry::new());
        let query = Arc::new(QueryService::new(
            locator.clone(),
            registry.clone(),
            config.query_timeout,
            config.default_model.clone(),
            config.prompt_dir.clone(),
        ));

        Arc::new(Self {
            config,
            started_at: Instant::now(),
            locator,
            registry,
            query,
        })
    }
}

#[derive(Debug)]
struct BridgeError {
    code: &'static str,
    message: String,
}

impl BridgeError {
    fn invalid_params(message: &str) -> Self {
        Self {
            code: "invalid_params",
            message: message.to_string(),
        }
    }

    fn unknown_action(action: &str) -> Self {
        let action = if action.is_empty() { "<missing>" } else { action };
        Self {
            code: "unknown_action",
            message: format!("Unknown action: {action}"),
        }
    }

    fn server(message: &str) -> Self {
        Self {
            code: "internal",
            message: message.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let config = BridgeConfig::from_env();
    let _log_guard = init_logging(&config.log_dir);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        timeout_secs = config.query_timeout.as_secs(),
        default_model = %config.default_model,
        cli_bin = ?config.cli_bin,
        "bridge starting"
    );

    let locator = ExecutableLocator::from_env(config.cli_bin.clone());
    let state = AppState::new(config, locator);
    run(tokio::io::stdin(), tokio::io::stdout(), state).await;

    tracing::info!("bridge exiting");
}

/// Logs go to an append-only file plus stderr. Never stdout: that is the
/// protocol channel.
fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(false);

    let appender = open_log_file(log_dir).or_else(|error| {
        eprintln!("cannot open log in {}: {error}", log_dir.display());
        open_log_file(&env::temp_dir())
    });

    match appender {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            let installed = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            installed.ok().map(|_| guard)
        }
        Err(error) => {
            eprintln!("file logging disabled: {error}");
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}

fn open_log_file(dir: &Path) -> Result<RollingFileAppender, String> {
    std::fs::create_dir_all(dir).map_err(|error| error.to_string())?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|error| error.to_string())
}

fn default_log_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(env::temp_dir)
}

/// Reads frames until end of stream. Query actions run on their own tasks so
/// a `cancel` can be read while they wait on the CLI; everything else is
/// answered inline. All responses funnel through one writer task.
async fn run<R, W>(reader: R, writer: W, state: Arc<AppState>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        let mut frames = FrameWriter::new(writer);
        while let Some(payload) = rx.recv().await {
            if let Err(error) = frames.write_frame(&payload).await {
                tracing::error!(%error, "failed to write response frame");
                if matches!(error, FrameError::Io(_)) {
                    break;
                }
            }
        }
    });

    let mut frames = FrameReader::new(reader);
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.try_join_next().is_some() {}

        match frames.read_frame().await {
            Ok(Some(frame)) => dispatch_frame(frame, &state, &tx, &mut in_flight).await,
            Ok(None) => break,
            Err(FrameError::Json(error)) => {
                tracing::warn!(%error, "malformed frame");
                send(&tx, frame_error(&format!("Malformed message: {error}")));
            }
            Err(error @ FrameError::Truncated { .. }) => {
                tracing::warn!(%error, "input ended mid-frame");
                send(&tx, frame_error(&error.to_string()));
                break;
            }
            Err(error) => {
                tracing::error!(%error, "failed reading input");
                send(&tx, frame_error(&error.to_string()));
                break;
            }
        }
    }

    let tracked = state.registry.len();
    let signalled = state.registry.cancel_all();
    tracing::info!(
        in_flight = in_flight.len(),
        tracked,
        signalled,
        "input closed, waiting for running queries"
    );
    while in_flight.join_next().await.is_some() {}

    drop(tx);
    if writer_task.await.is_err() {
        tracing::error!("response writer task failed");
    }
}

async fn dispatch_frame(
    frame: Value,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<Value>,
    in_flight: &mut JoinSet<()>,
) {
    let request_id = frame.get("requestId").cloned().unwrap_or(Value::Null);
    let action = read_string(frame.get("action")).unwrap_or_default();
    tracing::info!(action = %action, request_id = %request_id, "request received");

    if !dispatch::is_query_action(&action) {
        send(tx, dispatch::handle(state, frame).await);
        return;
    }

    let state = Arc::clone(state);
    let tx = tx.clone();
    in_flight.spawn(async move {
        let response = match AssertUnwindSafe(dispatch::handle(&state, frame))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                tracing::error!(action = %action, request_id = %request_id, "query task panicked");
                dispatch::failure(
                    &request_id,
                    &action,
                    &BridgeError::server("internal error while handling request"),
                )
            }
        };
        send(&tx, response);
    });
}

fn send(tx: &mpsc::UnboundedSender<Value>, payload: Value) {
    if tx.send(payload).is_err() {
        tracing::error!("response dropped: writer is gone");
    }
}

/// Frames that could not be decoded have no `requestId` to echo.
fn frame_error(message: &str) -> Value {
    json!({
        "success": false,
        "error": message,
    })
}

fn parse_request_id(value: Option<&Value>) -> Option<u64> {
    let value = value?;

    if let Some(number) = value.as_u64() {
        return Some(number);
    }

    if let Some(raw) = value.as_str() {
        return raw.trim().parse::<u64>().ok();
    }

    None
}

fn read_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
