use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    sync::oneshot::{self, error::TryRecvError},
    task::JoinHandle,
    time::timeout,
};

use super::{registry::Registration, ExecutableLocator, ProcessRegistry};

pub(crate) const MODEL_ALIASES: &[&str] = &["sonnet", "opus", "haiku"];
pub(crate) const DEFAULT_MODEL: &str = "sonnet";

/// How long a killed process gets to flush what it already wrote.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub(crate) struct QueryRequest {
    pub(crate) prompt: String,
    pub(crate) context: String,
    pub(crate) request_id: u64,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryResult {
    pub(crate) success: bool,
    pub(crate) response: String,
    #[serde(rename = "duration_ms")]
    pub(crate) duration_ms: u64,
    #[serde(rename = "prompt_size")]
    pub(crate) prompt_size: usize,
    pub(crate) model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) requested_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) exit_code: Option<i32>,
    pub(crate) timed_out: bool,
    pub(crate) cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) claude_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stderr: Option<String>,
}

impl QueryResult {
    fn pending(model: String, requested_model: Option<String>, prompt_size: usize) -> Self {
        Self {
            success: false,
            response: String::new(),
            duration_ms: 0,
            prompt_size,
            model,
            requested_model,
            exit_code: None,
            timed_out: false,
            cancelled: false,
            pid: None,
            claude_path: None,
            stderr: None,
        }
    }

    fn failed(mut self, response: String) -> Self {
        self.success = false;
        self.response = response;
        self
    }
}

enum Exit {
    Finished {
        status: std::io::Result<ExitStatus>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    Cancelled,
}

pub(crate) struct QueryService {
    locator: Arc<ExecutableLocator>,
    registry: Arc<ProcessRegistry>,
    timeout: Duration,
    default_model: String,
    prompt_dir: PathBuf,
}

impl QueryService {
    pub(crate) fn new(
        locator: Arc<ExecutableLocator>,
        registry: Arc<ProcessRegistry>,
        timeout: Duration,
        default_model: String,
        prompt_dir: PathBuf,
    ) -> Self {
        Self {
            locator,
            registry,
            timeout,
            default_model,
            prompt_dir,
        }
    }

    /// Runs one prompt through the Claude CLI. Never returns an error: every
    /// failure is described in the result.
    ///
    /// The request is cancellable from the moment this is called, before the
    /// subprocess exists.
    pub(crate) async fn execute(&self, request: QueryRequest) -> QueryResult {
        let (registration, kill_rx) = self.registry.register(request.request_id, None);
        self.execute_registered(request, registration, kill_rx).await
    }

    async fn execute_registered(
        &self,
        request: QueryRequest,
        registration: Registration,
        kill_rx: oneshot::Receiver<()>,
    ) -> QueryResult {
        let full_prompt = compose_prompt(&request.prompt, &request.context);
        let (model, requested_model) =
            resolve_model(request.model.as_deref(), &self.default_model);
        let result = QueryResult::pending(model, requested_model, full_prompt.chars().count());

        let claude_path = match self.locator.locate() {
            Ok(path) => path,
            Err(error) => return result.failed(error.to_string()),
        };

        let prompt_file = match PromptFile::create(&self.prompt_dir, &full_prompt) {
            Ok(file) => file,
            Err(error) => {
                tracing::error!(
                    request_id = request.request_id,
                    %error,
                    "failed to write prompt file"
                );
                return result.failed(format!("Failed to write prompt file: {error}"));
            }
        };

        let tracked = Tracked {
            request_id: request.request_id,
            registration,
            kill_rx,
        };
        let result = self.run(&claude_path, &prompt_file, tracked, result).await;
        prompt_file.close();
        result
    }

    async fn run(
        &self,
        claude_path: &Path,
        prompt_file: &PromptFile,
        tracked: Tracked,
        mut result: QueryResult,
    ) -> QueryResult {
        let Tracked {
            request_id,
            registration,
            mut kill_rx,
        } = tracked;
        result.claude_path = Some(claude_path.to_string_lossy().to_string());
        let started_at = Instant::now();

        let mut kill_closed = false;
        match kill_rx.try_recv() {
            Ok(()) => {
                tracing::info!(request_id, "query cancelled before spawn");
                result.cancelled = true;
                return result.failed("Request cancelled".to_string());
            }
            Err(TryRecvError::Closed) => kill_closed = true,
            Err(TryRecvError::Empty) => {}
        }

        let stdin = match prompt_file.stdin() {
            Ok(stdin) => stdin,
            Err(error) => return result.failed(format!("Failed to open prompt file: {error}")),
        };

        let args = ["-p", "-", "--model", result.model.as_str()];
        let mut command = Command::new(claude_path);
        command
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill also reaches whatever the CLI started.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(
                    request_id,
                    %error,
                    path = %claude_path.display(),
                    "failed to spawn claude"
                );
                return result.failed(format!("Failed to start Claude CLI: {error}"));
            }
        };

        result.pid = child.id();
        registration.attach_pid(result.pid);
        let program = claude_path.to_string_lossy();
        let command_line =
            shlex::try_join(std::iter::once(&*program).chain(args)).unwrap_or_default();
        tracing::info!(
            request_id,
            pid = result.pid,
            model = %result.model,
            prompt_size = result.prompt_size,
            command = %command_line,
            "claude subprocess started"
        );

        let mut stdout_task = child.stdout.take().map(spawn_reader);
        let mut stderr_task = child.stderr.take().map(spawn_reader);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        // Exit alone is not completion: a descendant can keep the pipes open.
        let exit = {
            let finished = async {
                let status = child.wait().await;
                let stdout = join_reader(&mut stdout_task).await;
                let stderr = join_reader(&mut stderr_task).await;
                Exit::Finished {
                    status,
                    stdout,
                    stderr,
                }
            };
            tokio::pin!(finished);

            loop {
                tokio::select! {
                    exit = &mut finished => break exit,
                    _ = &mut deadline => break Exit::TimedOut,
                    signal = &mut kill_rx, if !kill_closed => match signal {
                        Ok(()) => break Exit::Cancelled,
                        // Entry replaced by a reused requestId; nobody can cancel us now.
                        Err(_) => kill_closed = true,
                    },
                }
            }
        };

        let drained = match exit {
            Exit::TimedOut | Exit::Cancelled => {
                terminate(&mut child, result.pid, request_id).await;
                Some(drain(&mut stdout_task, &mut stderr_task).await)
            }
            Exit::Finished { .. } => None,
        };
        drop(registration);
        result.duration_ms = started_at.elapsed().as_millis() as u64;

        match exit {
            Exit::Finished {
                status: Ok(status),
                stdout,
                stderr,
            } => {
                result.exit_code = status.code();
                tracing::info!(
                    request_id,
                    exit_code = result.exit_code,
                    duration_ms = result.duration_ms,
                    "claude subprocess finished"
                );

                if status.success() {
                    result.success = true;
                    result.response = stdout.trim().to_string();
                    return result;
                }

                let detail = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                };
                let code = status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "none (terminated by signal)".to_string());
                result.stderr = Some(stderr.trim_end().to_string());
                result.failed(format!("Claude CLI exited with code {code}: {detail}"))
            }
            Exit::Finished {
                status: Err(error), ..
            } => {
                tracing::error!(request_id, %error, "failed waiting for claude subprocess");
                result.failed(format!("Failed waiting for Claude CLI: {error}"))
            }
            Exit::TimedOut => {
                let secs = self.timeout.as_secs();
                tracing::warn!(
                    request_id,
                    timeout_secs = secs,
                    duration_ms = result.duration_ms,
                    "claude subprocess timed out"
                );
                result.timed_out = true;
                result.stderr = drained
                    .and_then(|(_, stderr)| stderr)
                    .filter(|text| !text.trim().is_empty());
                result.failed(format!(
                    "Request timed out after {secs} seconds. The Claude CLI may be waiting for \
                     authentication or an interactive prompt; run `claude` once in a terminal to \
                     finish setup."
                ))
            }
            Exit::Cancelled => {
                tracing::info!(request_id, "claude subprocess cancelled");
                result.cancelled = true;
                result.failed("Request cancelled".to_string())
            }
        }
    }
}

/// The registry side of one query, handed to the run that owns the child.
struct Tracked {
    request_id: u64,
    registration: Registration,
    kill_rx: oneshot::Receiver<()>,
}

/// Context first, separated from the prompt by a blank line.
pub(crate) fn compose_prompt(prompt: &str, context: &str) -> String {
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("{context}\n\n{prompt}")
    }
}

/// Returns the effective alias, plus the caller's value when it was coerced.
pub(crate) fn resolve_model(requested: Option<&str>, default: &str) -> (String, Option<String>) {
    match requested.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) if MODEL_ALIASES.contains(&value) => (value.to_string(), None),
        Some(value) => {
            tracing::warn!(requested = value, fallback = default, "unknown model alias");
            (default.to_string(), Some(value.to_string()))
        }
        None => (default.to_string(), None),
    }
}

/// The full prompt on disk, fed to the CLI as stdin. Removed on drop; `close`
/// reports removal failures.
struct PromptFile {
    file: NamedTempFile,
}

impl PromptFile {
    fn create(dir: &Path, prompt: &str) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("fire-claude-")
            .suffix(".txt")
            .tempfile_in(dir)?;
        file.write_all(prompt.as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    fn stdin(&self) -> std::io::Result<Stdio> {
        Ok(Stdio::from(self.file.reopen()?))
    }

    fn close(self) {
        let path = self.file.path().to_path_buf();
        if let Err(error) = self.file.close() {
            tracing::warn!(path = %path.display(), %error, "failed to remove prompt file");
        }
    }
}

fn spawn_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes).await;
        bytes
    })
}

/// Waits for a reader, then empties its slot so `drain` skips it.
async fn join_reader(task: &mut Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = task.as_mut() else {
        return String::new();
    };
    let bytes = handle.await.unwrap_or_default();
    *task = None;
    String::from_utf8_lossy(&bytes).to_string()
}

/// Kills the CLI together with its process group. `pid` is the one taken at
/// spawn: the child may already be reaped while its descendants live on.
async fn terminate(child: &mut Child, pid: Option<u32>, request_id: u64) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: signals the group created by `process_group(0)` at spawn.
        if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
            let error = std::io::Error::last_os_error();
            tracing::debug!(request_id, %error, "process group already gone");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(error) = child.kill().await {
        tracing::warn!(request_id, %error, "failed to kill claude subprocess");
    }
}

/// Best effort: whatever the killed process left in its pipes, within
/// `DRAIN_WINDOW`. Readers still blocked afterwards are aborted.
async fn drain(
    stdout_task: &mut Option<JoinHandle<Vec<u8>>>,
    stderr_task: &mut Option<JoinHandle<Vec<u8>>>,
) -> (Option<String>, Option<String>) {
    async fn take(task: &mut Option<JoinHandle<Vec<u8>>>) -> Option<String> {
        let handle = task.as_mut()?;
        let bytes = handle.await.ok()?;
        Some(String::from_utf8_lossy(&bytes).trim_end().to_string())
    }

    let drained = timeout(DRAIN_WINDOW, async {
        let stdout = take(stdout_task).await;
        let stderr = take(stderr_task).await;
        (stdout, stderr)
    })
    .await
    .unwrap_or_default();

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        task.abort();
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::{compose_prompt, resolve_model, DEFAULT_MODEL};

    #[test]
    fn context_precedes_prompt_after_blank_line() {
        assert_eq!(compose_prompt("Summarize", "page text"), "page text\n\nSummarize");
    }

    #[test]
    fn empty_context_uses_prompt_alone() {
        assert_eq!(compose_prompt("Explain this", ""), "Explain this");
    }

    #[test]
    fn known_aliases_are_honored() {
        for alias in ["sonnet", "opus", "haiku"] {
            assert_eq!(resolve_model(Some(alias), DEFAULT_MODEL), (alias.to_string(), None));
        }
    }

    #[test]
    fn unknown_alias_falls_back_and_is_reported() {
        assert_eq!(
            resolve_model(Some("gpt-4"), DEFAULT_MODEL),
            ("sonnet".to_string(), Some("gpt-4".to_string()))
        );
    }

    #[test]
    fn missing_alias_uses_default_silently() {
        assert_eq!(resolve_model(None, "haiku"), ("haiku".to_string(), None));
        assert_eq!(resolve_model(Some("  "), "haiku"), ("haiku".to_string(), None));
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::{QueryRequest, QueryService};
    use crate::{
        services::{ExecutableLocator, ProcessRegistry, Strategy},
        test_support,
    };
    use std::{
        fs,
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, Instant},
    };

    struct Harness {
        bin: tempfile::TempDir,
        prompts: tempfile::TempDir,
        registry: Arc<ProcessRegistry>,
        service: Arc<QueryService>,
    }

    fn harness(script: &str, timeout: Duration) -> Harness {
        let bin = tempfile::tempdir().expect("bin dir");
        let path = test_support::install_stub(bin.path(), script);
        harness_with(bin, Strategy::Configured(path), timeout)
    }

    fn harness_with(bin: tempfile::TempDir, strategy: Strategy, timeout: Duration) -> Harness {
        let prompts = tempfile::tempdir().expect("prompt dir");
        let registry = Arc::new(ProcessRegistry::new());
        let service = Arc::new(QueryService::new(
            Arc::new(ExecutableLocator::new(vec![strategy])),
            registry.clone(),
            timeout,
            "sonnet".to_string(),
            prompts.path().to_path_buf(),
        ));
        Harness {
            bin,
            prompts,
            registry,
            service,
        }
    }

    fn request(prompt: &str, context: &str, model: Option<&str>) -> QueryRequest {
        QueryRequest {
            prompt: prompt.to_string(),
            context: context.to_string(),
            request_id: 1,
            model: model.map(str::to_string),
        }
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    fn dir_is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).expect("read dir").next().is_none()
    }

    const ECHO_STUB: &str = "#!/bin/sh\necho \"args=$*\"\ncat\n";
    const SLEEP_STUB: &str = "#!/bin/sh\nexec sleep 30\n";
    const BACKGROUND_STUB: &str = "#!/bin/sh\nsleep 12 &\necho done\n";

    #[tokio::test]
    async fn pipes_prompt_file_into_cli_stdin() {
        let h = harness(ECHO_STUB, Duration::from_secs(30));
        let result = h
            .service
            .execute(request("What is this?", "Page body", Some("opus")))
            .await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.response, "args=-p - --model opus\nPage body\n\nWhat is this?");
        assert_eq!(result.model, "opus");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.prompt_size, "Page body\n\nWhat is this?".len());
        assert!(dir_is_empty(h.prompts.path()), "prompt file left behind");
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn unknown_model_runs_with_default_alias() {
        let h = harness(ECHO_STUB, Duration::from_secs(30));
        let result = h.service.execute(request("hi", "", Some("gpt-4"))).await;

        assert!(result.success);
        assert!(result.response.starts_with("args=-p - --model sonnet"));
        assert_eq!(result.model, "sonnet");
        assert_eq!(result.requested_model.as_deref(), Some("gpt-4"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_and_stderr() {
        let h = harness(
            "#!/bin/sh\necho 'not logged in' >&2\nexit 3\n",
            Duration::from_secs(30),
        );
        let result = h.service.execute(request("hi", "", None)).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.response.contains("code 3"), "{}", result.response);
        assert!(result.response.contains("not logged in"));
        assert_eq!(result.stderr.as_deref(), Some("not logged in"));
        assert!(dir_is_empty(h.prompts.path()));
    }

    #[tokio::test]
    async fn missing_executable_fails_without_spawning() {
        let bin = tempfile::tempdir().expect("bin dir");
        let strategy = Strategy::Fallback(vec![bin.path().to_path_buf()]);
        let h = harness_with(bin, strategy, Duration::from_secs(30));

        let result = h.service.execute(request("hi", "", None)).await;
        assert!(!result.success);
        assert!(result.pid.is_none());
        assert!(result.response.contains("npm install -g @anthropic-ai/claude-code"));
        assert!(dir_is_empty(h.prompts.path()));
    }

    #[tokio::test]
    async fn timeout_kills_subprocess() {
        let h = harness(SLEEP_STUB, Duration::from_secs(1));
        let result = h.service.execute(request("hi", "", None)).await;

        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.response.contains("timed out after 1 seconds"));
        assert!(result.duration_ms >= 1_000, "{}", result.duration_ms);
        assert!(result.duration_ms < 5_000, "{}", result.duration_ms);
        assert!(!is_alive(result.pid.expect("pid")));
        assert_eq!(h.registry.len(), 0);
        assert!(dir_is_empty(h.prompts.path()));
    }

    #[tokio::test]
    async fn cancel_terminates_running_subprocess() {
        let h = harness(SLEEP_STUB, Duration::from_secs(60));
        let service = h.service.clone();
        let running = tokio::spawn(async move {
            service
                .execute(QueryRequest {
                    request_id: 77,
                    ..request("hi", "", None)
                })
                .await
        });

        for _ in 0..200 {
            if h.registry.pid_of(77).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.registry.cancel(77), "query was never registered");

        let result = running.await.expect("query task");
        assert!(!result.success);
        assert!(result.cancelled);
        assert!(result.duration_ms < 10_000);
        assert!(!is_alive(result.pid.expect("pid")));
        assert!(!h.registry.cancel(77));
    }

    #[tokio::test]
    async fn unreadable_prompt_dir_fails_cleanly() {
        let h = harness(ECHO_STUB, Duration::from_secs(30));
        let missing: PathBuf = h.prompts.path().join("does-not-exist");
        let service = QueryService::new(
            Arc::new(ExecutableLocator::new(vec![Strategy::Configured(
                h.bin.path().join("claude"),
            )])),
            h.registry.clone(),
            Duration::from_secs(30),
            "sonnet".to_string(),
            missing,
        );

        let result = service.execute(request("hi", "", None)).await;
        assert!(!result.success);
        assert!(result.response.starts_with("Failed to write prompt file"));
    }

    #[tokio::test]
    async fn descendant_holding_pipes_is_bounded_by_timeout() {
        let h = harness(BACKGROUND_STUB, Duration::from_secs(2));
        let started = Instant::now();
        let result = h.service.execute(request("hi", "", None)).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.duration_ms >= 2_000, "{}", result.duration_ms);
        assert_eq!(h.registry.len(), 0);
        assert!(dir_is_empty(h.prompts.path()));
    }

    #[tokio::test]
    async fn descendant_holding_pipes_can_still_be_cancelled() {
        let h = harness(BACKGROUND_STUB, Duration::from_secs(60));
        let service = h.service.clone();
        let started = Instant::now();
        let running = tokio::spawn(async move {
            service
                .execute(QueryRequest {
                    request_id: 31,
                    ..request("hi", "", None)
                })
                .await
        });

        // The shell exits at once; only the background sleep keeps stdout open.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.registry.cancel(31), "query unregistered while output pending");

        let result = running.await.expect("query task");
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.duration_ms >= 400, "{}", result.duration_ms);
    }

    #[tokio::test]
    async fn cancel_before_spawn_skips_the_cli() {
        let h = harness("#!/bin/sh\ntouch \"$0.ran\"\n", Duration::from_secs(30));
        let (registration, kill_rx) = h.registry.register(9, None);
        assert!(h.registry.cancel(9));

        let result = h
            .service
            .execute_registered(
                QueryRequest {
                    request_id: 9,
                    ..request("hi", "", None)
                },
                registration,
                kill_rx,
            )
            .await;

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.response, "Request cancelled");
        assert!(result.pid.is_none());
        assert!(!h.bin.path().join("claude.ran").exists(), "stub was spawned");
        assert!(dir_is_empty(h.prompts.path()));
    }
}
