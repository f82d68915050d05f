use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::OnceLock,
};

#[cfg(windows)]
const EXECUTABLE_NAMES: &[&str] = &["claude.cmd", "claude.exe", "claude"];
#[cfg(not(windows))]
const EXECUTABLE_NAMES: &[&str] = &["claude"];

/// Where a candidate directory comes from. Evaluated in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
enum FallbackRoot {
    Absolute(&'static str),
    Home(&'static str),
    EnvVar(&'static str, &'static str),
}

#[cfg(target_os = "linux")]
const FALLBACK_DIRS: &[FallbackRoot] = &[
    FallbackRoot::Home(".local/bin"),
    FallbackRoot::Home(".npm-global/bin"),
    FallbackRoot::Home(".claude/local"),
    FallbackRoot::Home(".volta/bin"),
    FallbackRoot::Absolute("/usr/local/bin"),
    FallbackRoot::Absolute("/usr/bin"),
    FallbackRoot::Absolute("/snap/bin"),
];

#[cfg(target_os = "macos")]
const FALLBACK_DIRS: &[FallbackRoot] = &[
    FallbackRoot::Absolute("/opt/homebrew/bin"),
    FallbackRoot::Absolute("/usr/local/bin"),
    FallbackRoot::Home(".npm-global/bin"),
    FallbackRoot::Home(".local/bin"),
    FallbackRoot::Home(".claude/local"),
    FallbackRoot::Home(".volta/bin"),
];

#[cfg(windows)]
const FALLBACK_DIRS: &[FallbackRoot] = &[
    FallbackRoot::EnvVar("APPDATA", "npm"),
    FallbackRoot::EnvVar("LOCALAPPDATA", "Programs\\claude"),
    FallbackRoot::Home(".local\\bin"),
];

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const FALLBACK_DIRS: &[FallbackRoot] = &[
    FallbackRoot::Home(".local/bin"),
    FallbackRoot::Absolute("/usr/local/bin"),
];

/// One step of the lookup, tried in order until a candidate exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Explicit path from `CLAUDE_CLI_BIN`.
    Configured(PathBuf),
    /// Every entry of the search path variable.
    SearchPath(Option<OsString>),
    /// Package-manager install locations for this platform.
    Fallback(Vec<PathBuf>),
}

impl Strategy {
    fn label(&self) -> &'static str {
        match self {
            Self::Configured(_) => "configured",
            Self::SearchPath(_) => "PATH",
            Self::Fallback(_) => "fallback",
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        match self {
            Self::Configured(path) => vec![path.clone()],
            Self::SearchPath(Some(raw)) => with_executable_names(env::split_paths(raw)),
            Self::SearchPath(None) => Vec::new(),
            Self::Fallback(dirs) => with_executable_names(dirs.iter().cloned()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Configured(path) => format!("CLAUDE_CLI_BIN={}", path.display()),
            Self::SearchPath(_) => "PATH".to_string(),
            Self::Fallback(dirs) => dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Claude CLI not found. Searched: {}. Install it with `npm install -g @anthropic-ai/claude-code`, or set CLAUDE_CLI_BIN to its full path.",
    .searched.join("; ")
)]
pub(crate) struct LocateError {
    pub(crate) searched: Vec<String>,
}

pub(crate) struct ExecutableLocator {
    strategies: Vec<Strategy>,
    resolved: OnceLock<PathBuf>,
}

impl ExecutableLocator {
    pub(crate) fn new(strategies: Vec<Strategy>) -> Self {
        Self {
            strategies,
            resolved: OnceLock::new(),
        }
    }

    /// Configured override first, then the search path, then the platform's
    /// package-manager directories.
    pub(crate) fn from_env(configured: Option<PathBuf>) -> Self {
        let mut strategies = Vec::new();
        if let Some(path) = configured {
            strategies.push(Strategy::Configured(path));
        }
        strategies.push(Strategy::SearchPath(env::var_os("PATH")));
        strategies.push(Strategy::Fallback(fallback_dirs()));
        Self::new(strategies)
    }

    /// Only a hit is cached; a miss is searched again on the next call.
    pub(crate) fn locate(&self) -> Result<PathBuf, LocateError> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }

        for strategy in &self.strategies {
            if let Some(found) = strategy.candidates().into_iter().find(|c| is_executable(c)) {
                tracing::info!(
                    path = %found.display(),
                    strategy = strategy.label(),
                    "resolved claude executable"
                );
                return Ok(self.resolved.get_or_init(|| found).clone());
            }
        }

        let searched = self
            .strategies
            .iter()
            .map(Strategy::describe)
            .filter(|entry| !entry.is_empty())
            .collect::<Vec<_>>();
        tracing::warn!(searched = ?searched, "claude executable not found");
        Err(LocateError { searched })
    }
}

fn fallback_dirs() -> Vec<PathBuf> {
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from);

    FALLBACK_DIRS
        .iter()
        .filter_map(|root| match root {
            FallbackRoot::Absolute(dir) => Some(PathBuf::from(dir)),
            FallbackRoot::Home(rel) => home.as_ref().map(|home| home.join(rel)),
            FallbackRoot::EnvVar(var, rel) => {
                env::var_os(var).map(|base| PathBuf::from(base).join(rel))
            }
        })
        .collect()
}

fn with_executable_names(dirs: impl Iterator<Item = PathBuf>) -> Vec<PathBuf> {
    dirs.filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| EXECUTABLE_NAMES.iter().map(move |name| dir.join(name)))
        .collect()
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
