use std::{path::Path, sync::Arc, time::Duration};

use crate::{
    services::{ExecutableLocator, Strategy},
    AppState, BridgeConfig,
};

pub(crate) fn state(
    strategies: Vec<Strategy>,
    timeout: Duration,
    prompt_dir: &Path,
) -> Arc<AppState> {
    let config = BridgeConfig {
        query_timeout: timeout,
        prompt_dir: prompt_dir.to_path_buf(),
        ..BridgeConfig::from_lookup(|_| None)
    };
    AppState::new(config, ExecutableLocator::new(strategies))
}

/// Writes an executable `claude` script into `dir`.
#[cfg(unix)]
pub(crate) fn install_stub(dir: &Path, script: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("claude");
    std::fs::write(&path, script).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}
