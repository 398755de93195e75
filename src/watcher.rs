use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::load_config;
use crate::policy::Policy;

/// Watch the configuration file and swap a freshly validated policy in on
/// every change. A bad edit never touches the running policy.
pub fn spawn(path: PathBuf, policy: Arc<ArcSwap<Policy>>) {
    // The watcher lives on a plain thread; notify's callbacks are blocking.
    std::thread::spawn(move || {
        if let Err(err) = watch_loop(&path, &policy) {
            error!(target = "watcher", error = %err, "config watcher stopped");
        }
    });
}

fn watch_loop(path: &Path, policy: &ArcSwap<Policy>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    info!(target = "watcher", path = %path.display(), "watching configuration");

    for event in rx {
        if let Err(err) = event {
            warn!(target = "watcher", error = %err, "watch event error");
            continue;
        }
        match reload(path) {
            Ok(fresh) => {
                policy.store(Arc::new(fresh));
                info!(target = "watcher", path = %path.display(), "configuration reloaded");
            }
            Err(err) => {
                warn!(target = "watcher", path = %path.display(), error = %err, "reload rejected, keeping active configuration");
            }
        }
    }
    Ok(())
}

/// Editors often truncate before writing; retry briefly before giving up on
/// this round of changes.
fn reload(path: &Path) -> Result<Policy, crate::error::ConfigError> {
    let attempt = || load_config(path, true).and_then(|raw| Policy::from_config(&raw));
    let mut result = attempt();
    for _ in 0..2 {
        if result.is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
        result = attempt();
    }
    result
}
