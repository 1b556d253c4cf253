//! Isolation backends
//!
//! - `Bubblewrap`: every namespace unshared, read-only system binds, only the
//!   scope writable, fresh /tmp, /proc and /dev
//! - `Unshare`: the child enters new user and network namespaces before exec
//! - `None`: rlimits and process groups only (development hosts)
//!
//! Only bubblewrap keeps concurrent scopes apart: under `Unshare` and `None`
//! the child runs as the engine's uid and can reach sibling scopes through
//! the scratch root or `/proc`. Those backends are refused unless
//! `require_isolation` is turned off.
//!
//! Availability is probed once per process and cached.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::OnceLock;

use nix::sched::{unshare, CloneFlags};
use tokio::process::Command;
use tracing::{info, warn};

use super::config::SandboxConfig;
use crate::error::LaunchError;
use crate::runner::CommandSpec;

const BWRAP: &str = "bwrap";

/// Cached bubblewrap availability
static BWRAP_AVAILABLE: OnceLock<bool> = OnceLock::new();
/// Cached user+network namespace availability
static UNSHARE_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Configured isolation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Best available: bubblewrap, then unshare, then none
    #[default]
    Auto,
    Bubblewrap,
    Unshare,
    None,
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(IsolationMode::Auto),
            "bubblewrap" | "bwrap" => Ok(IsolationMode::Bubblewrap),
            "unshare" | "namespaces" => Ok(IsolationMode::Unshare),
            "none" | "process" => Ok(IsolationMode::None),
            other => Err(format!("unknown isolation mode {:?}", other)),
        }
    }
}

/// Resolved isolation backend used by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    Bubblewrap { ro_binds: Vec<PathBuf> },
    Unshare,
    None,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Isolation::Bubblewrap { .. } => "bubblewrap",
            Isolation::Unshare => "unshare",
            Isolation::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl Isolation {
    /// Whether executed code is cut off from the network
    pub fn isolates_network(&self) -> bool {
        !matches!(self, Isolation::None)
    }

    /// Whether executed code is confined to its own scope (filesystem and pid namespace)
    pub fn isolates_scopes(&self) -> bool {
        matches!(self, Isolation::Bubblewrap { .. })
    }

    /// Whether the child must unshare namespaces itself in `pre_exec`
    pub fn unshares_in_child(&self) -> bool {
        matches!(self, Isolation::Unshare)
    }

    /// Host path `program` resolves to inside the sandbox, searching `path_env`
    /// for bare names. `None` when it is missing, not executable or not bound.
    pub fn locate(&self, program: &str, path_env: &str) -> Option<PathBuf> {
        let candidates: Vec<PathBuf> = if program.contains('/') {
            vec![PathBuf::from(program)]
        } else {
            std::env::split_paths(path_env)
                .map(|dir| dir.join(program))
                .collect()
        };
        candidates
            .into_iter()
            .find(|path| path.is_absolute() && is_executable(path) && self.exposes(path))
    }

    fn exposes(&self, path: &Path) -> bool {
        match self {
            Isolation::Bubblewrap { ro_binds } => ro_binds.iter().any(|bind| path.starts_with(bind)),
            Isolation::Unshare | Isolation::None => true,
        }
    }

    /// Full argv to exec for `cmd`
    pub fn wrap(&self, cmd: &CommandSpec) -> Vec<String> {
        match self {
            Isolation::Bubblewrap { ro_binds } => {
                bwrap_command(ro_binds, cmd.work_dir.as_deref(), &cmd.to_vec())
            }
            Isolation::Unshare | Isolation::None => cmd.to_vec(),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn bwrap_command(ro_binds: &[PathBuf], work_dir: Option<&Path>, argv: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        BWRAP.into(),
        "--unshare-all".into(),
        "--die-with-parent".into(),
    ];

    for path in ro_binds {
        let path = path.display().to_string();
        args.extend(["--ro-bind-try".into(), path.clone(), path]);
    }

    args.extend(
        ["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]
            .into_iter()
            .map(String::from),
    );

    // The scope keeps its host path so HOME and TMPDIR stay valid inside
    if let Some(dir) = work_dir {
        let dir = dir.display().to_string();
        args.extend(["--bind".into(), dir.clone(), dir.clone(), "--chdir".into(), dir]);
    }

    args.push("--".into());
    args.extend(argv.iter().cloned());
    args
}

/// Check if bubblewrap can create a sandbox on this host
pub async fn is_bubblewrap_available() -> bool {
    if let Some(value) = BWRAP_AVAILABLE.get() {
        return *value;
    }

    let probe = Command::new(BWRAP)
        .args(["--unshare-all", "--die-with-parent", "--ro-bind", "/", "/", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    let available = matches!(probe, Ok(status) if status.success());
    let _ = BWRAP_AVAILABLE.set(available);
    available
}

/// Check if unprivileged user and network namespaces can be created
pub async fn is_unshare_available() -> bool {
    if let Some(value) = UNSHARE_AVAILABLE.get() {
        return *value;
    }

    let mut cmd = Command::new("true");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: unshare(2) is async-signal-safe and the closure captures nothing
    unsafe {
        cmd.pre_exec(|| {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
            Ok(())
        });
    }

    let available = matches!(cmd.status().await, Ok(status) if status.success());
    let _ = UNSHARE_AVAILABLE.set(available);
    available
}

/// Pick the isolation backend for this process
pub async fn resolve_isolation(config: &SandboxConfig) -> Result<Isolation, LaunchError> {
    let bubblewrap = || Isolation::Bubblewrap {
        ro_binds: config.ro_binds.clone(),
    };

    let isolation = match config.isolation {
        IsolationMode::Bubblewrap => {
            if !is_bubblewrap_available().await {
                return Err(LaunchError::IsolationUnavailable(
                    "bubblewrap (bwrap) cannot create sandboxes on this host".into(),
                ));
            }
            bubblewrap()
        }
        IsolationMode::Unshare => {
            if !is_unshare_available().await {
                return Err(LaunchError::IsolationUnavailable(
                    "unprivileged user/network namespaces are disabled".into(),
                ));
            }
            Isolation::Unshare
        }
        IsolationMode::None => Isolation::None,
        IsolationMode::Auto => {
            if is_bubblewrap_available().await {
                bubblewrap()
            } else if is_unshare_available().await {
                Isolation::Unshare
            } else {
                Isolation::None
            }
        }
    };

    if config.require_isolation && !isolation.isolates_scopes() {
        return Err(LaunchError::IsolationUnavailable(format!(
            "the {} backend does not keep concurrent submissions apart; \
             install bubblewrap or set SANDBOX_REQUIRE_ISOLATION=false",
            isolation
        )));
    }

    if isolation.isolates_scopes() {
        info!("Sandbox isolation backend: {}", isolation);
    } else if isolation.isolates_network() {
        warn!(
            "Sandbox isolation backend: {} (sibling scopes and host files are reachable)",
            isolation
        );
    } else {
        warn!("Sandbox isolation backend: none (sibling scopes and the network are reachable)");
    }

    Ok(isolation)
}
