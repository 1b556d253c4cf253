//! Shared fixtures for unit tests.
//!
//! The `sh` language table runs every "language" through /bin/sh so sandbox
//! behaviour can be tested on any Unix host. The `c` profile has a compile
//! phase: `sh -n` rejects syntax errors, otherwise the source is copied to the
//! `program` artifact.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::Executor;
use crate::languages::LanguageRegistry;
use crate::runner::SandboxedRunner;
use crate::sandbox::{Isolation, IsolationMode, SandboxConfig};

pub(crate) const SH_LANGUAGES: &str = r#"
[python]
source_file = "main.py"
run_command = ["/bin/sh", "{source}"]
timeout_ms = 2000
memory_mb = 64
env = { GRADER_LANG = "python" }

[c]
source_file = "main.c"
compile_command = ["/bin/sh", "-c", "/bin/sh -n {source} && cp {source} program"]
run_command = ["/bin/sh", "program"]
timeout_ms = 2000
memory_mb = 64
"#;

pub(crate) fn sh_registry() -> Arc<LanguageRegistry> {
    Arc::new(LanguageRegistry::from_toml_str(SH_LANGUAGES).unwrap())
}

pub(crate) fn sh_sandbox_config(root: &Path) -> SandboxConfig {
    SandboxConfig {
        scratch_root: root.to_path_buf(),
        isolation: IsolationMode::None,
        require_isolation: false,
        output_limit_bytes: 16 * 1024,
        compile_time_limit_ms: 5000,
        compile_memory_limit_mb: 256,
        memory_poll_interval: Duration::from_millis(10),
        ..SandboxConfig::default()
    }
}

pub(crate) fn sh_executor(root: &Path, slots: usize) -> Arc<Executor> {
    sh_executor_with(root, slots, Isolation::None)
}

pub(crate) fn sh_executor_with(root: &Path, slots: usize, isolation: Isolation) -> Arc<Executor> {
    let config = sh_sandbox_config(root);
    let runner = SandboxedRunner::from_config(isolation, &config);
    Arc::new(Executor::new(Arc::new(runner), config, slots))
}

/// Whether `name --version` can be executed on this host
pub(crate) fn has_binary(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
