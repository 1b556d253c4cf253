//! Language registry for compilation and execution
//!
//! Maps a `LanguageId` to an immutable `LanguageProfile` loaded once at start-up,
//! either from the embedded `files/languages.toml` or from a file named by
//! `LANGUAGES_CONFIG`. Adding a language only touches this module and its
//! configuration file.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::runner::RunLimits;

const BUILTIN_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

const DEFAULT_TIMEOUT_MS: u32 = 2000;
const DEFAULT_MEMORY_MB: u32 = 256;

/// Languages a submission may be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageId {
    Python,
    Java,
    C,
    Cpp,
    JavaScript,
    Sql,
}

impl LanguageId {
    pub const ALL: [LanguageId; 6] = [
        LanguageId::Python,
        LanguageId::Java,
        LanguageId::C,
        LanguageId::Cpp,
        LanguageId::JavaScript,
        LanguageId::Sql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageId::Python => "python",
            LanguageId::Java => "java",
            LanguageId::C => "c",
            LanguageId::Cpp => "cpp",
            LanguageId::JavaScript => "javascript",
            LanguageId::Sql => "sql",
        }
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LanguageId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        LanguageId::ALL
            .into_iter()
            .find(|id| id.as_str() == name)
            .ok_or_else(|| EngineError::UnsupportedLanguage(s.to_string()))
    }
}

/// Execution profile for a supported language
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    pub id: LanguageId,
    /// Name of the source file (e.g., "main.cpp", "Main.java")
    pub source_file: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Limits used when the request does not carry its own
    pub default_limits: RunLimits,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = requested_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = requested_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Extra environment entries for compile and run
    pub env: Vec<(String, String)>,
    /// Whether RLIMIT_AS can be applied. Runtimes that reserve large virtual
    /// regions up front (JVM, V8) rely on the RSS watchdog instead.
    pub address_space_limit: bool,
}

impl LanguageProfile {
    /// Source file extension without the dot
    pub fn extension(&self) -> &str {
        Path::new(&self.source_file)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }

    pub fn requires_compilation(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Host programs the compile and run commands start with. Relative paths
    /// such as `./main` are build artifacts and are left out.
    pub fn toolchain(&self) -> Vec<&str> {
        self.compile_command
            .iter()
            .chain(std::iter::once(&self.run_command))
            .filter_map(|cmd| cmd.first())
            .map(String::as_str)
            .filter(|program| !program.contains('/') || program.starts_with('/'))
            .collect()
    }

    /// Calculate actual time limit based on the requested time limit
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms,
        }
    }

    /// Calculate actual memory limit based on the requested memory limit
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        }
    }

    /// Limits for one run: the request's limits adjusted for this language,
    /// or the profile defaults when the request has none.
    pub fn effective_limits(&self, requested: Option<&RunLimits>) -> RunLimits {
        match requested {
            Some(limits) => RunLimits::new(
                self.calculate_time_limit(limits.time_ms),
                self.calculate_memory_limit(limits.memory_mb),
            ),
            None => self.default_limits.clone(),
        }
    }

    pub fn render_compile_command(&self, limits: &RunLimits) -> Option<Vec<String>> {
        self.compile_command
            .as_ref()
            .map(|cmd| self.render(cmd, limits))
    }

    pub fn render_run_command(&self, limits: &RunLimits) -> Vec<String> {
        self.render(&self.run_command, limits)
    }

    fn render(&self, template: &[String], limits: &RunLimits) -> Vec<String> {
        let memory = limits.memory_mb.to_string();
        template
            .iter()
            .map(|part| {
                part.replace("{source}", &self.source_file)
                    .replace("{memory_mb}", &memory)
            })
            .collect()
    }
}

/// A command in TOML: either one whitespace-separated line or an argv array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

impl RawCommand {
    fn into_command(self) -> Vec<String> {
        match self {
            RawCommand::Line(line) => line.split_whitespace().map(|s| s.to_string()).collect(),
            RawCommand::Argv(argv) => argv,
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<RawCommand>,
    run_command: RawCommand,
    timeout_ms: Option<u32>,
    memory_mb: Option<u32>,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_address_space_limit")]
    address_space_limit: bool,
}

fn default_address_space_limit() -> bool {
    true
}

/// Immutable lookup table from language id (or alias) to profile
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<LanguageId, Arc<LanguageProfile>>,
    aliases: HashMap<String, LanguageId>,
}

impl LanguageRegistry {
    /// Profiles embedded at build time
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_LANGUAGES).context("Invalid built-in language configuration")
    }

    /// Load profiles from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: BTreeMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut profiles = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, raw) in raw_configs {
            let id: LanguageId = name
                .parse()
                .map_err(|_| anyhow::anyhow!("Unknown language in config: {}", name))?;

            let parse_limit =
                |raw_limit: Vec<String>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let run_command = raw.run_command.into_command();
            if run_command.is_empty() {
                anyhow::bail!("Empty run command for {}", name);
            }
            let compile_command = raw.compile_command.map(RawCommand::into_command);
            if compile_command.as_ref().is_some_and(|cmd| cmd.is_empty()) {
                anyhow::bail!("Empty compile command for {}", name);
            }

            let profile = LanguageProfile {
                id,
                source_file: raw.source_file,
                compile_command,
                run_command,
                default_limits: RunLimits::new(
                    raw.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                    raw.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
                ),
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
                env: raw.env.into_iter().collect(),
                address_space_limit: raw.address_space_limit,
            };

            let names = std::iter::once(id.as_str().to_string())
                .chain(raw.aliases.iter().map(|alias| alias.to_lowercase()));
            for alias in names {
                if let Some(existing) = aliases.insert(alias.clone(), id) {
                    if existing != id {
                        anyhow::bail!("Alias {} is claimed by both {} and {}", alias, existing, id);
                    }
                }
            }

            profiles.insert(id, Arc::new(profile));
        }

        Ok(Self { profiles, aliases })
    }

    /// Profile for a language, or `UnsupportedLanguage` when none is loaded
    pub fn profile_for(&self, id: LanguageId) -> Result<Arc<LanguageProfile>, EngineError> {
        self.profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(id.to_string()))
    }

    /// Resolve a language name or alias (case-insensitive)
    pub fn resolve(&self, name: &str) -> Result<LanguageId, EngineError> {
        self.aliases
            .get(&name.trim().to_lowercase())
            .copied()
            .ok_or_else(|| EngineError::UnsupportedLanguage(name.to_string()))
    }

    /// Drop profiles rejected by `keep`, along with their aliases.
    /// Returns the dropped languages.
    pub fn retain(&mut self, mut keep: impl FnMut(&LanguageProfile) -> bool) -> Vec<LanguageId> {
        let mut dropped: Vec<LanguageId> = self
            .profiles
            .values()
            .filter(|profile| !keep(profile))
            .map(|profile| profile.id)
            .collect();
        dropped.sort();

        self.profiles.retain(|id, _| !dropped.contains(id));
        self.aliases.retain(|_, id| !dropped.contains(id));
        dropped
    }

    /// Languages with a loaded profile, in declaration order of `LanguageId`
    pub fn supported(&self) -> Vec<LanguageId> {
        let mut ids: Vec<LanguageId> = self.profiles.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
run_command = ["python3", "-c", "import runpy; runpy.run_path('{{source}}')"]
aliases = ["py", "python3"]
timeout_ms = 3000
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::from_path(config_file.path()).unwrap();

        assert_eq!(registry.supported(), vec![LanguageId::Python, LanguageId::C]);

        let python = registry.profile_for(LanguageId::Python).unwrap();
        assert_eq!(python.run_command.len(), 3);
        assert_eq!(python.default_limits, RunLimits::new(3000, DEFAULT_MEMORY_MB));
        assert!(!python.requires_compilation());

        let c = registry.profile_for(LanguageId::C).unwrap();
        assert_eq!(c.compile_command.as_deref().map(|cmd| cmd.len()), Some(4));
        assert_eq!(c.extension(), "c");
    }

    #[test]
    fn test_builtin_profiles() {
        let registry = LanguageRegistry::builtin().unwrap();
        assert_eq!(registry.supported(), LanguageId::ALL.to_vec());

        for id in [LanguageId::Java, LanguageId::C, LanguageId::Cpp] {
            assert!(registry.profile_for(id).unwrap().requires_compilation(), "{id}");
        }
        for id in [LanguageId::Python, LanguageId::JavaScript, LanguageId::Sql] {
            assert!(!registry.profile_for(id).unwrap().requires_compilation(), "{id}");
        }

        let java = registry.profile_for(LanguageId::Java).unwrap();
        assert_eq!(java.source_file, "Main.java");
        assert!(!java.address_space_limit);
    }

    #[test]
    fn test_resolve_aliases() {
        let registry = LanguageRegistry::builtin().unwrap();
        assert_eq!(registry.resolve("Python").unwrap(), LanguageId::Python);
        assert_eq!(registry.resolve("py").unwrap(), LanguageId::Python);
        assert_eq!(registry.resolve("c++").unwrap(), LanguageId::Cpp);
        assert_eq!(registry.resolve(" js ").unwrap(), LanguageId::JavaScript);
        assert!(matches!(
            registry.resolve("brainfuck"),
            Err(EngineError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_toolchain_programs() {
        let registry = LanguageRegistry::builtin().unwrap();
        let cpp = registry.profile_for(LanguageId::Cpp).unwrap();
        assert_eq!(cpp.toolchain(), vec!["g++"]);
        let java = registry.profile_for(LanguageId::Java).unwrap();
        assert_eq!(java.toolchain(), vec!["javac", "java"]);
        let python = registry.profile_for(LanguageId::Python).unwrap();
        assert_eq!(python.toolchain(), vec!["python3"]);
    }

    #[test]
    fn test_retain_drops_profiles_and_aliases() {
        let mut registry = LanguageRegistry::builtin().unwrap();
        let dropped = registry.retain(|profile| profile.id != LanguageId::Cpp);

        assert_eq!(dropped, vec![LanguageId::Cpp]);
        assert!(!registry.supported().contains(&LanguageId::Cpp));
        assert!(registry.resolve("c++").is_err());
        assert!(registry.resolve("cpp").is_err());
        assert_eq!(registry.resolve("c").unwrap(), LanguageId::C);
    }

    #[test]
    fn test_missing_profile_is_not_found() {
        let registry = LanguageRegistry::from_path(create_test_config().path()).unwrap();
        assert!(matches!(
            registry.profile_for(LanguageId::Java),
            Err(EngineError::UnsupportedLanguage(name)) if name == "java"
        ));
        assert!(registry.resolve("java").is_err());
    }

    #[test]
    fn test_effective_limits() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.profile_for(LanguageId::Java).unwrap();

        // 1000ms * 2 + 1s, 256MB * 1 + 64MB
        let limits = java.effective_limits(Some(&RunLimits::new(1000, 256)));
        assert_eq!(limits, RunLimits::new(3000, 320));

        let defaults = java.effective_limits(None);
        assert_eq!(defaults, java.default_limits);

        let c = registry.profile_for(LanguageId::C).unwrap();
        assert_eq!(c.effective_limits(Some(&RunLimits::new(200, 64))), RunLimits::new(200, 64));
    }

    #[test]
    fn test_render_commands() {
        let registry = LanguageRegistry::builtin().unwrap();
        let limits = RunLimits::new(1000, 300);

        let java = registry.profile_for(LanguageId::Java).unwrap();
        let run = java.render_run_command(&limits);
        assert!(run.contains(&"-Xmx300m".to_string()));
        let compile = java.render_compile_command(&limits).unwrap();
        assert_eq!(compile.last().map(String::as_str), Some("Main.java"));

        let sql = registry.profile_for(LanguageId::Sql).unwrap();
        let run = sql.render_run_command(&limits);
        assert_eq!(run[0], "sh");
        assert_eq!(run[2], "cat - main.sql | sqlite3 -batch -bail :memory:");
    }

    #[test]
    fn test_rejects_bad_configs() {
        let unknown = r#"
[cobol]
source_file = "main.cob"
run_command = "cobc -x main.cob"
"#;
        assert!(LanguageRegistry::from_toml_str(unknown).is_err());

        let bad_limit = r#"
[c]
source_file = "main.c"
run_command = "./main"
time_limit = ["2"]
"#;
        assert!(LanguageRegistry::from_toml_str(bad_limit).is_err());

        let duplicate_alias = r#"
[c]
source_file = "main.c"
run_command = "./main"
aliases = ["native"]

[cpp]
source_file = "main.cpp"
run_command = "./main"
aliases = ["native"]
"#;
        assert!(LanguageRegistry::from_toml_str(duplicate_alias).is_err());

        let empty_run = r#"
[python]
source_file = "main.py"
run_command = ""
"#;
        assert!(LanguageRegistry::from_toml_str(empty_run).is_err());
    }
}
