use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conversation::PollPolicy;
use crate::probe::Comparison;

pub const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".patchwarden";

#[derive(Debug, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "local".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            environment: default_environment(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_secret() -> String {
    "openai-key".to_string()
}

fn default_poll_initial_delay_millis() -> u64 {
    1000
}

fn default_poll_max_retries() -> u32 {
    12
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Conversation service endpoint and polling limits.
#[derive(Debug, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name handed to the secret source to obtain the API key.
    #[serde(default = "default_api_key_secret")]
    pub api_key_secret: String,
    #[serde(default = "default_poll_initial_delay_millis")]
    pub poll_initial_delay_millis: u64,
    #[serde(default = "default_poll_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_secret: default_api_key_secret(),
            poll_initial_delay_millis: default_poll_initial_delay_millis(),
            max_retries: default_poll_max_retries(),
            timeout_secs: default_poll_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ConversationConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(self.poll_initial_delay_millis),
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    vec!["-I".to_string()]
}

fn default_sandbox_timeout_secs() -> u64 {
    120
}

fn default_pass_env() -> Vec<String> {
    ["PATH", "HOME", "LANG", "SYSTEMROOT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Interpreter used for probes and candidate execution.
#[derive(Debug, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_interpreter_args")]
    pub args: Vec<String>,
    /// Optional containment prefix, e.g. `["bwrap", "--ro-bind", "/", "/"]`.
    #[serde(default)]
    pub wrapper: Vec<String>,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variables copied into the child; everything else is cleared.
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            args: default_interpreter_args(),
            wrapper: Vec::new(),
            timeout_secs: default_sandbox_timeout_secs(),
            pass_env: default_pass_env(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_user_agent() -> String {
    format!("patchwarden/{}", env!("CARGO_PKG_VERSION"))
}

fn default_page_timeout_secs() -> u64 {
    30
}

fn default_chunk_chars() -> usize {
    250_000
}

#[derive(Debug, Deserialize)]
pub struct PageConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_page_timeout_secs")]
    pub timeout_secs: u64,
    /// Pages longer than this are sent to the collaborator in several turns.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_page_timeout_secs(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

fn default_alert_log_file() -> String {
    "alerts.jsonl".to_string()
}

fn default_alert_batch_size() -> usize {
    32
}

fn default_alert_flush_interval_millis() -> u64 {
    2000
}

fn default_alert_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct AlertsConfig {
    /// Relative to the `.patchwarden` state directory.
    #[serde(default = "default_alert_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub endpoint_key_secret: Option<String>,
    #[serde(default = "default_alert_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_alert_flush_interval_millis")]
    pub flush_interval_millis: u64,
    #[serde(default = "default_alert_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            log_file: default_alert_log_file(),
            endpoint: None,
            endpoint_key_secret: None,
            batch_size: default_alert_batch_size(),
            flush_interval_millis: default_alert_flush_interval_millis(),
            request_timeout_secs: default_alert_request_timeout_secs(),
        }
    }
}

impl AlertsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SecretProvider {
    #[default]
    Env,
    Command,
}

/// Where credentials come from.
///
/// ```toml
/// [secrets]
/// provider = "command"
/// command = ["az", "keyvault", "secret", "show", "--vault-name", "kv", "--query", "value", "-o", "tsv", "--name"]
/// ```
#[derive(Debug, Deserialize, Default)]
pub struct SecretsConfig {
    #[serde(default)]
    pub provider: SecretProvider,
    /// Secret name is appended as the last argument.
    #[serde(default)]
    pub command: Vec<String>,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_token_secret() -> String {
    "github-pat".to_string()
}

#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PublishConfig {
    #[default]
    None,
    Git {
        #[serde(default = "default_remote")]
        remote: String,
        #[serde(default = "default_branch")]
        branch: String,
    },
    Github {
        owner: String,
        repo: String,
        #[serde(default = "default_branch")]
        branch: String,
        /// Path inside the repository; defaults to the target file name.
        #[serde(default)]
        path: Option<String>,
        #[serde(default = "default_github_token_secret")]
        token_secret: String,
        #[serde(default = "default_github_api")]
        api_base: String,
    },
}

impl PublishConfig {
    pub fn label(&self) -> &'static str {
        match self {
            PublishConfig::None => "none",
            PublishConfig::Git { .. } => "git",
            PublishConfig::Github { .. } => "github",
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeployConfig {
    #[default]
    None,
    /// Bump the modification time of a file the host watches (e.g. `web.config`).
    Touch { path: PathBuf },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl DeployConfig {
    pub fn label(&self) -> &'static str {
        match self {
            DeployConfig::None => "none",
            DeployConfig::Touch { .. } => "touch",
            DeployConfig::Command { .. } => "command",
        }
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_target_file() -> PathBuf {
    PathBuf::from("Streamlit_app.py")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("backups")
}

fn default_commit_message() -> String {
    "patchwarden: replaced drifted extraction routine".to_string()
}

fn default_publish_timeout_secs() -> u64 {
    30
}

/// One deployment profile. Relative paths resolve against the project root.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    /// File holding the protected routines, relative to `source_root`.
    #[serde(default = "default_target_file")]
    pub target_file: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    /// Request timeout for publishers that talk to a remote API.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            target_file: default_target_file(),
            backup_dir: default_backup_dir(),
            commit_message: default_commit_message(),
            publish_timeout_secs: default_publish_timeout_secs(),
            publish: PublishConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

/// An environment with every path made absolute.
#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub name: String,
    pub source_root: PathBuf,
    pub target_file: PathBuf,
    pub backup_dir: PathBuf,
    pub commit_message: String,
    pub publish_timeout: Duration,
    pub publish: PublishConfig,
    pub deploy: DeployConfig,
}

impl ResolvedEnvironment {
    /// Python module name of the target file.
    pub fn module_name(&self) -> String {
        self.target_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum JudgeInput {
    /// Judge the actual output against the live page content.
    #[default]
    Page,
    /// Judge the actual output against the literal reference.
    Reference,
}

/// A protected routine and its fixed check.
///
/// ```toml
/// [[probes]]
/// name = "top-5-links"
/// routine = "get_top_5_links"
/// argument = "How to rotate in viewport"
/// reference = ["https://...", "https://..."]
/// page_url = "https://help.example.com/?query=how%20to%20rotate%20in%20viewport"
/// verification_assistant = "env:TOP_5_LINKS_VERIFICATION_ASSISTANT"
/// repair_assistant = "env:TOP_5_LINKS_RETRIEVAL_CODE_CORRECTION_ASSISTANT"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    pub routine: String,
    #[serde(default)]
    pub description: Option<String>,
    pub argument: serde_json::Value,
    pub reference: serde_json::Value,
    #[serde(default)]
    pub compare: Comparison,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub judge: JudgeInput,
    pub verification_assistant: String,
    pub repair_assistant: String,
    /// Names for the positions of tuple-shaped results, used in prompts.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub page: PageConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.patchwarden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config.validate()?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.name.as_str()) {
                bail!("duplicate probe name '{}'", probe.name);
            }
            if probe.judge == JudgeInput::Page && probe.page_url.is_none() {
                bail!(
                    "probe '{}' judges against the page but has no page_url",
                    probe.name
                );
            }
        }
        Ok(())
    }

    /// Pick an environment by name (or the configured default) and anchor its
    /// paths at `project_root`. The built-in `local` profile is used when the
    /// config file declares none.
    pub fn environment(&self, name: Option<&str>, project_root: &Path) -> Result<ResolvedEnvironment> {
        let name = name.unwrap_or(&self.defaults.environment);
        let fallback = EnvironmentConfig::default();
        let env = match self.environments.get(name) {
            Some(env) => env,
            None if self.environments.is_empty() && name == default_environment() => &fallback,
            None => bail!(
                "unknown environment '{}' (configured: {})",
                name,
                self.environments
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };

        let source_root = anchor(project_root, &env.source_root);
        Ok(ResolvedEnvironment {
            name: name.to_string(),
            target_file: anchor(&source_root, &env.target_file),
            backup_dir: anchor(project_root, &env.backup_dir),
            source_root,
            commit_message: env.commit_message.clone(),
            publish_timeout: Duration::from_secs(env.publish_timeout_secs),
            publish: env.publish.clone(),
            deploy: env.deploy.clone(),
        })
    }
}

impl ProjectConfig {
    /// Probes named in `names`, in config order; all probes when `names` is empty.
    pub fn select_probes(&self, names: &[String]) -> Result<Vec<ProbeConfig>> {
        for name in names {
            if !self.probes.iter().any(|p| &p.name == name) {
                bail!("unknown probe '{name}'");
            }
        }
        Ok(self
            .probes
            .iter()
            .filter(|p| names.is_empty() || names.contains(&p.name))
            .cloned()
            .collect())
    }
}

impl ProbeConfig {
    /// Copy with `env:` assistant references replaced by their values.
    pub fn resolved(&self) -> Result<ProbeConfig> {
        let mut probe = self.clone();
        probe.verification_assistant = resolve_setting(&self.verification_assistant)
            .with_context(|| format!("probe '{}': verification_assistant", self.name))?;
        probe.repair_assistant = resolve_setting(&self.repair_assistant)
            .with_context(|| format!("probe '{}': repair_assistant", self.name))?;
        Ok(probe)
    }
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve a setting that may reference the process environment as `env:NAME`.
pub fn resolve_setting(value: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .with_context(|| format!("environment variable {var} is not set")),
        None => Ok(value.to_string()),
    }
}
