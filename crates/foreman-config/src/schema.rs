use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.2
}

/// Provider wire-format family.
///
/// Determines which HTTP driver the gateway constructs and, when the
/// provider's `tool_mode` is `auto`, which tool-calling strategy is used
/// (OpenAI / Anthropic / DeepSeek are reliable at native structured tool
/// calls; Ollama-class local servers are not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Openai,
    Anthropic,
    Ollama,
    Deepseek,
    /// Any other OpenAI-compatible endpoint.
    Other,
}

impl Default for ProviderFamily {
    fn default() -> Self {
        Self::Openai
    }
}

/// Tool-calling strategy for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Structured tool calls over the provider API.
    Native,
    /// Tool calls carried as `<tool_code>` blocks inside message text.
    XmlFallback,
    /// Pick per family: native for openai/anthropic/deepseek, xml_fallback
    /// for ollama-class providers.
    Auto,
}

impl Default for ToolMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// How willing a role is to interrupt the user with questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Always allowed to ask (subject to mode gating and the per-turn limit).
    Supervised,
    /// Ask once for plan approval, then proceed.
    Balanced,
    /// Never ask; questions are auto-answered with a "proceeding" result.
    Autonomous,
}

impl Default for AutonomyLevel {
    fn default() -> Self {
        Self::Balanced
    }
}

/// One model provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub family: ProviderFamily,
    /// Base URL override.  Hosted providers have sensible defaults; local
    /// servers (ollama, llama.cpp) must set this.
    pub base_url: Option<String>,
    /// Environment variable that holds the API key, read per call.  A missing
    /// credential surfaces as an error on the call that needed it, never at
    /// startup.
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub tool_mode: ToolMode,
    pub default_model: String,
}

/// One tool-server child process (line-delimited JSON-RPC over stdio).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One LLM role (architect, developer, reviewer, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    /// Key into [`Config::providers`].
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Tool names this role may ever see.  The session mode filter narrows
    /// this further per phase.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    /// Tool-server names activated for this role.
    #[serde(default)]
    pub tool_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub tool_servers: HashMap<String, ToolServerConfig>,
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    #[serde(default = "default_active_role")]
    pub active_role: String,
}

fn default_active_role() -> String {
    "architect".into()
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Self {
            providers: HashMap::new(),
            tool_servers: HashMap::new(),
            roles: HashMap::new(),
            active_role: default_active_role(),
        };
        cfg.ensure_defaults();
        cfg
    }
}

const FULL_TOOLSET: &[&str] = &[
    "list_directory",
    "read_file",
    "glob",
    "search_file_content",
    "write_file",
    "run_shell_command",
    "delegate_task",
    "ask_user",
    "request_admin_privileges",
];

impl Config {
    /// Populate missing sections with the built-in defaults: three providers,
    /// one stdio tool server, and the architect / developer / reviewer roles.
    ///
    /// Sections the user has already defined are left untouched.
    pub fn ensure_defaults(&mut self) {
        if self.providers.is_empty() {
            self.providers.insert(
                "openai".into(),
                ProviderConfig {
                    name: "openai".into(),
                    family: ProviderFamily::Openai,
                    base_url: None,
                    api_key_env: Some("OPENAI_API_KEY".into()),
                    tool_mode: ToolMode::Auto,
                    default_model: "gpt-4o".into(),
                },
            );
            self.providers.insert(
                "anthropic".into(),
                ProviderConfig {
                    name: "anthropic".into(),
                    family: ProviderFamily::Anthropic,
                    base_url: None,
                    api_key_env: Some("ANTHROPIC_API_KEY".into()),
                    tool_mode: ToolMode::Auto,
                    default_model: "claude-3-5-sonnet-20241022".into(),
                },
            );
            self.providers.insert(
                "ollama_local".into(),
                ProviderConfig {
                    name: "ollama_local".into(),
                    family: ProviderFamily::Ollama,
                    base_url: Some("http://localhost:11434/v1".into()),
                    api_key_env: None,
                    tool_mode: ToolMode::Auto,
                    default_model: "qwen2.5-coder:latest".into(),
                },
            );
        }

        if self.tool_servers.is_empty() {
            self.tool_servers.insert(
                "workspace_fs".into(),
                ToolServerConfig {
                    name: "workspace_fs".into(),
                    command: "foreman-fs-server".into(),
                    args: vec![],
                    env: HashMap::new(),
                    enabled: true,
                },
            );
        }

        if self.roles.is_empty() {
            let tools: Vec<String> = FULL_TOOLSET.iter().map(|s| s.to_string()).collect();
            self.roles.insert(
                "architect".into(),
                RoleConfig {
                    name: "architect".into(),
                    provider: "anthropic".into(),
                    model: "claude-3-5-sonnet-20241022".into(),
                    system_prompt: "You are a System Architect. Research the workspace, \
                                    design a plan, and delegate implementation work to the \
                                    development team."
                        .into(),
                    temperature: 0.2,
                    allowed_tools: tools.clone(),
                    autonomy: AutonomyLevel::Balanced,
                    tool_servers: vec!["workspace_fs".into()],
                },
            );
            self.roles.insert(
                "developer".into(),
                RoleConfig {
                    name: "developer".into(),
                    provider: "ollama_local".into(),
                    model: "qwen2.5-coder:latest".into(),
                    system_prompt: "You are an expert Developer. Write clean, working code \
                                    with the tools provided. Report exactly what you did."
                        .into(),
                    temperature: 0.2,
                    allowed_tools: tools.clone(),
                    autonomy: AutonomyLevel::Autonomous,
                    tool_servers: vec!["workspace_fs".into()],
                },
            );
            self.roles.insert(
                "reviewer".into(),
                RoleConfig {
                    name: "reviewer".into(),
                    provider: "ollama_local".into(),
                    model: "qwen2.5-coder:latest".into(),
                    system_prompt: "You are a strict Reviewer. Verify delivered work against \
                                    its specification. Approve only work that genuinely meets \
                                    the goal."
                        .into(),
                    temperature: 0.0,
                    allowed_tools: tools,
                    autonomy: AutonomyLevel::Autonomous,
                    tool_servers: vec!["workspace_fs".into()],
                },
            );
        }
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.get(name)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// First provider other than `current` and not in `exclude`, used by the
    /// session's failover policy.  Iteration order is made deterministic by
    /// sorting on the provider key.
    pub fn fallback_provider(&self, current: &str, exclude: &[String]) -> Option<&ProviderConfig> {
        let mut keys: Vec<&String> = self.providers.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| &self.providers[k])
            .find(|p| p.name != current && !exclude.iter().any(|e| e == &p.name))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
