//! Troupe configuration
//!
//! Provider, runtime, shell and agent settings in one TOML file. Missing
//! sections fall back to their defaults, and so does an unreadable file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use troupe_agent::{
    Agent, AgentGraph, CompactionConfig, PermissionsConfig, RuntimeConfig, SuggestionsConfig,
};
use troupe_core::{Error, Result};
use troupe_llm::{AnthropicProvider, LlmProvider, ModelOptions, Pricing};
use troupe_tools::{ShellConfig, ShellToolSet, ToolSet};

/// Tool set name agents use to get `shell` and `get_logs`.
pub const SHELL_TOOLSET: &str = "shell";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TroupeConfig {
    pub provider: ProviderConfig,
    pub runtime: RuntimeSection,
    pub shell: ShellSection,
    /// Tool permissions applied to new sessions.
    pub permissions: PermissionsConfig,
    /// The first agent is the root.
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Only "anthropic" is built in.
    pub kind: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_iterations: usize,
    pub event_buffer: usize,
    pub compaction: CompactionSection,
    pub suggestions: SuggestionsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSection {
    pub enabled: bool,
    pub threshold_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionsSection {
    pub enabled: bool,
    pub max_count: usize,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    /// Seconds a command may run before it is moved to the background.
    pub quick_timeout_secs: u64,
    /// Program and leading arguments, e.g. `["bash", "-c"]`. Empty means the
    /// platform default.
    pub shell: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub sub_agents: Vec<String>,
    /// Tool set names; see [`SHELL_TOOLSET`].
    pub toolsets: Vec<String>,
    pub add_date: bool,
    pub add_environment_info: bool,
    pub num_history_items: Option<usize>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: None,
            temperature: None,
            pricing: None,
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            max_iterations: runtime.max_iterations,
            event_buffer: runtime.event_buffer,
            compaction: CompactionSection::default(),
            suggestions: SuggestionsSection::default(),
        }
    }
}

impl Default for CompactionSection {
    fn default() -> Self {
        let compaction = CompactionConfig::default();
        Self {
            enabled: compaction.enabled,
            threshold_tokens: compaction.threshold_tokens,
        }
    }
}

impl Default for SuggestionsSection {
    fn default() -> Self {
        let suggestions = SuggestionsConfig::default();
        Self {
            enabled: suggestions.enabled,
            max_count: suggestions.max_count,
            timeout_ms: suggestions.timeout.as_millis() as u64,
            max_tokens: suggestions.max_tokens,
        }
    }
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            quick_timeout_secs: troupe_tools::process::DEFAULT_QUICK_TIMEOUT.as_secs(),
            shell: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "root".to_string(),
            description: String::new(),
            instructions: "You are a helpful assistant working in the user's project. \
                           Use the shell tool to inspect and change files."
                .to_string(),
            sub_agents: Vec::new(),
            toolsets: vec![SHELL_TOOLSET.to_string()],
            add_date: true,
            add_environment_info: true,
            num_history_items: None,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl TroupeConfig {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse a config, reporting syntax errors instead of falling back.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// The config as TOML, with the default agent filled in when none is set.
    pub fn to_toml(&self) -> String {
        let mut config = self.clone();
        if config.agents.is_empty() {
            config.agents.push(AgentConfig::default());
        }
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let r = &self.runtime;
        RuntimeConfig {
            max_iterations: r.max_iterations,
            event_buffer: r.event_buffer,
            compaction: CompactionConfig {
                enabled: r.compaction.enabled,
                threshold_tokens: r.compaction.threshold_tokens,
            },
            suggestions: SuggestionsConfig {
                enabled: r.suggestions.enabled,
                max_count: r.suggestions.max_count,
                timeout: Duration::from_millis(r.suggestions.timeout_ms),
                max_tokens: r.suggestions.max_tokens,
            },
        }
    }

    pub fn shell_config(&self, working_dir: &Path) -> ShellConfig {
        let mut config = ShellConfig::new(working_dir)
            .with_quick_timeout(Duration::from_secs(self.shell.quick_timeout_secs));
        config.shell = self.shell.shell.clone();
        config.env = self
            .shell
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config
    }

    /// Build the model provider, reading the API key from the environment.
    pub fn provider(&self) -> Result<Arc<dyn LlmProvider>> {
        let p = &self.provider;
        match p.kind.as_str() {
            "anthropic" => {
                let api_key = std::env::var(&p.api_key_env)
                    .map_err(|_| Error::ConfigError(format!("{} not set", p.api_key_env)))?;
                let mut provider = AnthropicProvider::new(api_key, &p.model).with_options(ModelOptions {
                    max_tokens: p.max_tokens,
                    temperature: p.temperature,
                    ..ModelOptions::default()
                });
                if let Some(url) = &p.base_url {
                    provider = provider.with_base_url(url);
                }
                if let Some(pricing) = p.pricing {
                    provider = provider.with_pricing(pricing);
                }
                Ok(Arc::new(provider))
            }
            other => Err(Error::ConfigError(format!("unknown provider kind: {}", other))),
        }
    }

    /// Build the agent graph. Agents naming the same tool set share one
    /// instance, so background processes are visible to all of them.
    pub fn build_graph(&self, model: Arc<dyn LlmProvider>, working_dir: &Path) -> Result<AgentGraph> {
        let defaults = [AgentConfig::default()];
        let agents: &[AgentConfig] = if self.agents.is_empty() {
            &defaults
        } else {
            &self.agents
        };

        let mut toolsets: HashMap<&str, Arc<dyn ToolSet>> = HashMap::new();
        let mut built = Vec::with_capacity(agents.len());
        for cfg in agents {
            let mut agent = Agent::new(&cfg.name, model.clone())
                .with_description(&cfg.description)
                .with_instructions(&cfg.instructions)
                .with_sub_agents(cfg.sub_agents.iter().cloned())
                .with_add_date(cfg.add_date)
                .with_environment_info(cfg.add_environment_info);
            if let Some(n) = cfg.num_history_items {
                agent = agent.with_num_history_items(n);
            }
            for name in &cfg.toolsets {
                let set = match toolsets.get(name.as_str()) {
                    Some(set) => set.clone(),
                    None => {
                        let set = self.toolset(name, working_dir)?;
                        toolsets.insert(name.as_str(), set.clone());
                        set
                    }
                };
                agent = agent.with_toolset(set);
            }
            built.push(agent);
        }
        AgentGraph::new(built)
    }

    fn toolset(&self, name: &str, working_dir: &Path) -> Result<Arc<dyn ToolSet>> {
        match name {
            SHELL_TOOLSET => Ok(Arc::new(ShellToolSet::new(self.shell_config(working_dir)))),
            other => Err(Error::ConfigError(format!("unknown tool set: {}", other))),
        }
    }
}
