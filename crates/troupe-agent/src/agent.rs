//! Agents and the agent graph
//!
//! The graph is an arena of agents keyed by name. Each agent lists its
//! children by name; parent links are never stored and are derived from the
//! child lists when asked for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use troupe_core::{Error, Result};
use troupe_llm::LlmProvider;
use troupe_tools::{ToolRegistry, ToolSet};

pub struct Agent {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub model: Arc<dyn LlmProvider>,
    pub sub_agents: Vec<String>,
    /// Adds a "Today's date" message to every view.
    pub add_date: bool,
    /// Adds working directory and platform details to every view.
    pub add_environment_info: bool,
    /// Keep at most this many conversation messages in the view.
    pub num_history_items: Option<usize>,
    toolsets: Vec<Arc<dyn ToolSet>>,
    tools: ToolRegistry,
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn LlmProvider>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            model,
            sub_agents: Vec::new(),
            add_date: false,
            add_environment_info: false,
            num_history_items: None,
            toolsets: Vec::new(),
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_toolset(mut self, toolset: Arc<dyn ToolSet>) -> Self {
        for tool in toolset.tools() {
            self.tools.register_arc(tool);
        }
        self.toolsets.push(toolset);
        self
    }

    pub fn with_sub_agents<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_agents.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_add_date(mut self, add_date: bool) -> Self {
        self.add_date = add_date;
        self
    }

    pub fn with_environment_info(mut self, add: bool) -> Self {
        self.add_environment_info = add;
        self
    }

    pub fn with_num_history_items(mut self, n: usize) -> Self {
        self.num_history_items = Some(n);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn toolsets(&self) -> &[Arc<dyn ToolSet>] {
        &self.toolsets
    }

    /// Instructions contributed by the attached tool sets, in attach order.
    pub fn toolset_instructions(&self) -> Vec<String> {
        self.toolsets
            .iter()
            .filter_map(|set| set.instructions())
            .filter(|text| !text.trim().is_empty())
            .collect()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model.model())
            .field("sub_agents", &self.sub_agents)
            .field("tools", &self.tools.list())
            .finish()
    }
}

#[derive(Debug)]
pub struct AgentGraph {
    agents: Vec<Agent>,
    index: HashMap<String, usize>,
    root: usize,
}

impl AgentGraph {
    /// Build a graph whose root is the first agent. Names must be unique and
    /// every child must exist.
    pub fn new(agents: Vec<Agent>) -> Result<Self> {
        if agents.is_empty() {
            return Err(Error::ConfigError("agent graph needs at least one agent".into()));
        }

        let mut index = HashMap::new();
        for (i, agent) in agents.iter().enumerate() {
            if index.insert(agent.name.clone(), i).is_some() {
                return Err(Error::ConfigError(format!("duplicate agent name: {}", agent.name)));
            }
        }
        for agent in &agents {
            if let Some(missing) = agent.sub_agents.iter().find(|c| !index.contains_key(*c)) {
                return Err(Error::ConfigError(format!(
                    "agent {} lists unknown sub-agent {}",
                    agent.name, missing
                )));
            }
        }

        Ok(Self { agents, index, root: 0 })
    }

    pub fn with_root(mut self, name: &str) -> Result<Self> {
        self.root = *self
            .index
            .get(name)
            .ok_or_else(|| Error::AgentNotFound(name.to_string()))?;
        Ok(self)
    }

    pub fn root(&self) -> &Agent {
        &self.agents[self.root]
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn agent(&self, name: &str) -> Result<&Agent> {
        self.get(name).ok_or_else(|| Error::AgentNotFound(name.to_string()))
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn children(&self, name: &str) -> Vec<&Agent> {
        self.get(name)
            .map(|agent| agent.sub_agents.iter().filter_map(|c| self.get(c)).collect())
            .unwrap_or_default()
    }

    /// Agents listing `name` as a child.
    pub fn parents(&self, name: &str) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|a| a.sub_agents.iter().any(|c| c == name))
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Every agent reachable by walking parent links up from `name`.
    pub fn ancestors(&self, name: &str) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut frontier = self.parents(name);
        while let Some(parent) = frontier.pop() {
            if seen.insert(parent) {
                frontier.extend(self.parents(parent));
            }
        }
        seen
    }

    /// Agents `name` may hand a task to: its children, minus any ancestor.
    pub fn handoff_targets(&self, name: &str) -> Vec<&Agent> {
        let ancestors = self.ancestors(name);
        self.children(name)
            .into_iter()
            .filter(|child| child.name != name && !ancestors.contains(child.name.as_str()))
            .collect()
    }

    /// Every distinct tool set attached to any agent.
    pub fn toolsets(&self) -> Vec<Arc<dyn ToolSet>> {
        let mut sets: Vec<Arc<dyn ToolSet>> = Vec::new();
        for agent in &self.agents {
            for set in agent.toolsets() {
                if !sets.iter().any(|s| Arc::ptr_eq(s, set)) {
                    sets.push(set.clone());
                }
            }
        }
        sets
    }
}
