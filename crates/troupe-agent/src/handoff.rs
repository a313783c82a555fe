//! The `transfer_task` tool an agent uses to hand the conversation to one
//! of its sub-agents.

use crate::agent::Agent;
use serde::Deserialize;
use serde_json::json;
use troupe_llm::LlmTool;

pub const TRANSFER_TASK: &str = "transfer_task";

#[derive(Debug, Deserialize)]
pub struct TransferTaskArgs {
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub expected_output: String,
}

impl TransferTaskArgs {
    /// First message the receiving agent sees.
    pub fn briefing(&self, from: &str) -> String {
        let mut text = format!("Task from {}: {}", from, self.task);
        if !self.expected_output.trim().is_empty() {
            text.push_str("\n\nExpected output: ");
            text.push_str(&self.expected_output);
        }
        text
    }
}

pub fn transfer_task_tool(targets: &[&Agent]) -> LlmTool {
    let names: Vec<&str> = targets.iter().map(|a| a.name.as_str()).collect();
    LlmTool {
        name: TRANSFER_TASK.to_string(),
        description: "Transfer the conversation to another agent that is better suited to \
                      handle the task. The agent takes over until the user says otherwise."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": names,
                    "description": "The name of the agent to transfer the task to"
                },
                "task": {
                    "type": "string",
                    "description": "A clear and concise description of the task the agent should achieve"
                },
                "expected_output": {
                    "type": "string",
                    "description": "The expected output from the agent (optional)"
                }
            },
            "required": ["agent", "task"],
            "additionalProperties": false
        }),
    }
}

/// System prompt block listing the agents `targets` an agent may hand off to.
pub fn handoff_prompt(targets: &[&Agent]) -> String {
    let mut prompt = String::from(
        "You are part of a multi-agent team. You can hand off a task to one of the \
         following agents with the `transfer_task` tool when it is better suited to \
         handle it:\n",
    );
    for agent in targets {
        if agent.description.is_empty() {
            prompt.push_str(&format!("\n- {}", agent.name));
        } else {
            prompt.push_str(&format!("\n- {}: {}", agent.name, agent.description));
        }
    }
    prompt
}
