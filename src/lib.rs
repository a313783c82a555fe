//! troupe: multi-agent runtime configuration and terminal front end

pub mod config;

pub use config::{AgentConfig, ProviderConfig, TroupeConfig, SHELL_TOOLSET};

use troupe_core::ResumeElicitationRequest;

/// Map a terminal answer to an elicitation decision. Unrecognised input is
/// `None` so the caller can ask again.
pub fn parse_answer(input: &str) -> Option<ResumeElicitationRequest> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Some(ResumeElicitationRequest::accept()),
        "a" | "always" => Some(ResumeElicitationRequest::accept_for_session()),
        "n" | "no" => Some(ResumeElicitationRequest::decline()),
        "c" | "cancel" => Some(ResumeElicitationRequest::cancel()),
        _ => None,
    }
}
