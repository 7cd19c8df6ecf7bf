//! The concrete node library.
//!
//! One module per phase of the workflow: input loading, completeness
//! analysis, technology research, code/API inference, document generation
//! and persistence. Every node is a stateless [`crate::node::WorkflowNode`]
//! reached exclusively through the registry.

mod analysis;
mod code;
mod generate;
mod inputs;
mod persist;
mod research;

pub use analysis::{AnalyzeCompleteness, AskClarification, IdentifyTechGaps};
pub use code::{InferApi, ParseCode};
pub use generate::{
    GenerateApiSpec, GenerateArchitecture, GenerateDbErd, GenerateDbSchema, GenerateTechStackDoc,
    GenerateTrd, ValidateArchitecture, ValidateTrd,
};
pub use inputs::LoadInputs;
pub use persist::{NotifyDownstream, SaveArtifacts};
pub use research::{
    PresentOptions, ResearchTechnologies, ValidateDecision, WaitUserDecision, WarnUser,
    fallback_options,
};

use serde::de::DeserializeOwned;

use crate::node::NodeError;

/// Parse a JSON envelope out of an LLM completion, tolerating markdown
/// fences and prose around the object.
pub(crate) fn parse_llm_json<T: DeserializeOwned>(
    task: &'static str,
    raw: &str,
) -> Result<T, NodeError> {
    let trimmed = extract_json(raw);
    serde_json::from_str(trimmed).map_err(|source| NodeError::Envelope { task, source })
}

fn extract_json(raw: &str) -> &str {
    let start = raw.find(['{', '[']);
    let end = raw.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &raw[s..=e],
        _ => raw,
    }
}
