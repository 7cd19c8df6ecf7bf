//! Code-bundle parsing and API inference.

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{ApiEndpoint, ConversationEntry, EndpointSource};
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::state::{SessionState, StatePatch};
use crate::types::Stage;

/// Extracts component records from the uploaded code bundle. With no
/// bundle reference the stage is a no-op that records
/// `code_analysis_skipped`; per-file parse failures are tolerated by the
/// parser collaborator.
pub struct ParseCode;

#[async_trait]
impl WorkflowNode for ParseCode {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let Some(bundle_ref) = &state.inputs.code_bundle_ref else {
            let mut patch = StatePatch::new()
                .with_stage(Stage::CodeAnalysisSkipped)
                .with_conversation(ConversationEntry::system(
                    "No code bundle supplied; skipping code analysis",
                ));
            patch.parsed_components = Some(Vec::new());
            return Ok(NodeOutcome::advance(patch));
        };

        let components = ctx.collaborators.code_parser.parse(bundle_ref).await?;
        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Parsed {} component(s) from the code bundle",
            components.len()
        )));
        patch.parsed_components = Some(components);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Deduces API endpoints from parsed components, or from the design
/// documents when no components are available. Deduplicated on
/// `(method, path)`, first occurrence wins.
pub struct InferApi;

#[derive(Deserialize)]
struct EndpointsEnvelope {
    #[serde(default)]
    endpoints: Vec<EndpointEnvelope>,
}

#[derive(Deserialize)]
struct EndpointEnvelope {
    method: String,
    path: String,
    #[serde(default)]
    request_shape: serde_json::Value,
    #[serde(default)]
    response_shape: serde_json::Value,
}

#[async_trait]
impl WorkflowNode for InferApi {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut endpoints: Vec<ApiEndpoint> = Vec::new();

        if state.parsed_components.is_empty() {
            let mut prompt = String::from(
                "Infer the REST endpoints this product needs as JSON {\"endpoints\": \
                 [{\"method\", \"path\", \"request_shape\", \"response_shape\"}]}.\n\nPRD:\n",
            );
            prompt.push_str(&state.inputs.prd_content);
            for (kind, body) in &state.inputs.design_docs {
                prompt.push_str(&format!("\n\n{}:\n{}", kind.as_str(), body));
            }
            let raw = ctx.collaborators.llm.complete("infer_api", &prompt).await?;
            let envelope: EndpointsEnvelope = super::parse_llm_json("infer_api", &raw)?;
            for e in envelope.endpoints {
                endpoints.push(ApiEndpoint {
                    method: e.method.to_ascii_uppercase(),
                    path: e.path,
                    request_shape: e.request_shape,
                    response_shape: e.response_shape,
                    source: EndpointSource::DesignDocs,
                });
            }
        } else {
            for component in &state.parsed_components {
                for call in &component.api_calls {
                    if let Some(endpoint) = endpoint_from_call(call) {
                        endpoints.push(endpoint);
                    }
                }
            }
        }

        dedup_endpoints(&mut endpoints);

        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Inferred {} API endpoint(s)",
            endpoints.len()
        )));
        patch.inferred_api_spec = Some(endpoints);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Parse call-site strings like `"GET /api/projects"`.
fn endpoint_from_call(call: &str) -> Option<ApiEndpoint> {
    let mut parts = call.split_whitespace();
    let method = parts.next()?.to_ascii_uppercase();
    let path = parts.next()?;
    if !matches!(
        method.as_str(),
        "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD" | "OPTIONS"
    ) || !path.starts_with('/')
    {
        return None;
    }
    Some(ApiEndpoint {
        method,
        path: path.to_string(),
        request_shape: serde_json::Value::Null,
        response_shape: serde_json::Value::Null,
        source: EndpointSource::ComponentCode,
    })
}

fn dedup_endpoints(endpoints: &mut Vec<ApiEndpoint>) {
    let mut seen: Vec<(String, String)> = Vec::new();
    endpoints.retain(|e| {
        let key = (e.method.clone(), e.path.clone());
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_site_parsing() {
        let endpoint = endpoint_from_call("get /api/projects").unwrap();
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.path, "/api/projects");
        assert!(endpoint_from_call("fetchProjects()").is_none());
        assert!(endpoint_from_call("GET projects").is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut endpoints = vec![
            endpoint_from_call("GET /a").unwrap(),
            endpoint_from_call("POST /a").unwrap(),
            endpoint_from_call("GET /a").unwrap(),
        ];
        dedup_endpoints(&mut endpoints);
        assert_eq!(endpoints.len(), 2);
    }
}
