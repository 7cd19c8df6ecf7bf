//! Document generation and validation stages.
//!
//! The TRD is the only artifact with a regeneration loop; its validation
//! score gates predicate five in the router. Architecture validation
//! records warnings on low scores but never retries — a deliberate policy
//! difference.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{ArchitectureValidation, ConversationEntry, DbSchema, DbTable, TrdValidation};
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::state::{SessionState, StatePatch};

/// Produces a fresh TRD draft from the accumulated state and counts the
/// regeneration attempt.
pub struct GenerateTrd;

#[async_trait]
impl WorkflowNode for GenerateTrd {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut prompt = String::from(
            "Write a Technical Requirements Document in markdown covering architecture, \
             data model, API surface and non-functional requirements.\n\nPRD:\n",
        );
        prompt.push_str(&state.inputs.prd_content);
        for decision in &state.user_decisions {
            prompt.push_str(&format!(
                "\nChosen technology: {} ({})",
                decision.chosen_name, decision.gap_id
            ));
        }
        for endpoint in &state.inferred_api_spec {
            prompt.push_str(&format!("\nEndpoint: {} {}", endpoint.method, endpoint.path));
        }
        if let Some(validation) = &state.trd_validation {
            // Feed the previous critique back into the regeneration.
            for suggestion in &validation.suggestions {
                prompt.push_str(&format!("\nImprove: {suggestion}"));
            }
            for missing in &validation.missing_sections {
                prompt.push_str(&format!("\nAdd section: {missing}"));
            }
        }

        let draft = ctx.collaborators.llm.complete("generate_trd", &prompt).await?;
        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Generated TRD draft (attempt {})",
            state.trd_iterations + 1
        )));
        patch.trd_draft = Some(draft);
        patch.bump_trd_iterations = true;
        Ok(NodeOutcome::advance(patch))
    }
}

/// LLM critique of the current draft. Sets `final_trd` once the draft
/// passes the quality threshold or the retry cap forces acceptance.
pub struct ValidateTrd;

#[derive(Deserialize)]
struct TrdCritique {
    score: u8,
    #[serde(default)]
    missing_sections: Vec<String>,
    #[serde(default)]
    inconsistencies: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

#[async_trait]
impl WorkflowNode for ValidateTrd {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let draft = state.trd_draft.as_deref().ok_or(NodeError::MissingInput {
            what: "trd_draft",
        })?;
        let prompt = format!(
            "Critique this TRD against the PRD. Respond as JSON {{\"score\" (0-100), \
             \"missing_sections\", \"inconsistencies\", \"suggestions\"}}.\n\nTRD:\n{draft}\n\nPRD:\n{}",
            state.inputs.prd_content
        );
        let raw = ctx.collaborators.llm.complete("validate_trd", &prompt).await?;
        let critique: TrdCritique = super::parse_llm_json("validate_trd", &raw)?;

        let score = critique.score.min(100);
        let is_valid = score >= ctx.config.trd_quality_threshold;
        let capped = state.trd_iterations >= ctx.config.trd_max_regenerations;

        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "TRD validation scored {score}/100 ({})",
            if is_valid { "pass" } else { "below threshold" }
        )));
        patch.trd_validation = Some(TrdValidation {
            score,
            is_valid,
            missing_sections: critique.missing_sections,
            inconsistencies: critique.inconsistencies,
            suggestions: critique.suggestions,
        });
        if is_valid || capped {
            patch.final_trd = Some(draft.to_string());
        }
        Ok(NodeOutcome::advance(patch))
    }
}

/// Builds the OpenAPI 3.x-shaped specification from the inferred
/// endpoints. Purely mechanical: the endpoint list is already structured.
pub struct GenerateApiSpec;

#[async_trait]
impl WorkflowNode for GenerateApiSpec {
    async fn run(
        &self,
        state: &SessionState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut paths = serde_json::Map::new();
        for endpoint in &state.inferred_api_spec {
            let operation = json!({
                "summary": format!("{} {}", endpoint.method, endpoint.path),
                "requestBody": endpoint.request_shape,
                "responses": {"200": {"description": "OK", "content": endpoint.response_shape}},
                "x-source": endpoint.source,
            });
            let entry = paths
                .entry(endpoint.path.clone())
                .or_insert_with(|| json!({}));
            if let Some(object) = entry.as_object_mut() {
                object.insert(endpoint.method.to_ascii_lowercase(), operation);
            }
        }
        let spec = json!({
            "openapi": "3.0.3",
            "info": {
                "title": format!("{} API", state.identity.project_id),
                "version": "1.0.0",
            },
            "paths": paths,
        });

        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Assembled OpenAPI specification with {} path(s)",
            state.inferred_api_spec.len()
        )));
        patch.api_specification = Some(spec);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Derives the database schema (structured tables plus executable DDL).
pub struct GenerateDbSchema;

#[derive(Deserialize)]
struct SchemaEnvelope {
    #[serde(default)]
    tables: Vec<DbTable>,
}

#[async_trait]
impl WorkflowNode for GenerateDbSchema {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut prompt = String::from(
            "Design the relational schema for this product as JSON {\"tables\": [{\"name\", \
             \"columns\": [{\"name\", \"data_type\", \"nullable\", \"primary_key\", \
             \"references\"}]}]}.\n\nPRD:\n",
        );
        prompt.push_str(&state.inputs.prd_content);
        for endpoint in &state.inferred_api_spec {
            prompt.push_str(&format!("\nEndpoint: {} {}", endpoint.method, endpoint.path));
        }
        let raw = ctx
            .collaborators
            .llm
            .complete("generate_db_schema", &prompt)
            .await?;
        let envelope: SchemaEnvelope = super::parse_llm_json("generate_db_schema", &raw)?;

        let ddl = render_ddl(&envelope.tables);
        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Generated schema with {} table(s)",
            envelope.tables.len()
        )));
        patch.db_schema = Some(DbSchema {
            ddl,
            tables: envelope.tables,
        });
        Ok(NodeOutcome::advance(patch))
    }
}

fn render_ddl(tables: &[DbTable]) -> String {
    let mut ddl = String::new();
    for table in tables {
        ddl.push_str(&format!("CREATE TABLE {} (\n", table.name));
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("    {} {}", c.name, c.data_type);
                if c.primary_key {
                    line.push_str(" PRIMARY KEY");
                }
                if !c.nullable && !c.primary_key {
                    line.push_str(" NOT NULL");
                }
                if let Some(target) = &c.references {
                    line.push_str(&format!(" REFERENCES {target}"));
                }
                line
            })
            .collect();
        ddl.push_str(&columns.join(",\n"));
        ddl.push_str("\n);\n\n");
    }
    ddl
}

/// Renders the entity-relation diagram from the structured schema.
pub struct GenerateDbErd;

#[async_trait]
impl WorkflowNode for GenerateDbErd {
    async fn run(
        &self,
        state: &SessionState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let schema = state.db_schema.as_ref().ok_or(NodeError::MissingInput {
            what: "db_schema",
        })?;
        let mut erd = String::from("erDiagram\n");
        for table in &schema.tables {
            erd.push_str(&format!("    {} {{\n", table.name));
            for column in &table.columns {
                let marker = if column.primary_key { " PK" } else { "" };
                erd.push_str(&format!(
                    "        {} {}{marker}\n",
                    column.data_type.replace(' ', "_"),
                    column.name
                ));
            }
            erd.push_str("    }\n");
        }
        for table in &schema.tables {
            for column in &table.columns {
                if let Some(target) = &column.references {
                    let target_table = target.split('(').next().unwrap_or(target).trim();
                    erd.push_str(&format!(
                        "    {} }}o--|| {} : {}\n",
                        table.name, target_table, column.name
                    ));
                }
            }
        }

        let mut patch = StatePatch::new()
            .with_conversation(ConversationEntry::system("Rendered ER diagram"));
        patch.db_erd = Some(erd);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Produces the system-architecture diagram (node-link DSL text).
pub struct GenerateArchitecture;

#[async_trait]
impl WorkflowNode for GenerateArchitecture {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut prompt = String::from(
            "Draw the system architecture as a mermaid flowchart (plain text, no fences). \
             Include the client, API layer, data stores and external services.\n\nChosen stack:\n",
        );
        for decision in &state.user_decisions {
            prompt.push_str(&format!("- {}\n", decision.chosen_name));
        }
        prompt.push_str("\nPRD:\n");
        prompt.push_str(&state.inputs.prd_content);

        let diagram = ctx
            .collaborators
            .llm
            .complete("generate_architecture", &prompt)
            .await?;
        let mut patch = StatePatch::new()
            .with_conversation(ConversationEntry::system("Generated architecture diagram"));
        patch.architecture_diagram = Some(diagram);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Scores the architecture diagram. Below-threshold scores record
/// warnings; there is no regeneration loop here.
pub struct ValidateArchitecture;

#[derive(Deserialize)]
struct ArchitectureCritique {
    score: u8,
    #[serde(default)]
    warnings: Vec<String>,
}

#[async_trait]
impl WorkflowNode for ValidateArchitecture {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let diagram = state
            .architecture_diagram
            .as_deref()
            .ok_or(NodeError::MissingInput {
                what: "architecture_diagram",
            })?;
        let prompt = format!(
            "Critique this architecture for the product below. Respond as JSON \
             {{\"score\" (0-100), \"warnings\"}}.\n\nDiagram:\n{diagram}\n\nPRD:\n{}",
            state.inputs.prd_content
        );
        let raw = ctx
            .collaborators
            .llm
            .complete("validate_architecture", &prompt)
            .await?;
        let critique: ArchitectureCritique = super::parse_llm_json("validate_architecture", &raw)?;

        let score = critique.score.min(100);
        let mut warnings = critique.warnings;
        let mut patch = StatePatch::new();
        if score < ctx.config.architecture_quality_threshold {
            warnings.push(format!(
                "architecture score {score} below threshold {}",
                ctx.config.architecture_quality_threshold
            ));
            patch = patch.with_conversation(ConversationEntry::system(format!(
                "Architecture validation below threshold ({score}/100); continuing with warnings"
            )));
        } else {
            patch = patch.with_conversation(ConversationEntry::system(format!(
                "Architecture validation scored {score}/100"
            )));
        }
        patch.architecture_validation = Some(ArchitectureValidation { score, warnings });
        Ok(NodeOutcome::advance(patch))
    }
}

/// Assembles the structured tech-stack document from the committed
/// decisions.
pub struct GenerateTechStackDoc;

#[async_trait]
impl WorkflowNode for GenerateTechStackDoc {
    async fn run(
        &self,
        state: &SessionState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let choices: Vec<Value> = state
            .user_decisions
            .iter()
            .map(|d| {
                let category = state
                    .tech_gaps
                    .iter()
                    .find(|g| g.id == d.gap_id)
                    .map(|g| g.category.clone())
                    .unwrap_or_else(|| "general".into());
                json!({
                    "category": category,
                    "technology": d.chosen_name,
                    "reason": d.reason,
                    "source": d.source,
                })
            })
            .collect();
        let document = json!({
            "project_id": state.identity.project_id,
            "stack": choices,
            "decisions_from_prd": state.inputs.design_decisions,
        });

        let mut patch = StatePatch::new()
            .with_conversation(ConversationEntry::system("Assembled tech stack document"));
        patch.tech_stack_document = Some(document);
        Ok(NodeOutcome::advance(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DbColumn;

    #[test]
    fn ddl_rendering() {
        let tables = vec![DbTable {
            name: "projects".into(),
            columns: vec![
                DbColumn {
                    name: "id".into(),
                    data_type: "uuid".into(),
                    nullable: false,
                    primary_key: true,
                    references: None,
                },
                DbColumn {
                    name: "owner_id".into(),
                    data_type: "uuid".into(),
                    nullable: false,
                    primary_key: false,
                    references: Some("users(id)".into()),
                },
            ],
        }];
        let ddl = render_ddl(&tables);
        assert!(ddl.contains("CREATE TABLE projects"));
        assert!(ddl.contains("id uuid PRIMARY KEY"));
        assert!(ddl.contains("owner_id uuid NOT NULL REFERENCES users(id)"));
    }
}
