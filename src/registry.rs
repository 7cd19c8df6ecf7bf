//! Stage-to-node binding.
//!
//! The registry maps every runnable [`Stage`] to its node implementation,
//! declared progress target and wall-clock budget. [`NodeRegistry::standard`]
//! wires the full production node library; tests build partial registries
//! with the builder to exercise the runner in isolation.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::Config;
use crate::node::WorkflowNode;
use crate::nodes;
use crate::types::{ALL_STAGES, Stage};

/// One stage's execution parameters.
#[derive(Clone)]
pub struct NodeBinding {
    pub node: Arc<dyn WorkflowNode>,
    /// Progress published on entry; non-decreasing along any realizable
    /// path.
    pub progress_target: f32,
    /// Wall-clock budget; exceeding it is a recoverable `NodeTimeout`.
    pub budget: Duration,
    /// Inline retries for recoverable faults.
    pub retry_limit: u32,
}

/// Immutable stage table used by the runner.
pub struct NodeRegistry {
    bindings: FxHashMap<Stage, NodeBinding>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("no node bound for runnable stage: {stage}")]
    #[diagnostic(
        code(specloom::registry::unbound_stage),
        help("Bind every runnable stage before building the registry.")
    )]
    UnboundStage { stage: Stage },
}

impl NodeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder {
            bindings: FxHashMap::default(),
        }
    }

    /// The production node library with the declared progress targets and
    /// the configured budgets.
    pub fn standard(config: &Config) -> Self {
        let plain = config.node_default_timeout;
        let research = config.research_timeout;
        let generation = config.generation_timeout;
        let retries = config.node_retry_limit;

        let mut b = Self::builder();
        b = b
            .bind(Stage::LoadInputs, nodes::LoadInputs, 5.0, plain, retries)
            .bind(
                Stage::AnalyzeCompleteness,
                nodes::AnalyzeCompleteness,
                15.0,
                plain,
                retries,
            )
            .bind(
                Stage::AskClarification,
                nodes::AskClarification,
                20.0,
                plain,
                retries,
            )
            .bind(
                Stage::IdentifyTechGaps,
                nodes::IdentifyTechGaps,
                25.0,
                plain,
                retries,
            )
            .bind(
                Stage::ResearchTechnologies,
                nodes::ResearchTechnologies::new(),
                30.0,
                research,
                retries,
            )
            .bind(
                Stage::PresentOptions,
                nodes::PresentOptions,
                32.0,
                plain,
                retries,
            )
            .bind(
                Stage::WaitUserDecision,
                nodes::WaitUserDecision,
                34.0,
                plain,
                retries,
            )
            .bind(
                Stage::ValidateDecision,
                nodes::ValidateDecision,
                36.0,
                plain,
                retries,
            )
            .bind(Stage::WarnUser, nodes::WarnUser, 36.0, plain, retries)
            .bind(Stage::ParseCode, nodes::ParseCode, 55.0, plain, retries)
            .bind(Stage::InferApi, nodes::InferApi, 60.0, plain, retries)
            .bind(
                Stage::GenerateTrd,
                nodes::GenerateTrd,
                70.0,
                generation,
                retries,
            )
            .bind(
                Stage::ValidateTrd,
                nodes::ValidateTrd,
                72.0,
                generation,
                retries,
            )
            .bind(
                Stage::GenerateApiSpec,
                nodes::GenerateApiSpec,
                80.0,
                generation,
                retries,
            )
            .bind(
                Stage::GenerateDbSchema,
                nodes::GenerateDbSchema,
                85.0,
                generation,
                retries,
            )
            .bind(
                Stage::GenerateDbErd,
                nodes::GenerateDbErd,
                87.0,
                generation,
                retries,
            )
            .bind(
                Stage::GenerateArchitecture,
                nodes::GenerateArchitecture,
                90.0,
                generation,
                retries,
            )
            .bind(
                Stage::ValidateArchitecture,
                nodes::ValidateArchitecture,
                92.0,
                generation,
                retries,
            )
            .bind(
                Stage::GenerateTechStackDoc,
                nodes::GenerateTechStackDoc,
                95.0,
                generation,
                retries,
            )
            .bind(Stage::Save, nodes::SaveArtifacts, 98.0, plain, retries)
            .bind(Stage::Notify, nodes::NotifyDownstream, 100.0, plain, retries);
        // The standard table covers every runnable stage by construction.
        b.build().expect("standard registry is complete")
    }

    #[must_use]
    pub fn binding(&self, stage: Stage) -> Option<&NodeBinding> {
        self.bindings.get(&stage)
    }
}

/// Fluent construction with completeness validation at build time.
pub struct NodeRegistryBuilder {
    bindings: FxHashMap<Stage, NodeBinding>,
}

impl NodeRegistryBuilder {
    #[must_use]
    pub fn bind<N>(
        mut self,
        stage: Stage,
        node: N,
        progress_target: f32,
        budget: Duration,
        retry_limit: u32,
    ) -> Self
    where
        N: WorkflowNode + 'static,
    {
        self.bindings.insert(
            stage,
            NodeBinding {
                node: Arc::new(node),
                progress_target,
                budget,
                retry_limit,
            },
        );
        self
    }

    /// Validate that every runnable stage is bound.
    pub fn build(self) -> Result<NodeRegistry, RegistryError> {
        for stage in ALL_STAGES {
            if stage.is_runnable() && !self.bindings.contains_key(stage) {
                return Err(RegistryError::UnboundStage { stage: *stage });
            }
        }
        Ok(NodeRegistry {
            bindings: self.bindings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_binds_all_runnable_stages() {
        let registry = NodeRegistry::standard(&Config::default());
        for stage in ALL_STAGES {
            assert_eq!(
                registry.binding(*stage).is_some(),
                stage.is_runnable(),
                "binding mismatch for {stage}"
            );
        }
    }

    #[test]
    fn incomplete_registry_fails_to_build() {
        let result = NodeRegistry::builder().build();
        assert!(matches!(
            result,
            Err(RegistryError::UnboundStage { .. })
        ));
    }
}
