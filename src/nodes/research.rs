//! The technology research loop: search, enrich, present, validate, warn.
//!
//! Research runs one gap at a time — the topologically first undecided one
//! — and goes through a read-through cache keyed by `(category,
//! context_hash)`. When web search stays down after its in-node retries,
//! options come from a static template library and a `research_fallback`
//! error is absorbed into the session log with `recovered = true`.

use std::hash::{Hash, Hasher};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{
    AiRecommendation, ConversationEntry, ErrorKind, ErrorRecord, MessageType, OptionScores,
    ResearchResult, TechGap, TechOption, ValidationWarning, WarningKind, WarningSeverity,
};
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::state::{SessionState, StatePatch};

/// Search attempts inside the node before falling back to the static
/// library. Independent of the runner's node-level retry policy.
const SEARCH_ATTEMPTS: u32 = 3;

struct CacheEntry {
    options: Vec<TechOption>,
    inserted_at: Instant,
}

/// Researches the next undecided gap: web search, candidate harvesting,
/// LLM enrichment, top-N selection. Owns the read-through research cache,
/// which is shared across sessions because the registry holds one node
/// instance.
pub struct ResearchTechnologies {
    cache: RwLock<FxHashMap<(String, u64), CacheEntry>>,
}

impl ResearchTechnologies {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    fn cache_get(&self, key: &(String, u64), ttl: std::time::Duration) -> Option<Vec<TechOption>> {
        let cache = self.cache.read();
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > ttl {
            return None;
        }
        Some(entry.options.clone())
    }

    fn cache_put(&self, key: (String, u64), options: Vec<TechOption>) {
        // Idempotent: re-inserting the same key just refreshes the TTL.
        self.cache.write().insert(
            key,
            CacheEntry {
                options,
                inserted_at: Instant::now(),
            },
        );
    }
}

impl Default for ResearchTechnologies {
    fn default() -> Self {
        Self::new()
    }
}

fn context_hash(gap: &TechGap, query: &str) -> u64 {
    let mut hasher = FxHasher::default();
    gap.requirements.hash(&mut hasher);
    query.hash(&mut hasher);
    hasher.finish()
}

#[derive(Deserialize)]
struct OptionsEnvelope {
    #[serde(default)]
    options: Vec<TechOption>,
}

#[async_trait]
impl WorkflowNode for ResearchTechnologies {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        // A custom `search:<query>` re-researches the active gap;
        // otherwise take the topologically first undecided one.
        let gap = match (&state.custom_query, &state.active_gap_id) {
            (Some(_), Some(active)) => state
                .tech_gaps
                .iter()
                .find(|g| &g.id == active)
                .ok_or(NodeError::MissingInput { what: "active gap" })?,
            _ => state
                .next_undecided_gap()
                .ok_or(NodeError::MissingInput { what: "undecided gap" })?,
        };
        let query = state
            .custom_query
            .clone()
            .unwrap_or_else(|| format!("best {} solutions for {}", gap.category, gap.description));
        let want = ctx.config.options_per_gap();

        let mut patch = StatePatch::new();
        let cache_key = (gap.category.clone(), context_hash(gap, &query));
        let options = if let Some(cached) = self.cache_get(&cache_key, ctx.config.research_cache_ttl)
        {
            cached
        } else {
            match self.search_and_enrich(gap, &query, want, ctx).await? {
                Some(options) => {
                    self.cache_put(cache_key, options.clone());
                    options
                }
                None => {
                    // Search stayed down; fall back to the template
                    // library and record the recovery.
                    tracing::warn!(gap = %gap.id, "web search exhausted, using fallback options");
                    patch.errors.push(
                        ErrorRecord::recovered(
                            ctx.stage.as_str(),
                            ErrorKind::ResearchFallback,
                            format!("web search failed for gap {}, used template options", gap.id),
                        )
                        .with_retries(SEARCH_ATTEMPTS),
                    );
                    let mut fallback = fallback_options(&gap.category);
                    fallback.truncate(want);
                    fallback
                }
            }
        };

        patch.research_results.push(ResearchResult {
            gap_id: gap.id.clone(),
            options,
            timestamp: Utc::now(),
        });
        // custom_query survives until the decision commits so the chosen
        // option can be attributed to the custom search.
        patch.pending_add.push(gap.id.clone());
        patch.active_gap_id = Some(gap.id.clone());
        patch.bump_research_rounds = true;
        patch = patch.with_conversation(ConversationEntry::system(format!(
            "Researched options for gap {}",
            gap.id
        )));
        Ok(NodeOutcome::advance(patch))
    }
}

impl ResearchTechnologies {
    /// `Ok(None)` means search never succeeded and the caller should fall
    /// back; enrichment failures still propagate for the runner to retry.
    async fn search_and_enrich(
        &self,
        gap: &TechGap,
        query: &str,
        want: usize,
        ctx: &NodeContext,
    ) -> Result<Option<Vec<TechOption>>, NodeError> {
        let mut hits = None;
        for attempt in 1..=SEARCH_ATTEMPTS {
            match ctx.collaborators.search.search(query, 5).await {
                Ok(found) if !found.is_empty() => {
                    hits = Some(found);
                    break;
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "web search attempt failed");
                }
            }
        }
        let Some(hits) = hits else {
            return Ok(None);
        };

        let mut prompt = format!(
            "Given these search results, produce the {want} strongest candidate technologies \
             for the gap \"{}\" ({}) as JSON {{\"options\": [...]}} with fields name, \
             description, pros, cons, popularity_metrics, docs_url, learning_curve, \
             setup_time, cost and scores (ease_of_use, popularity, recency, docs, cost, \
             setup; each 0-100).\nRequirements: {:?}\n",
            gap.description, gap.category, gap.requirements
        );
        for hit in &hits {
            prompt.push_str(&format!("\n- {} ({}): {}", hit.title, hit.url, hit.snippet));
        }
        let raw = ctx
            .collaborators
            .llm
            .complete("enrich_options", &prompt)
            .await?;
        let envelope: OptionsEnvelope = super::parse_llm_json("enrich_options", &raw)?;
        let mut options = envelope.options;
        options.truncate(want);
        if options.is_empty() {
            return Ok(None);
        }
        Ok(Some(options))
    }
}

/// Static template options used when web search is unavailable.
#[must_use]
pub fn fallback_options(category: &str) -> Vec<TechOption> {
    let template = |name: &str, description: &str, docs: &str, scores: OptionScores| TechOption {
        name: name.into(),
        description: description.into(),
        pros: vec!["widely adopted".into(), "well documented".into()],
        cons: vec!["selected without live research".into()],
        popularity_metrics: json!({"source": "template"}),
        docs_url: docs.into(),
        learning_curve: "moderate".into(),
        setup_time: "hours".into(),
        cost: "free tier available".into(),
        scores,
    };
    let balanced = OptionScores {
        ease_of_use: 70,
        popularity: 80,
        recency: 60,
        docs: 75,
        cost: 70,
        setup: 65,
    };
    let category = category.to_ascii_lowercase();
    if category.contains("auth") {
        vec![
            template(
                "JWT with refresh tokens",
                "Stateless token authentication",
                "https://jwt.io/introduction",
                OptionScores {
                    ease_of_use: 75,
                    ..balanced
                },
            ),
            template(
                "Auth0",
                "Managed identity platform",
                "https://auth0.com/docs",
                balanced,
            ),
            template(
                "Supabase Auth",
                "Hosted auth bundled with Postgres",
                "https://supabase.com/docs/guides/auth",
                balanced,
            ),
        ]
    } else if category.contains("database") || category.contains("db") {
        vec![
            template(
                "PostgreSQL",
                "Relational database with strong consistency",
                "https://www.postgresql.org/docs/",
                OptionScores {
                    popularity: 90,
                    ..balanced
                },
            ),
            template(
                "MySQL",
                "Widely deployed relational database",
                "https://dev.mysql.com/doc/",
                balanced,
            ),
            template(
                "MongoDB",
                "Document database for flexible schemas",
                "https://www.mongodb.com/docs/",
                balanced,
            ),
        ]
    } else if category.contains("storage") {
        vec![
            template(
                "Amazon S3",
                "Object storage with broad ecosystem support",
                "https://docs.aws.amazon.com/s3/",
                OptionScores {
                    popularity: 90,
                    ..balanced
                },
            ),
            template(
                "Google Cloud Storage",
                "Object storage on GCP",
                "https://cloud.google.com/storage/docs",
                balanced,
            ),
            template(
                "Cloudflare R2",
                "S3-compatible storage without egress fees",
                "https://developers.cloudflare.com/r2/",
                balanced,
            ),
        ]
    } else if category.contains("realtime") || category.contains("websocket") {
        vec![
            template(
                "Socket.IO",
                "WebSocket framework with fallbacks",
                "https://socket.io/docs/",
                balanced,
            ),
            template(
                "Pusher",
                "Managed realtime channels",
                "https://pusher.com/docs/",
                balanced,
            ),
            template(
                "Ably",
                "Managed pub/sub messaging",
                "https://ably.com/docs",
                balanced,
            ),
        ]
    } else {
        vec![
            template(
                "Managed service",
                "Hosted offering in this category",
                "https://example.com/managed",
                balanced,
            ),
            template(
                "Open-source library",
                "Self-hosted open-source option",
                "https://example.com/oss",
                balanced,
            ),
            template(
                "Custom implementation",
                "Build against the raw platform APIs",
                "https://example.com/custom",
                OptionScores {
                    ease_of_use: 40,
                    setup: 30,
                    ..balanced
                },
            ),
        ]
    }
}

/// Renders the researched options as an `option_presentation` message,
/// including the AI recommendation computed from the weighted facet
/// scores.
pub struct PresentOptions;

#[async_trait]
impl WorkflowNode for PresentOptions {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let gap_id = state
            .active_gap_id
            .as_deref()
            .ok_or(NodeError::MissingInput { what: "active gap" })?;
        let research = state
            .latest_research(gap_id)
            .ok_or(NodeError::MissingInput {
                what: "research results",
            })?;
        let gap = state
            .tech_gaps
            .iter()
            .find(|g| g.id == gap_id)
            .ok_or(NodeError::MissingInput { what: "gap record" })?;

        let recommended = research
            .options
            .iter()
            .max_by_key(|o| o.scores.weighted())
            .ok_or(NodeError::MissingInput {
                what: "research options",
            })?;
        let recommendation = AiRecommendation {
            gap_id: gap_id.to_string(),
            name: recommended.name.clone(),
            reason: format!(
                "highest weighted fit ({}) for {}",
                recommended.scores.weighted(),
                gap.category
            ),
        };

        let message = format!(
            "Found {} options for {}: {}",
            research.options.len(),
            gap.category,
            research
                .options
                .iter()
                .map(|o| o.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let data = json!({
            "category": gap.category,
            "options": research.options,
            "ai_recommendation": recommendation,
        });
        ctx.events
            .agent_message(message.clone(), MessageType::OptionPresentation, Some(data));

        let mut patch = StatePatch::new();
        patch.ai_recommendation = Some(recommendation);
        patch =
            patch.with_conversation(ConversationEntry::agent(message, MessageType::OptionPresentation));
        Ok(NodeOutcome::advance(patch))
    }
}

/// Poses the selection question and suspends until the interrupt
/// controller deposits a decision or a custom search request.
pub struct WaitUserDecision;

#[async_trait]
impl WorkflowNode for WaitUserDecision {
    async fn run(
        &self,
        _state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let message = "Reply with an option number, an option name, \"ai_recommendation\", \
                       or \"search:<query>\" for a custom search.";
        ctx.events
            .agent_message(message, MessageType::Question, None);
        let patch = StatePatch::new().with_conversation(
            ConversationEntry::agent(message, MessageType::Question).expecting_input(),
        );
        Ok(NodeOutcome::wait(patch))
    }
}

#[derive(Deserialize)]
struct WarningsEnvelope {
    #[serde(default)]
    warnings: Vec<WarningEnvelope>,
}

#[derive(Deserialize)]
struct WarningEnvelope {
    kind: WarningKind,
    severity: WarningSeverity,
    description: String,
}

/// Checks the candidate decision against the PRD requirements and the
/// technologies already chosen. Commits the candidate unless a critical
/// conflict detours the session to the warning stage.
pub struct ValidateDecision;

#[async_trait]
impl WorkflowNode for ValidateDecision {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let candidate = state
            .candidate_decision
            .clone()
            .ok_or(NodeError::MissingInput {
                what: "candidate decision",
            })?;
        let gap = state
            .tech_gaps
            .iter()
            .find(|g| g.id == candidate.gap_id)
            .ok_or(NodeError::MissingInput { what: "gap record" })?;

        let mut prompt = format!(
            "Check \"{}\" for the {} gap against these PRD requirements and prior choices. \
             Respond as JSON {{\"warnings\": [{{\"kind\": \
             \"requirement_mismatch\"|\"tech_incompatibility\", \"severity\": \
             \"critical\"|\"warning\", \"description\"}}]}}.\nRequirements: {:?}\n",
            candidate.chosen_name, gap.category, gap.requirements
        );
        for decision in &state.user_decisions {
            prompt.push_str(&format!(
                "\nAlready chosen: {} for {}",
                decision.chosen_name, decision.gap_id
            ));
        }

        let raw = ctx
            .collaborators
            .llm
            .complete("validate_decision", &prompt)
            .await?;
        let envelope: WarningsEnvelope = super::parse_llm_json("validate_decision", &raw)?;
        let warnings: Vec<ValidationWarning> = envelope
            .warnings
            .into_iter()
            .map(|w| ValidationWarning {
                gap_id: candidate.gap_id.clone(),
                kind: w.kind,
                severity: w.severity,
                description: w.description,
            })
            .collect();
        let critical = warnings.iter().any(ValidationWarning::is_critical);

        let mut patch = StatePatch::new();
        patch.validation_warnings = warnings;
        if critical {
            // Keep the candidate; the router detours to warn_user.
            patch = patch.with_conversation(ConversationEntry::system(format!(
                "Critical conflict found for {}",
                candidate.chosen_name
            )));
        } else {
            let message = format!(
                "Recorded {} for gap {}",
                candidate.chosen_name, candidate.gap_id
            );
            ctx.events
                .agent_message(message.clone(), MessageType::Confirmation, None);
            patch.pending_remove.push(candidate.gap_id.clone());
            patch.user_decisions.push(candidate);
            patch.clear_candidate = true;
            patch.clear_active_gap = true;
            patch.clear_custom_query = true;
            patch = patch.with_conversation(ConversationEntry::agent(
                message,
                MessageType::Confirmation,
            ));
        }
        Ok(NodeOutcome::advance(patch))
    }
}

/// Surfaces critical warnings and suspends for a `reselect`/`continue`
/// verdict.
pub struct WarnUser;

#[async_trait]
impl WorkflowNode for WarnUser {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let candidate = state
            .candidate_decision
            .as_ref()
            .ok_or(NodeError::MissingInput {
                what: "candidate decision",
            })?;
        let critical: Vec<&ValidationWarning> = state
            .validation_warnings
            .iter()
            .filter(|w| w.gap_id == candidate.gap_id && w.is_critical())
            .collect();
        let message = format!(
            "{} conflicts with the project requirements: {}. Reply \"reselect\" to pick \
             again or \"continue\" to keep it.",
            candidate.chosen_name,
            critical
                .iter()
                .map(|w| w.description.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        );
        ctx.events.agent_message(
            message.clone(),
            MessageType::ErrorNotice,
            Some(json!({"warnings": critical})),
        );
        let patch = StatePatch::new().with_conversation(
            ConversationEntry::agent(message, MessageType::ErrorNotice).expecting_input(),
        );
        Ok(NodeOutcome::wait(patch))
    }
}
