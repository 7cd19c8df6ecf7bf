//! Stage routing.
//!
//! The graph is deliberately an explicit function over a static stage
//! table, not a graph library: a spine of unconditional edges plus exactly
//! five conditional predicates, evaluated in order on the exit state of
//! the stage just executed — first match wins. The two cycles (research
//! loop, TRD retry) are bounded by the iteration caps checked here.
//!
//! Waiting stages route through the [`ResumeDirective`] deposited by the
//! interrupt controller; with no directive present the session cannot
//! advance and [`Next::AwaitUser`] is returned.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::Config;
use crate::domain::ResumeDirective;
use crate::state::SessionState;
use crate::types::Stage;

/// Completeness score at or above which analysis proceeds to gap
/// identification without asking for clarification.
pub const COMPLETENESS_THRESHOLD: u8 = 80;

/// Routing verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Execute this stage.
    Run(Stage),
    /// The session is parked at a waiting stage with no directive yet.
    AwaitUser(Stage),
    /// Terminal: nothing left to run.
    End,
}

/// Routing faults; all unrecoverable (`InvalidState` policy).
#[derive(Debug, Error, Diagnostic)]
pub enum RouteError {
    #[error("cannot route out of {stage}: {message}")]
    #[diagnostic(
        code(specloom::router::missing_data),
        help("A stage exited without producing the data its outgoing predicate reads.")
    )]
    MissingData { stage: Stage, message: String },
}

/// Select the next stage from the current state. Pure: no I/O, no
/// mutation.
pub fn route(state: &SessionState, config: &Config) -> Result<Next, RouteError> {
    let next = match state.current_stage {
        Stage::Created => Next::Run(Stage::LoadInputs),
        Stage::LoadInputs => Next::Run(Stage::AnalyzeCompleteness),

        // Predicate 1: completeness gate. Clarification is only useful
        // while there is something left to ask.
        Stage::AnalyzeCompleteness => {
            if state.completeness_score >= COMPLETENESS_THRESHOLD
                || state.clarification_queue.is_empty()
            {
                Next::Run(Stage::IdentifyTechGaps)
            } else {
                Next::Run(Stage::AskClarification)
            }
        }

        Stage::AskClarification => match state.resume_directive {
            Some(ResumeDirective::Reanalyze) => Next::Run(Stage::AnalyzeCompleteness),
            _ => Next::AwaitUser(Stage::AskClarification),
        },

        // Predicate 2: any gaps at all?
        Stage::IdentifyTechGaps => {
            if state.tech_gaps.is_empty() {
                Next::Run(Stage::ParseCode)
            } else {
                research_or_move_on(state, config)
            }
        }

        Stage::ResearchTechnologies => Next::Run(Stage::PresentOptions),
        Stage::PresentOptions => Next::Run(Stage::WaitUserDecision),

        Stage::WaitUserDecision => match &state.resume_directive {
            Some(ResumeDirective::Research { .. }) => Next::Run(Stage::ResearchTechnologies),
            Some(ResumeDirective::Validate) => Next::Run(Stage::ValidateDecision),
            _ => Next::AwaitUser(Stage::WaitUserDecision),
        },

        // Predicate 4 before predicate 3: a critical warning on the
        // candidate detours to warn_user.
        Stage::ValidateDecision => {
            if has_critical_warning_for_candidate(state) {
                Next::Run(Stage::WarnUser)
            } else {
                research_or_move_on(state, config)
            }
        }

        Stage::WarnUser => match state.resume_directive {
            Some(ResumeDirective::Reselect) => Next::Run(Stage::PresentOptions),
            Some(ResumeDirective::Proceed) => research_or_move_on(state, config),
            _ => Next::AwaitUser(Stage::WarnUser),
        },

        Stage::ParseCode | Stage::CodeAnalysisSkipped => Next::Run(Stage::InferApi),
        Stage::InferApi => Next::Run(Stage::GenerateTrd),
        Stage::GenerateTrd => Next::Run(Stage::ValidateTrd),

        // Predicate 5: pass, or retry until the cap forces a pass.
        Stage::ValidateTrd => {
            let validation =
                state
                    .trd_validation
                    .as_ref()
                    .ok_or_else(|| RouteError::MissingData {
                        stage: Stage::ValidateTrd,
                        message: "trd_validation missing".into(),
                    })?;
            if validation.is_valid || state.trd_iterations >= config.trd_max_regenerations {
                Next::Run(Stage::GenerateApiSpec)
            } else {
                Next::Run(Stage::GenerateTrd)
            }
        }

        Stage::GenerateApiSpec => Next::Run(Stage::GenerateDbSchema),
        Stage::GenerateDbSchema => Next::Run(Stage::GenerateDbErd),
        Stage::GenerateDbErd => Next::Run(Stage::GenerateArchitecture),
        Stage::GenerateArchitecture => Next::Run(Stage::ValidateArchitecture),
        Stage::ValidateArchitecture => Next::Run(Stage::GenerateTechStackDoc),
        Stage::GenerateTechStackDoc => Next::Run(Stage::Save),
        Stage::Save => Next::Run(Stage::Notify),
        Stage::Notify | Stage::Completed | Stage::Failed => Next::End,
    };
    Ok(next)
}

/// Predicate 3: while undecided gaps remain (and the research cap allows)
/// research the next one; otherwise continue to code parsing.
fn research_or_move_on(state: &SessionState, config: &Config) -> Next {
    let undecided = state
        .tech_gaps
        .iter()
        .any(|g| !state.user_decisions.iter().any(|d| d.gap_id == g.id));
    let capped = config
        .research_max_gaps_per_session
        .is_some_and(|cap| state.research_rounds >= cap);
    if undecided && !capped {
        Next::Run(Stage::ResearchTechnologies)
    } else {
        Next::Run(Stage::ParseCode)
    }
}

fn has_critical_warning_for_candidate(state: &SessionState) -> bool {
    let Some(candidate) = &state.candidate_decision else {
        return false;
    };
    state
        .validation_warnings
        .iter()
        .any(|w| w.gap_id == candidate.gap_id && w.is_critical())
}

/// Progress published while the research loop runs: interpolated across
/// the 30–50% band by decided/total gaps. The runner still clamps against
/// the session's current progress, so monotonicity always wins.
#[must_use]
pub fn research_progress(state: &SessionState) -> f32 {
    if state.tech_gaps.is_empty() {
        return 30.0;
    }
    let decided = state.user_decisions.len() as f32;
    let total = state.tech_gaps.len() as f32;
    30.0 + 20.0 * (decided / total).clamp(0.0, 1.0)
}
