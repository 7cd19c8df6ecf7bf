//! End-to-end scenarios over the full scheduler with scripted
//! collaborators: the no-gap fast path, the research/decision loop, the
//! research fallback, the TRD forced pass, crash/resume, and the
//! warn/reselect detour.

mod common;

use common::*;
use serde_json::json;

use specloom::checkpoint::{CheckpointStore, InMemoryCheckpointStore, WORKFLOW_NAMESPACE};
use specloom::domain::{DecisionSource, ErrorKind, TRD_FORCED_PASS};
use specloom::events::EventPayload;
use specloom::interrupt::{Decision, DecisionRequest, SelectionChoice, WarningOutcome};
use specloom::scheduler::SessionScheduler;
use specloom::state::SessionState;
use specloom::types::{SessionStatus, Stage};

async fn latest_state(store: &InMemoryCheckpointStore, session_id: &str) -> SessionState {
    store
        .latest(session_id, WORKFLOW_NAMESPACE)
        .await
        .unwrap()
        .expect("session has checkpoints")
        .state()
        .unwrap()
}

fn select(session_id: &str, choice: SelectionChoice) -> DecisionRequest {
    DecisionRequest {
        session_id: session_id.to_string(),
        user_id: "user-1".into(),
        request_id: None,
        decision: Decision::Selection(choice),
    }
}

async fn submit_and_wait_next_pause(
    scheduler: &SessionScheduler,
    request: DecisionRequest,
    stage: Stage,
) {
    let session_id = request.session_id.clone();
    scheduler.submit_decision(request).await.unwrap();
    wait_for_status(scheduler, &session_id, |r| {
        r.status == SessionStatus::Paused && r.current_stage == stage
    })
    .await;
}

#[tokio::test]
async fn s1_no_gaps_fast_path() {
    let world = world();
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    let mut events = world.scheduler.subscribe(&session_id);

    let report = wait_until_completed(&world.scheduler, &session_id).await;
    assert_eq!(report.progress, 100.0);
    assert_eq!(report.decisions_total, 0);

    let state = latest_state(&world.store, &session_id).await;
    assert!(state.completeness_score >= 80);
    assert!(state.tech_gaps.is_empty());
    assert!(state.research_results.is_empty());
    assert!(state.final_trd.as_deref().is_some_and(|t| !t.is_empty()));
    assert!(state.completed_at.is_some());
    // parse_code recorded the skip marker in its checkpoint.
    let chain = world
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 0)
        .await
        .unwrap();
    assert!(
        chain
            .iter()
            .any(|cp| cp.metadata.node_name == "code_analysis_skipped")
    );

    // Artifact record persisted with all six documents.
    let artifact = world.artifacts.latest(&session_id).unwrap();
    assert_eq!(artifact.version, 1);
    assert!(!artifact.trd_content.is_empty());
    assert!(!artifact.database_schema.ddl.is_empty());
    assert!(!artifact.db_erd.is_empty());
    assert!(!artifact.architecture_diagram.is_empty());

    // Notify fired exactly once.
    assert_eq!(world.notifier.call_count(), 1);
    assert_eq!(world.notifier.effect_count(), 1);

    // Progress events are non-decreasing and the stream completes.
    let events = events.drain();
    let progress: Vec<f32> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ProgressUpdate { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(
        events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Completion { .. }))
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Error { .. }))
    );
}

#[tokio::test]
async fn s2_single_gap_happy_path() {
    let world = world();
    world.llm.push("identify_tech_gaps", single_auth_gap());
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    let report = wait_until_paused(&world.scheduler, &session_id).await;
    assert_eq!(report.current_stage, Stage::WaitUserDecision);
    assert_eq!(report.pending_decisions_count, 1);
    assert_eq!(report.decisions_total, 1);

    world
        .scheduler
        .submit_decision(select(&session_id, SelectionChoice::OptionIndex { value: 1 }))
        .await
        .unwrap();
    wait_until_completed(&world.scheduler, &session_id).await;

    let state = latest_state(&world.store, &session_id).await;
    assert_eq!(state.research_results.len(), 1);
    assert_eq!(state.user_decisions.len(), 1);
    assert_eq!(state.user_decisions[0].source, DecisionSource::User);
    assert_eq!(state.user_decisions[0].chosen_name, "Option A");
    assert!(state.pending_decisions.is_empty());
}

#[tokio::test]
async fn s3_research_fallback_on_search_outage() {
    let world = world();
    world.llm.push("identify_tech_gaps", single_auth_gap());
    world.search.set_failing(true);
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    wait_until_paused(&world.scheduler, &session_id).await;
    let state = latest_state(&world.store, &session_id).await;
    // Options came from the static template library.
    assert_eq!(state.research_results.len(), 1);
    assert!(
        state.research_results[0]
            .options
            .iter()
            .any(|o| o.name.contains("JWT") || o.name.contains("Auth0"))
    );
    assert!(
        state
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::ResearchFallback && e.recovered)
    );

    world
        .scheduler
        .submit_decision(select(&session_id, SelectionChoice::OptionIndex { value: 1 }))
        .await
        .unwrap();
    wait_until_completed(&world.scheduler, &session_id).await;
}

#[tokio::test]
async fn s4_trd_retry_and_forced_pass() {
    let world = world();
    for score in [70, 75, 80] {
        world.llm.push(
            "validate_trd",
            json!({
                "score": score,
                "missing_sections": ["deployment"],
                "inconsistencies": [],
                "suggestions": ["expand deployment section"],
            })
            .to_string(),
        );
    }
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    wait_until_completed(&world.scheduler, &session_id).await;

    assert_eq!(world.llm.calls("generate_trd"), 3);
    assert_eq!(world.llm.calls("validate_trd"), 3);

    let state = latest_state(&world.store, &session_id).await;
    assert_eq!(state.trd_iterations, 3);
    assert!(state.final_trd.is_some());
    assert_eq!(state.trd_validation.as_ref().unwrap().score, 80);

    let artifact = world.artifacts.latest(&session_id).unwrap();
    assert_eq!(artifact.quality_score, 80);
    assert!(
        artifact
            .validation_report
            .notes
            .contains(&TRD_FORCED_PASS.to_string())
    );
}

#[tokio::test]
async fn s5_crash_after_db_schema_resumes_at_erd() {
    // Full reference run.
    let world_a = world();
    let session_id = world_a
        .scheduler
        .start(start_request())
        .await
        .unwrap()
        .to_string();
    wait_until_completed(&world_a.scheduler, &session_id).await;
    let final_a = latest_state(&world_a.store, &session_id).await;

    // Simulate the crash: seed a fresh store with the chain up to and
    // including the generate_db_schema checkpoint.
    let chain = world_a
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 0)
        .await
        .unwrap();
    let cut = chain
        .iter()
        .position(|cp| cp.metadata.node_name == "generate_db_schema")
        .expect("schema checkpoint present");
    let world_b = world();
    for checkpoint in &chain[..=cut] {
        world_b.store.put(checkpoint.clone()).await.unwrap();
    }

    let resumed = world_b.scheduler.resume_all().await.unwrap();
    assert_eq!(resumed, vec![session_id.clone()]);
    wait_until_completed(&world_b.scheduler, &session_id).await;
    let final_b = latest_state(&world_b.store, &session_id).await;

    // Resume started at generate_db_erd: the schema field is byte-equal
    // and the schema-generation stage did not re-run.
    assert_eq!(final_a.db_schema, final_b.db_schema);
    assert_eq!(world_b.llm.calls("generate_db_schema"), 0);
    assert!(final_b.db_erd.is_some());
    assert!(final_b.final_trd.is_some());
    assert!(final_b.tech_stack_document.is_some());
    assert_eq!(final_a.final_trd, final_b.final_trd);

    // No duplicated history from the resumed run.
    let schema_notes = final_b
        .conversation_history
        .iter()
        .filter(|e| e.message.starts_with("Generated schema"))
        .count();
    assert_eq!(schema_notes, 1);
    let erd_notes = final_b
        .conversation_history
        .iter()
        .filter(|e| e.message.starts_with("Rendered ER diagram"))
        .count();
    assert_eq!(erd_notes, 1);
}

#[tokio::test]
async fn s6_critical_warning_then_reselect() {
    let world = world();
    world.llm.push("identify_tech_gaps", two_gaps());
    world.llm.push(
        "validate_decision",
        json!({
            "warnings": [{
                "kind": "requirement_mismatch",
                "severity": "critical",
                "description": "conflicts with the PRD session requirements",
            }]
        })
        .to_string(),
    );
    // Second and third validations are clean (fixture default).
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    // Gap 1: first pick triggers the critical warning.
    let report = wait_until_paused(&world.scheduler, &session_id).await;
    assert_eq!(report.current_stage, Stage::WaitUserDecision);
    submit_and_wait_next_pause(
        &world.scheduler,
        select(&session_id, SelectionChoice::OptionIndex { value: 1 }),
        Stage::WarnUser,
    )
    .await;

    // Reselect, then pick a different option.
    submit_and_wait_next_pause(
        &world.scheduler,
        DecisionRequest {
            session_id: session_id.clone(),
            user_id: "user-1".into(),
            request_id: None,
            decision: Decision::Warning {
                outcome: WarningOutcome::Reselect,
            },
        },
        Stage::WaitUserDecision,
    )
    .await;
    submit_and_wait_next_pause(
        &world.scheduler,
        select(&session_id, SelectionChoice::OptionIndex { value: 2 }),
        Stage::WaitUserDecision,
    )
    .await;

    // Gap 2 is now presented; accept the first option.
    let report = world.scheduler.status(&session_id).await.unwrap();
    assert_eq!(report.decisions_completed, 1);
    world
        .scheduler
        .submit_decision(select(&session_id, SelectionChoice::OptionIndex { value: 1 }))
        .await
        .unwrap();
    wait_until_completed(&world.scheduler, &session_id).await;

    let state = latest_state(&world.store, &session_id).await;
    let auth_decisions: Vec<_> = state
        .user_decisions
        .iter()
        .filter(|d| d.gap_id == "gap-auth")
        .collect();
    assert_eq!(auth_decisions.len(), 1);
    assert_eq!(auth_decisions[0].chosen_name, "Option B");
    assert_eq!(state.user_decisions.len(), 2);
    // The critical warning is retained in state.
    assert!(
        state
            .validation_warnings
            .iter()
            .any(|w| w.gap_id == "gap-auth" && w.is_critical())
    );
}

#[tokio::test]
async fn custom_search_reroutes_research_and_attributes_source() {
    let world = world();
    world.llm.push("identify_tech_gaps", single_auth_gap());
    world.llm.push(
        "enrich_options",
        json!({"options": [option_json("First A", 80), option_json("First B", 60)]}).to_string(),
    );
    world.llm.push(
        "enrich_options",
        json!({"options": [option_json("Custom A", 80), option_json("Custom B", 60)]}).to_string(),
    );
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    wait_until_paused(&world.scheduler, &session_id).await;
    submit_and_wait_next_pause(
        &world.scheduler,
        select(
            &session_id,
            SelectionChoice::Search {
                query: "self-hosted auth".into(),
            },
        ),
        Stage::WaitUserDecision,
    )
    .await;

    let state = latest_state(&world.store, &session_id).await;
    // A second research round ran for the same gap.
    assert_eq!(state.research_results.len(), 2);
    assert_eq!(state.research_results[1].gap_id, "gap-auth");
    assert_eq!(state.research_results[1].options[0].name, "Custom A");

    world
        .scheduler
        .submit_decision(select(&session_id, SelectionChoice::OptionIndex { value: 1 }))
        .await
        .unwrap();
    wait_until_completed(&world.scheduler, &session_id).await;

    let state = latest_state(&world.store, &session_id).await;
    assert_eq!(state.user_decisions.len(), 1);
    assert_eq!(state.user_decisions[0].chosen_name, "Custom A");
    assert_eq!(state.user_decisions[0].source, DecisionSource::CustomSearch);
}

#[tokio::test]
async fn ai_recommendation_selection() {
    let world = world();
    world.llm.push("identify_tech_gaps", single_auth_gap());
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    wait_until_paused(&world.scheduler, &session_id).await;
    world
        .scheduler
        .submit_decision(select(&session_id, SelectionChoice::AiRecommendation))
        .await
        .unwrap();
    wait_until_completed(&world.scheduler, &session_id).await;

    let state = latest_state(&world.store, &session_id).await;
    // Option A carries the highest weighted score in the fixture.
    assert_eq!(state.user_decisions[0].chosen_name, "Option A");
    assert_eq!(
        state.user_decisions[0].source,
        DecisionSource::AiRecommended
    );
}

#[tokio::test]
async fn upstream_incomplete_fails_fast() {
    let upstream = StaticUpstream::complete();
    upstream.set_missing(&["ux_flow"]);
    let world = world_with(test_config(), upstream);
    let err = world.scheduler.start(start_request()).await.unwrap_err();
    assert!(err.to_string().contains("ux_flow"));
}

#[tokio::test]
async fn notify_is_idempotent_per_session() {
    let notifier = RecordingNotifier::new();
    let payload = specloom::domain::NotifyPayload {
        project_id: "p".into(),
        session_id: "s".into(),
        artifact_id: "a".into(),
    };
    use specloom::collaborators::DownstreamNotifier;
    notifier.notify(payload.clone()).await.unwrap();
    notifier.notify(payload).await.unwrap();
    assert_eq!(notifier.call_count(), 2);
    assert_eq!(notifier.effect_count(), 1);
}

#[tokio::test]
async fn cancellation_stops_at_node_boundary() {
    let world = world();
    world.llm.push("identify_tech_gaps", single_auth_gap());
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();

    // Cancel while parked at the decision stage.
    wait_until_paused(&world.scheduler, &session_id).await;
    world.scheduler.cancel(&session_id).await.unwrap();
    let report = wait_for_status(&world.scheduler, &session_id, |r| {
        r.status == SessionStatus::Cancelled
    })
    .await;
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(world.notifier.call_count(), 0);
}
