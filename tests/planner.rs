//! Planner Integration Tests
//!
//! Workflow shapes produced from the builtin templates.

use taskweave::core::{PlanError, PlanMetadata, Planner, ResourceTier, TemplateRegistry};
use taskweave::domain::{AgentRegistry, ImpactTier, RunConstraints, TaskType};

const GOAL: &str = "Find a mentor for my bakery";

fn planner() -> Planner {
    Planner::new(TemplateRegistry::builtin(), AgentRegistry::builtin())
}

fn task_ids(planner: &Planner, tier: ImpactTier) -> Vec<String> {
    let metadata = PlanMetadata {
        impact_tier: tier,
        ..PlanMetadata::default()
    };
    let spec = planner
        .create_plan(GOAL, "founder-intake", RunConstraints::default(), metadata)
        .unwrap();
    spec.tasks.into_iter().map(|t| t.id).collect()
}

#[test]
fn test_founder_intake_standard_has_five_tasks() {
    assert!(GOAL.len() < 50);
    let ids = task_ids(&planner(), ImpactTier::Standard);

    assert_eq!(
        ids,
        vec![
            "extract-profile",
            "analyze-needs",
            "search-resources",
            "evaluate-match",
            "generate-response",
        ]
    );
}

#[test]
fn test_founder_intake_impact_splices_before_writing() {
    let planner = planner();
    let spec = planner
        .create_plan(
            GOAL,
            "founder-intake",
            RunConstraints::default(),
            PlanMetadata {
                impact_tier: ImpactTier::Impact,
                ..PlanMetadata::default()
            },
        )
        .unwrap();

    assert_eq!(spec.tasks.len(), 7);
    let writing = spec
        .tasks
        .iter()
        .position(|t| t.task_type == TaskType::Writing)
        .unwrap();
    assert_eq!(writing, 6);
    assert_eq!(spec.tasks[4].id, "impact-assessment");
    assert_eq!(spec.tasks[5].id, "equity-check");
    assert!(spec
        .success_criteria
        .contains(&"social_impact_assessed".to_string()));
    assert!(!spec.impact_constraints.is_empty());
}

#[test]
fn test_unknown_workflow_type() {
    let err = planner()
        .create_plan(GOAL, "world-domination", RunConstraints::default(), PlanMetadata::default())
        .unwrap_err();

    assert!(matches!(err, PlanError::UnknownWorkflowType(ref name) if name == "world-domination"));
}

#[test]
fn test_every_builtin_template_plans() {
    let planner = planner();
    let expected = [
        ("founder-intake", 5),
        ("grant-matching", 5),
        ("resource-recommendation", 3),
    ];

    for (name, count) in expected {
        let spec = planner
            .create_plan(GOAL, name, RunConstraints::default(), PlanMetadata::default())
            .unwrap();
        assert_eq!(spec.tasks.len(), count, "template {}", name);
        assert!(spec.estimated_duration_ms > 0);
    }
}

#[test]
fn test_resource_tiers_fill_unset_budget() {
    let planner = planner();
    let expected = [
        (ResourceTier::Impact, 32_000, 5_000),
        (ResourceTier::Commercial, 16_000, 10_000),
        (ResourceTier::Free, 4_000, 30_000),
        (ResourceTier::Internal, 64_000, 2_000),
    ];

    for (tier, max_tokens, target_latency_ms) in expected {
        let metadata = PlanMetadata {
            resource_tier: Some(tier),
            ..PlanMetadata::default()
        };
        let spec = planner
            .create_plan(GOAL, "founder-intake", RunConstraints::default(), metadata)
            .unwrap();
        assert_eq!(spec.constraints.max_tokens, Some(max_tokens), "tier {:?}", tier);
        assert_eq!(spec.constraints.target_latency_ms, Some(target_latency_ms), "tier {:?}", tier);
    }

    // A caller budget is kept as given
    let spec = planner
        .create_plan(
            GOAL,
            "founder-intake",
            RunConstraints {
                max_cost: Some(0.5),
                ..RunConstraints::default()
            },
            PlanMetadata::default(),
        )
        .unwrap();
    assert_eq!(spec.constraints.max_cost, Some(0.5));
    assert_eq!(spec.constraints.max_tokens, Some(16_000));
}
