//! Workflow templates and loading.
//!
//! A template is the ordered task list and base success criteria for one
//! workflow type. Three templates are built in; more can be loaded from
//! YAML files in the configured templates directory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::PlanError;
use crate::domain::{AgentRegistry, HumanCheckpoint, Task, TaskType};

/// A reusable workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Workflow type name (used in requests and the CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered tasks
    pub tasks: Vec<Task>,

    /// Criteria checked when results are evaluated
    #[serde(default)]
    pub success_criteria: Vec<String>,

    /// Optional human review points
    #[serde(default)]
    pub human_in_loop: Vec<HumanCheckpoint>,
}

impl WorkflowTemplate {
    /// Load a template from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse template: {}", path.display()))
    }

    /// Parse a template from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse template YAML")
    }

    /// Validate the template against the known agents
    pub fn validate(&self, agents: &AgentRegistry) -> Result<(), PlanError> {
        let invalid = |reason: String| PlanError::InvalidTemplate {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("template name cannot be empty".to_string()));
        }
        if self.tasks.is_empty() {
            return Err(invalid("template must have at least one task".to_string()));
        }

        let mut seen = HashSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.id.is_empty() {
                return Err(invalid(format!("task {} has an empty id", i)));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(invalid(format!("duplicate task id '{}'", task.id)));
            }
            if !agents.contains(&task.agent) {
                return Err(PlanError::UnknownAgent {
                    task_id: task.id.clone(),
                    agent: task.agent.clone(),
                });
            }
            if task.inputs.iter().any(|input| input == &task.id) {
                return Err(invalid(format!("task '{}' depends on itself", task.id)));
            }
        }

        Ok(())
    }
}

/// Templates by workflow type
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in templates
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for template in [founder_intake(), grant_matching(), resource_recommendation()] {
            registry.register(template);
        }
        registry
    }

    /// Add or replace a template
    pub fn register(&mut self, template: WorkflowTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Load every `*.yaml`/`*.yml` file in `dir`, validating each.
    ///
    /// Returns the number of templates loaded. A missing directory loads
    /// nothing.
    pub fn load_dir(&mut self, dir: &Path, agents: &AgentRegistry) -> Result<usize> {
        if !dir.exists() {
            debug!(dir = %dir.display(), "Templates directory does not exist");
            return Ok(0);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read templates directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let template = WorkflowTemplate::from_file(&path)?;
            template
                .validate(agents)
                .with_context(|| format!("Invalid template file: {}", path.display()))?;

            if self.templates.contains_key(&template.name) {
                warn!(template = %template.name, path = %path.display(), "Template overrides an existing one");
            }
            self.register(template);
            loaded += 1;
        }

        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn criteria(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn checkpoint(step: &str, purpose: &str, fallback: &str) -> HumanCheckpoint {
    HumanCheckpoint {
        step: step.to_string(),
        purpose: purpose.to_string(),
        fallback: fallback.to_string(),
    }
}

fn founder_intake() -> WorkflowTemplate {
    use TaskType::*;

    WorkflowTemplate {
        name: "founder-intake".to_string(),
        description: "Intake founder and map to resources".to_string(),
        tasks: vec![
            Task::new("extract-profile", Research, "profile-extractor")
                .with_inputs(&["user_input"])
                .with_outputs(&["founder_profile"])
                .with_criteria(&["complete_contact_info", "business_stage_identified"]),
            Task::new("analyze-needs", Research, "needs-analyzer")
                .with_inputs(&["founder_profile"])
                .with_outputs(&["needs_assessment"])
                .with_criteria(&["primary_needs_identified", "urgency_level_set"]),
            Task::new("search-resources", Research, "resource-searcher")
                .parallel(true)
                .with_inputs(&["needs_assessment"])
                .with_outputs(&["candidate_resources"])
                .with_criteria(&["minimum_3_candidates", "relevance_score_above_0.7"]),
            Task::new("evaluate-match", Evaluation, "match-evaluator")
                .with_inputs(&["founder_profile", "candidate_resources"])
                .with_outputs(&["ranked_recommendations"])
                .with_criteria(&["resources_ranked", "fit_scores_calculated"]),
            Task::new("generate-response", Writing, "response-writer")
                .with_inputs(&["ranked_recommendations"])
                .with_outputs(&["final_recommendations"])
                .with_criteria(&["personalized_content", "actionable_next_steps"]),
        ],
        success_criteria: criteria(&[
            "founder_profile_complete",
            "needs_assessment_comprehensive",
            "minimum_3_relevant_resources",
            "personalized_recommendations",
            "clear_next_steps",
        ]),
        human_in_loop: vec![checkpoint(
            "after-evaluate-match",
            "review_resource_appropriateness",
            "auto_approve_if_confidence_above_0.9",
        )],
    }
}

fn grant_matching() -> WorkflowTemplate {
    use TaskType::*;

    WorkflowTemplate {
        name: "grant-matching".to_string(),
        description: "Match founders with suitable grants".to_string(),
        tasks: vec![
            Task::new("extract-grant-profile", Research, "grant-profile-extractor")
                .with_inputs(&["founder_profile", "grant_requirements"])
                .with_outputs(&["grant_eligibility_profile"])
                .with_criteria(&["eligibility_determined", "requirements_mapped"]),
            Task::new("search-grants", Research, "grant-searcher")
                .parallel(true)
                .with_inputs(&["grant_eligibility_profile"])
                .with_outputs(&["candidate_grants"])
                .with_criteria(&["deadline_valid", "eligibility_match_above_0.8"]),
            Task::new("score-grants", Evaluation, "grant-scorer")
                .parallel(true)
                .with_inputs(&["grant_eligibility_profile", "candidate_grants"])
                .with_outputs(&["grant_scores"])
                .with_criteria(&["fit_score_calculated", "success_probability_estimated"]),
            Task::new("prioritize-grants", Evaluation, "grant-prioritizer")
                .with_inputs(&["grant_scores"])
                .with_outputs(&["prioritized_grant_list"])
                .with_criteria(&["grants_ranked", "application_timeline_set"]),
            Task::new("prepare-applications", Writing, "application-preparer")
                .with_inputs(&["prioritized_grant_list", "founder_profile"])
                .with_outputs(&["application_materials"])
                .with_criteria(&["customized_proposals", "supporting_documents_identified"]),
        ],
        success_criteria: criteria(&[
            "minimum_5_eligible_grants",
            "grants_prioritized_by_fit",
            "application_materials_ready",
            "timeline_established",
        ]),
        human_in_loop: vec![checkpoint(
            "after-prioritize-grants",
            "review_grant_prioritization",
            "auto_proceed_if_top_3_above_0.85",
        )],
    }
}

fn resource_recommendation() -> WorkflowTemplate {
    use TaskType::*;

    WorkflowTemplate {
        name: "resource-recommendation".to_string(),
        description: "Provide resource recommendations based on needs".to_string(),
        tasks: vec![
            Task::new("analyze-request", Research, "request-analyzer")
                .with_inputs(&["user_request"])
                .with_outputs(&["parsed_request"])
                .with_criteria(&["intent_identified", "context_extracted"]),
            Task::new("search-knowledge-base", Research, "knowledge-searcher")
                .parallel(true)
                .with_inputs(&["parsed_request"])
                .with_outputs(&["knowledge_results"])
                .with_criteria(&["relevant_resources_found", "quality_score_above_0.6"]),
            Task::new("synthesize-recommendations", Writing, "recommendation-synthesizer")
                .with_inputs(&["knowledge_results", "parsed_request"])
                .with_outputs(&["recommendations"])
                .with_criteria(&["recommendations_structured", "relevance_explained"]),
        ],
        success_criteria: criteria(&[
            "request_understood",
            "relevant_resources_identified",
            "clear_recommendations_provided",
        ]),
        human_in_loop: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TEMPLATE_YAML: &str = r#"
name: mentor-match
description: Pair founders with mentors
tasks:
  - id: extract
    type: research
    agent: profile-extractor
    inputs: [user_input]
    outputs: [founder_profile]
    acceptance_criteria: [business_stage_identified]
  - id: write
    type: writing
    agent: response-writer
    inputs: [founder_profile]
success_criteria: [mentor_found]
"#;

    #[test]
    fn test_builtin_templates_are_valid() {
        let agents = AgentRegistry::builtin();
        let registry = TemplateRegistry::builtin();

        assert_eq!(registry.len(), 3);
        for template in registry.iter() {
            template.validate(&agents).unwrap();
        }
        assert_eq!(registry.get("founder-intake").unwrap().tasks.len(), 5);
        assert_eq!(registry.get("resource-recommendation").unwrap().tasks.len(), 3);
    }

    #[test]
    fn test_template_parsing() {
        let template = WorkflowTemplate::from_yaml(TEST_TEMPLATE_YAML).unwrap();

        assert_eq!(template.name, "mentor-match");
        assert_eq!(template.tasks.len(), 2);
        assert_eq!(template.tasks[1].task_type, TaskType::Writing);
        assert!(template.validate(&AgentRegistry::builtin()).is_ok());
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let mut template = WorkflowTemplate::from_yaml(TEST_TEMPLATE_YAML).unwrap();
        template.tasks[0].agent = "ghost".to_string();

        let err = template.validate(&AgentRegistry::builtin()).unwrap_err();
        assert!(matches!(err, PlanError::UnknownAgent { .. }));
    }

    #[test]
    fn test_duplicate_task_ids_rejected() {
        let mut template = WorkflowTemplate::from_yaml(TEST_TEMPLATE_YAML).unwrap();
        template.tasks[1].id = "extract".to_string();

        let err = template.validate(&AgentRegistry::builtin()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mentor.yaml"), TEST_TEMPLATE_YAML).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = TemplateRegistry::builtin();
        let loaded = registry
            .load_dir(dir.path(), &AgentRegistry::builtin())
            .unwrap();

        assert_eq!(loaded, 1);
        assert!(registry.get("mentor-match").is_some());
        assert_eq!(registry.len(), 4);
    }
}
