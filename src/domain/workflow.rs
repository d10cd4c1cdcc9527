//! Workflow specifications and the tasks they are made of.
//!
//! A WorkflowSpec is produced by the planner and handed to the executor.
//! Tasks form a DAG through their `inputs`.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunConstraints;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Evaluation,
    Writing,
}

/// Optional workflow mode that adds evaluation tasks and criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactTier {
    #[default]
    Standard,
    Impact,
}

/// A single unit of work in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id, unique within the workflow
    pub id: String,

    /// Kind of work
    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Agent that executes the task
    pub agent: String,

    /// Whether the task may run concurrently with other ready tasks
    #[serde(default)]
    pub parallel: bool,

    /// Task ids, output names or external seeds this task consumes
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Names of the outputs this task produces
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Tokens the result must contain to be accepted
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Token budget for the agent call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Complexity factors the planner detected for this run
    #[serde(default)]
    pub complexity_factors: Vec<String>,
}

pub(crate) fn default_max_tokens() -> u64 {
    4000
}

pub(crate) fn default_timeout_ms() -> u64 {
    30_000
}

impl Task {
    /// Create a task with default limits
    pub fn new(id: impl Into<String>, task_type: TaskType, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type,
            agent: agent.into(),
            parallel: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            acceptance_criteria: Vec::new(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_timeout_ms(),
            complexity_factors: Vec::new(),
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// An ethical/impact constraint activated for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactConstraint {
    pub name: String,
    pub description: String,
    pub rules: Vec<String>,
    pub weight: f64,
}

/// A point in the workflow where a human may review results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanCheckpoint {
    pub step: String,
    pub purpose: String,
    pub fallback: String,
}

/// Fully planned workflow, ready for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub goal: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub success_criteria: Vec<String>,
    pub impact_constraints: Vec<ImpactConstraint>,
    #[serde(default)]
    pub impact_tier: ImpactTier,
    #[serde(default)]
    pub human_in_loop: Vec<HumanCheckpoint>,
    /// Budget the executor enforces for this run
    #[serde(default)]
    pub constraints: RunConstraints,
    /// Values for external seed inputs (keys no task produces)
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowSpec {
    /// Get a task by id
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Every key some task in this spec produces: task ids and output names
    pub fn produced_keys(&self) -> HashSet<&str> {
        let mut keys = HashSet::new();
        for task in &self.tasks {
            keys.insert(task.id.as_str());
            keys.extend(task.outputs.iter().map(String::as_str));
        }
        keys
    }

    /// Input keys no task produces; the executor seeds them from the context
    pub fn seed_inputs(&self) -> Vec<String> {
        let produced = self.produced_keys();
        let mut seeds: Vec<String> = Vec::new();
        for task in &self.tasks {
            for input in &task.inputs {
                if !produced.contains(input.as_str()) && !seeds.contains(input) {
                    seeds.push(input.clone());
                }
            }
        }
        seeds
    }

    /// Value for an external seed input, falling back to the goal
    pub fn seed_value(&self, key: &str) -> serde_json::Value {
        self.context
            .get(key)
            .cloned()
            .unwrap_or_else(|| serde_json::Value::String(self.goal.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(tasks: Vec<Task>) -> WorkflowSpec {
        WorkflowSpec {
            run_id: Uuid::new_v4(),
            workflow_type: "test".to_string(),
            goal: "find a mentor".to_string(),
            description: String::new(),
            tasks,
            success_criteria: Vec::new(),
            impact_constraints: Vec::new(),
            impact_tier: ImpactTier::Standard,
            human_in_loop: Vec::new(),
            constraints: RunConstraints::default(),
            context: BTreeMap::new(),
            estimated_duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_seed_inputs() {
        let spec = spec_with(vec![
            Task::new("a", TaskType::Research, "x")
                .with_inputs(&["user_input"])
                .with_outputs(&["profile"]),
            Task::new("b", TaskType::Writing, "y").with_inputs(&["profile", "a", "extra"]),
        ]);

        assert_eq!(spec.seed_inputs(), vec!["user_input", "extra"]);
    }

    #[test]
    fn test_seed_value_falls_back_to_goal() {
        let mut spec = spec_with(vec![]);
        spec.context
            .insert("extra".to_string(), serde_json::json!({"k": 1}));

        assert_eq!(spec.seed_value("extra"), serde_json::json!({"k": 1}));
        assert_eq!(spec.seed_value("user_input"), serde_json::json!("find a mentor"));
    }

    #[test]
    fn test_task_yaml_field_names() {
        let yaml = r#"
id: draft
type: writing
agent: response-writer
acceptance_criteria: [personalized_content]
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.task_type, TaskType::Writing);
        assert!(!task.parallel);
        assert_eq!(task.timeout_ms, 30_000);
    }
}
