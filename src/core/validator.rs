//! Acceptance validation of agent responses.

use serde_json::Value;

use crate::domain::Task;

/// Decides whether an agent response satisfies a task's acceptance criteria
pub trait AcceptanceValidator: Send + Sync {
    /// Returns the criteria the response does not satisfy; empty means accepted
    fn missing_criteria(&self, task: &Task, content: &Value) -> Vec<String>;
}

/// Accepts a response whose serialized text mentions every criterion,
/// ignoring case
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringValidator;

impl AcceptanceValidator for SubstringValidator {
    fn missing_criteria(&self, task: &Task, content: &Value) -> Vec<String> {
        if task.acceptance_criteria.is_empty() {
            return Vec::new();
        }

        let text = match content {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };

        task.acceptance_criteria
            .iter()
            .filter(|criterion| !text.contains(&criterion.to_lowercase()))
            .cloned()
            .collect()
    }
}
