//! Per-agent concurrency gate.
//!
//! Every agent declares how many calls it accepts at once. Tasks wait for a
//! slot on their agent's semaphore before entering the resilience stack, so
//! a parallel batch never overloads a single agent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::AgentDescriptor;

#[derive(Debug, Default)]
pub struct CapacityGate {
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl CapacityGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, agent: &AgentDescriptor) -> Arc<Semaphore> {
        self.slots
            .lock()
            .entry(agent.id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(agent.max_concurrent.max(1))))
            .clone()
    }

    /// Wait for a free slot on `agent`. The slot is released when the permit
    /// drops. Gate semaphores are never closed, so this only yields `None`
    /// if that changes.
    pub async fn acquire(&self, agent: &AgentDescriptor) -> Option<OwnedSemaphorePermit> {
        self.semaphore(agent).acquire_owned().await.ok()
    }

    /// Slots currently free for `agent`
    pub fn available(&self, agent: &AgentDescriptor) -> usize {
        self.semaphore(agent).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentRegistry;

    #[tokio::test]
    async fn test_slots_bounded_by_max_concurrent() {
        let agents = AgentRegistry::builtin();
        let agent = agents.get("profile-extractor").unwrap();
        let gate = CapacityGate::new();

        let mut permits = Vec::new();
        for _ in 0..agent.max_concurrent {
            permits.push(gate.acquire(agent).await.unwrap());
        }
        assert_eq!(gate.available(agent), 0);

        drop(permits.pop());
        assert_eq!(gate.available(agent), 1);
    }
}
