use std::sync::Arc;

use tracing::debug;

use crate::{
    operation::{Operation, OperationHandle, OperationStatus},
    orchestrator::CoreState,
    OperationId,
};

/// The set of in-flight operations, kept in registration order.
///
/// The registry guarantees one operation per key: a second request for a
/// pending key merges its completion callback onto the existing operation
/// instead of starting a second fetch. Within one tick, operations complete
/// in the order they were registered.
#[derive(Default)]
pub(crate) struct OperationRegistry {
    pending: Vec<Operation>,
}

impl OperationRegistry {
    pub fn contains(&self, id: &OperationId) -> bool {
        self.pending.iter().any(|op| op.id() == id)
    }

    pub fn find_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        self.pending.iter_mut().find(|op| op.id() == id)
    }

    /// Register a new operation. The caller is responsible for having
    /// checked for an existing one with the same key first.
    pub fn push(&mut self, operation: Operation) -> OperationHandle {
        debug_assert!(!self.contains(operation.id()));
        debug!("registered operation {}", operation.id());
        let handle = operation.handle();
        self.pending.push(operation);
        handle
    }

    /// Observable status cells of every pending bundle fetch; preload
    /// aggregates are built from these.
    pub fn pending_bundle_fetches(&self) -> Vec<(OperationId, Arc<OperationStatus>)> {
        self.pending
            .iter()
            .filter(|op| op.is_bundle_fetch())
            .map(|op| (op.id().clone(), Arc::clone(op.status())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Poll every pending operation once; operations that no longer need
    /// polling are removed and finished exactly once, in registration order.
    pub fn tick(&mut self, state: &mut CoreState) {
        let operations = std::mem::take(&mut self.pending);
        let mut still_pending = Vec::with_capacity(operations.len());

        for mut operation in operations {
            if operation.poll(state) {
                still_pending.push(operation);
            } else {
                operation.finish(state);
            }
        }
        self.pending = still_pending;
    }

    /// Cancel every pending operation and clear the registry. Cached results
    /// are untouched.
    pub fn cancel_all(&mut self, state: &mut CoreState) {
        for operation in std::mem::take(&mut self.pending) {
            operation.cancel(state);
        }
    }
}
