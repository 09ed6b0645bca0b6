//! Tag-correlated continuations, queued per request category.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;
use twoway_core::{Category, EngineError, NodeHandle, RequestTag};

/// Invoked with each matching delivery. Returns true once the operation is
/// fully resolved; false keeps it at the front of its queue.
pub type Continuation = Box<dyn FnMut(&Result<(), EngineError>, &[NodeHandle]) -> bool + Send>;

/// One outstanding request.
pub struct PendingOp {
    pub tag: RequestTag,
    /// Node the request is about, for diagnostics.
    pub target: Option<NodeHandle>,
    continuation: Continuation,
}

/// FIFO queues of pending operations, one per [`Category`].
#[derive(Default)]
pub struct Dispatcher {
    queues: BTreeMap<Category, VecDeque<PendingOp>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        category: Category,
        tag: RequestTag,
        target: Option<NodeHandle>,
        continuation: Continuation,
    ) {
        self.queues.entry(category).or_default().push_back(PendingOp {
            tag,
            target,
            continuation,
        });
    }

    /// Route one engine completion. Returns true if it was consumed by the
    /// front operation of `category`; anything else is dropped.
    pub fn deliver(
        &mut self,
        category: Category,
        tag: RequestTag,
        result: &Result<(), EngineError>,
        handles: &[NodeHandle],
    ) -> bool {
        let Some(queue) = self.queues.get_mut(&category) else {
            debug!("Dropping {} result for tag {}: nothing pending", category, tag);
            return false;
        };
        let Some(front) = queue.front_mut() else {
            debug!("Dropping {} result for tag {}: nothing pending", category, tag);
            return false;
        };
        if front.tag != tag {
            debug!(
                "Dropping {} result for tag {}: expecting tag {} (target {:?})",
                category, tag, front.tag, front.target
            );
            return false;
        }
        if (front.continuation)(result, handles) {
            queue.pop_front();
        }
        true
    }

    pub fn pending(&self, category: Category) -> usize {
        self.queues.get(&category).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    /// Discard every pending operation. Promises captured by the
    /// continuations are dropped with them.
    pub fn clear(&mut self) -> usize {
        let count = self.queues.values().map(VecDeque::len).sum();
        self.queues.clear();
        count
    }
}
