//! Shared state behind [`EventStream::tee`](crate::stream::EventStream::tee).
//!
//! Each branch has a FIFO of pulls it has not read yet. A branch with an
//! empty queue takes the source lock, pulls exactly one result and pushes a
//! copy onto the other branch's queue. Queues are unbounded: a branch that is
//! never read grows its queue for as long as the other branch advances. A
//! branch that is closed or dropped stops receiving copies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::lock::Mutex as AsyncMutex;
use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::ClientError;
use crate::stream::EventIter;

/// One pull from the source; `None` marks its end.
type Pulled<T> = Option<Result<T, ClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Pending results of one branch.
struct Backlog<T> {
    queue: VecDeque<Pulled<T>>,
    closed: bool,
}

impl<T> Default for Backlog<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            closed: false,
        }
    }
}

pub(crate) struct TeeShared<T> {
    source: AsyncMutex<EventIter<T>>,
    backlogs: Mutex<[Backlog<T>; 2]>,
    backlog_warning: Option<usize>,
}

impl<T: Clone> TeeShared<T> {
    pub(crate) fn new(source: EventIter<T>, backlog_warning: Option<usize>) -> Self {
        Self {
            source: AsyncMutex::new(source),
            backlogs: Mutex::new([Backlog::default(), Backlog::default()]),
            backlog_warning,
        }
    }

    /// Next result for `side`, from its queue or from one source pull.
    pub(crate) async fn next(&self, side: Side) -> Pulled<T> {
        if let Some(queued) = self.pop(side) {
            return queued;
        }

        let mut source = self.source.lock().await;
        // The other branch may have pulled while we waited for the lock.
        if let Some(queued) = self.pop(side) {
            return queued;
        }

        let pulled = source.next().await;
        self.push(side.other(), pulled.clone());
        pulled
    }

    pub(crate) fn pop(&self, side: Side) -> Option<Pulled<T>> {
        let mut backlogs = self.backlogs.lock().unwrap_or_else(PoisonError::into_inner);
        backlogs[side.index()].queue.pop_front()
    }

    /// Stop queueing for `side` and release what it had not read.
    fn close(&self, side: Side) {
        let mut backlogs = self.backlogs.lock().unwrap_or_else(PoisonError::into_inner);
        let backlog = &mut backlogs[side.index()];
        backlog.closed = true;
        backlog.queue.clear();
    }

    fn push(&self, side: Side, pulled: Pulled<T>) {
        let mut backlogs = self.backlogs.lock().unwrap_or_else(PoisonError::into_inner);
        let backlog = &mut backlogs[side.index()];
        if backlog.closed {
            return;
        }
        let queue = &mut backlog.queue;
        queue.push_back(pulled);

        if self.backlog_warning == Some(queue.len()) {
            warn!(
                side = ?side,
                backlog = queue.len(),
                "tee branch is falling behind; its backlog is unbounded"
            );
        }
    }
}

/// One side's handle on the shared tee state.
///
/// Dropping it closes that side, whether or not its stream was ever started.
pub(crate) struct BranchHandle<T: Clone> {
    shared: Arc<TeeShared<T>>,
    side: Side,
}

impl<T: Clone> BranchHandle<T> {
    pub(crate) fn new(shared: Arc<TeeShared<T>>, side: Side) -> Self {
        Self { shared, side }
    }

    fn pop(&self) -> Option<Pulled<T>> {
        self.shared.pop(self.side)
    }

    async fn next(&self) -> Pulled<T> {
        self.shared.next(self.side).await
    }
}

impl<T: Clone> Drop for BranchHandle<T> {
    fn drop(&mut self) {
        self.shared.close(self.side);
    }
}

/// Item stream of one tee branch.
///
/// Already queued results are delivered even after `cancel` fires; new
/// source pulls are not.
pub(crate) fn branch<T: Clone + Send + 'static>(
    handle: BranchHandle<T>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<T, ClientError>> + Send + 'static {
    stream::unfold((handle, cancel), |(handle, cancel)| async move {
        let pulled = match handle.pop() {
            Some(queued) => queued,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                pulled = handle.next() => pulled,
            },
        };
        pulled.map(|result| (result, (handle, cancel)))
    })
}
