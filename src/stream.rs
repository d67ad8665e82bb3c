//! Single-pass event streams with tee and byte-stream bridging.
//!
//! An [`EventStream`] is bound to one transport at construction. It may be
//! iterated once; [`EventStream::tee`] is the way to get two independent
//! views of one source. When iteration ends early or fails, the transport is
//! aborted through the stream's cancellation handle.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::ready;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientError;
use crate::options::StreamOptions;
use crate::tee::{self, BranchHandle, Side, TeeShared};

/// Stream of decoded items or errors.
pub type ItemStream<T> = BoxStream<'static, Result<T, ClientError>>;

type Factory<T> = Box<dyn FnOnce() -> ItemStream<T> + Send>;

/// Consumption state of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    NotStarted,
    InProgress,
    Consumed,
}

type SharedPhase = Arc<Mutex<StreamPhase>>;

fn set_phase(phase: &SharedPhase, next: StreamPhase) {
    *phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// A single-pass stream of decoded items bound to one transport.
///
/// # Example
/// ```
/// use futures::{executor::block_on, stream};
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
/// use tokenflow::stream::EventStream;
///
/// let mut events = EventStream::new(
///     || stream::iter(vec![Ok(json!(1)), Ok(json!(2))]),
///     CancellationToken::new(),
/// );
/// let items = block_on(events.collect_items()).unwrap();
/// assert_eq!(items, vec![json!(1), json!(2)]);
/// assert!(events.iter().is_err());
/// ```
pub struct EventStream<T> {
    factory: Option<Factory<T>>,
    phase: SharedPhase,
    cancel: CancellationToken,
    options: StreamOptions,
}

impl<T: Send + 'static> EventStream<T> {
    /// Create a stream from an item-stream factory and the cancellation
    /// handle of the transport behind it.
    pub fn new<F, S>(factory: F, cancel: CancellationToken) -> Self
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Result<T, ClientError>> + Send + 'static,
    {
        Self {
            factory: Some(Box::new(move || factory().boxed())),
            phase: Arc::new(Mutex::new(StreamPhase::NotStarted)),
            cancel,
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn phase(&self) -> StreamPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancellation_handle(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Abort the underlying transport. Iteration in progress ends quietly.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Start the single allowed iteration.
    ///
    /// Fails with [`ClientError::AlreadyConsumed`] on any later call.
    pub fn iter(&mut self) -> Result<EventIter<T>, ClientError> {
        let factory = self.factory.take().ok_or(ClientError::AlreadyConsumed)?;
        set_phase(&self.phase, StreamPhase::InProgress);

        Ok(EventIter {
            inner: Some(factory()),
            cancel: self.cancel.clone(),
            phase: self.phase.clone(),
        })
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_items(&mut self) -> Result<Vec<T>, ClientError> {
        let mut items = Vec::new();
        let mut iter = self.iter()?;
        while let Some(item) = iter.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Bridge into a stream of `JSON + "\n"` byte chunks.
    ///
    /// Items are pulled one at a time as the consumer polls. Dropping or
    /// closing the returned stream closes the iteration behind it.
    pub fn to_json_lines(&mut self) -> Result<JsonLines<T>, ClientError>
    where
        T: Serialize,
    {
        Ok(JsonLines { items: self.iter()? })
    }
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Split into two streams that observe the same ordered sequence.
    ///
    /// The source advances at the pace of the faster branch; the slower
    /// branch buffers everything it has not read yet, without bound. Closing
    /// or dropping one branch discards its backlog and leaves the other
    /// running; the transport is released once both are gone.
    pub fn tee(mut self) -> Result<(EventStream<T>, EventStream<T>), ClientError> {
        let source = self.iter()?;
        let shared = Arc::new(TeeShared::new(source, self.options.tee_backlog_warning));
        Ok((
            self.branch(shared.clone(), Side::Left),
            self.branch(shared, Side::Right),
        ))
    }

    fn branch(&self, shared: Arc<TeeShared<T>>, side: Side) -> EventStream<T> {
        let cancel = self.cancel.child_token();
        let branch_cancel = cancel.clone();
        let handle = BranchHandle::new(shared, side);
        EventStream::new(move || tee::branch(handle, branch_cancel), cancel)
            .with_options(self.options.clone())
    }
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("phase", &*self.phase.lock().unwrap_or_else(PoisonError::into_inner))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// The single iteration of an [`EventStream`].
///
/// Ends after the first error. Closing it before the source is drained
/// aborts the transport; dropping it closes it.
pub struct EventIter<T> {
    inner: Option<ItemStream<T>>,
    cancel: CancellationToken,
    phase: SharedPhase,
}

impl<T> EventIter<T> {
    /// Stop iterating and release the transport.
    ///
    /// Aborts the transport if the source was not yet drained. Calling it
    /// again, or after the end of the stream, does nothing.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("closing stream before it was drained, aborting transport");
            self.cancel.cancel();
            set_phase(&self.phase, StreamPhase::Consumed);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    fn complete(&mut self) {
        self.inner = None;
        set_phase(&self.phase, StreamPhase::Consumed);
    }
}

impl<T> Stream for EventIter<T> {
    type Item = Result<T, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(inner.poll_next_unpin(cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(err)) => {
                this.close();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.complete();
                Poll::Ready(None)
            }
        }
    }
}

impl<T> Drop for EventIter<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Byte-stream view of an [`EventStream`], one `JSON + "\n"` chunk per item.
///
/// Can be handed to any transport that accepts a stream of `Bytes`, and read
/// back with [`EventStream::from_readable_stream`].
pub struct JsonLines<T> {
    items: EventIter<T>,
}

impl<T> JsonLines<T> {
    /// Cancel from the consumer side, releasing the source.
    pub fn close(&mut self) {
        self.items.close();
    }
}

impl<T: Serialize> Stream for JsonLines<T> {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let chunk = match ready!(this.items.poll_next_unpin(cx)) {
            Some(Ok(item)) => match serde_json::to_vec(&item) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Ok(Bytes::from(line))
                }
                Err(err) => {
                    this.items.close();
                    Err(ClientError::Serialize(Arc::new(err)))
                }
            },
            Some(Err(err)) => Err(err),
            None => return Poll::Ready(None),
        };
        Poll::Ready(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn values(items: Vec<Value>) -> EventStream<Value> {
        EventStream::new(
            move || stream::iter(items.into_iter().map(Ok)),
            CancellationToken::new(),
        )
    }

    fn numbers(count: i64) -> EventStream<Value> {
        values((0..count).map(|n| json!(n)).collect())
    }

    #[tokio::test]
    async fn test_single_consumption() {
        let mut events = numbers(3);
        assert_eq!(events.phase(), StreamPhase::NotStarted);

        let items = events.collect_items().await.unwrap();
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(events.phase(), StreamPhase::Consumed);

        let err = events.iter().err().unwrap();
        assert!(matches!(err, ClientError::AlreadyConsumed));
        assert!(err.to_string().contains("tee()"));
    }

    #[tokio::test]
    async fn test_phase_while_in_progress() {
        let mut events = numbers(2);
        let mut iter = events.iter().unwrap();
        assert_eq!(events.phase(), StreamPhase::InProgress);
        assert!(iter.next().await.is_some());
        assert!(iter.next().await.is_some());
        assert!(iter.next().await.is_none());
        assert!(iter.is_finished());
        assert_eq!(events.phase(), StreamPhase::Consumed);
        // drained streams leave the transport alone
        drop(iter);
        assert!(!events.cancellation_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_early_close_aborts_transport() {
        let mut events = numbers(5);
        let mut iter = events.iter().unwrap();
        assert_eq!(iter.next().await.unwrap().unwrap(), json!(0));

        iter.close();
        assert!(events.cancellation_handle().is_cancelled());
        assert!(iter.next().await.is_none());
        assert_eq!(events.phase(), StreamPhase::Consumed);
    }

    #[tokio::test]
    async fn test_drop_aborts_transport() {
        let mut events = numbers(5);
        {
            let mut iter = events.iter().unwrap();
            iter.next().await;
        }
        assert!(events.cancellation_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_error_ends_iteration_and_aborts() {
        let mut events = EventStream::new(
            || {
                stream::iter(vec![
                    Ok(json!(1)),
                    Err(ClientError::EmptyBody),
                    Ok(json!(2)),
                ])
            },
            CancellationToken::new(),
        );
        let mut iter = events.iter().unwrap();
        assert!(iter.next().await.unwrap().is_ok());
        assert!(matches!(iter.next().await, Some(Err(ClientError::EmptyBody))));
        assert!(iter.next().await.is_none());
        assert!(events.cancellation_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_factory_runs_on_first_iteration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut events = EventStream::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                stream::iter(vec![Ok(json!(null))])
            },
            CancellationToken::new(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ = events.iter().unwrap();
        let _ = events.iter();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tee_sequential_drain() {
        let (mut left, mut right) = numbers(5).tee().unwrap();
        let expected: Vec<Value> = (0..5).map(|n| json!(n)).collect();

        assert_eq!(left.collect_items().await.unwrap(), expected);
        assert_eq!(right.collect_items().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_tee_interleaved_drain() {
        let (mut left, mut right) = numbers(6).tee().unwrap();
        let mut left_iter = left.iter().unwrap();
        let mut right_iter = right.iter().unwrap();

        let mut seen_left = Vec::new();
        let mut seen_right = Vec::new();
        loop {
            let l = left_iter.next().await;
            let r = right_iter.next().await;
            match (l, r) {
                (Some(l), Some(r)) => {
                    seen_left.push(l.unwrap());
                    seen_right.push(r.unwrap());
                }
                (None, None) => break,
                other => panic!("branches diverged: {other:?}"),
            }
        }
        assert_eq!(seen_left.len(), 6);
        assert_eq!(seen_left, seen_right);
    }

    #[tokio::test]
    async fn test_tee_branches_consume_once_each() {
        let (mut left, mut right) = numbers(1).tee().unwrap();
        assert!(left.collect_items().await.is_ok());
        assert!(right.collect_items().await.is_ok());
        assert!(matches!(left.iter(), Err(ClientError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_tee_after_consumption_fails() {
        let mut events = numbers(1);
        let _iter = events.iter().unwrap();
        assert!(matches!(events.tee(), Err(ClientError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_tee_closing_one_branch_keeps_other() {
        let events = numbers(4);
        let root = events.cancellation_handle().clone();
        let (mut left, mut right) = events.tee().unwrap();

        let mut left_iter = left.iter().unwrap();
        assert_eq!(left_iter.next().await.unwrap().unwrap(), json!(0));
        left_iter.close();
        assert!(left.cancellation_handle().is_cancelled());
        assert!(!root.is_cancelled());

        let expected: Vec<Value> = (0..4).map(|n| json!(n)).collect();
        assert_eq!(right.collect_items().await.unwrap(), expected);
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_tee_releases_source_when_both_branches_drop() {
        let events = numbers(4);
        let root = events.cancellation_handle().clone();
        let (mut left, right) = events.tee().unwrap();

        let mut left_iter = left.iter().unwrap();
        left_iter.next().await;
        drop(left_iter);
        drop(left);
        assert!(!root.is_cancelled());
        drop(right);
        assert!(root.is_cancelled());
    }

    #[tokio::test]
    async fn test_tee_closed_branch_holds_no_items() {
        let marker = Arc::new(());
        let source_marker = marker.clone();
        let events = EventStream::new(
            move || {
                stream::iter(std::iter::repeat_with(move || Ok(source_marker.clone())).take(1000))
            },
            CancellationToken::new(),
        );
        let (mut left, mut right) = events.tee().unwrap();

        let mut left_iter = left.iter().unwrap();
        left_iter.close();
        drop(left_iter);
        drop(left);

        let mut right_iter = right.iter().unwrap();
        for _ in 0..100 {
            drop(right_iter.next().await.unwrap().unwrap());
        }
        // the test and the source closure hold the only references
        assert_eq!(Arc::strong_count(&marker), 2);
    }

    #[tokio::test]
    async fn test_tee_unstarted_branch_dropped_holds_no_items() {
        let marker = Arc::new(());
        let source_marker = marker.clone();
        let events = EventStream::new(
            move || stream::iter(std::iter::repeat_with(move || Ok(source_marker.clone())).take(10)),
            CancellationToken::new(),
        );
        let (left, mut right) = events.tee().unwrap();
        drop(left);

        let items = right.collect_items().await.unwrap();
        assert_eq!(items.len(), 10);
        drop(items);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[tokio::test]
    async fn test_tee_shares_errors() {
        let events = EventStream::new(
            || stream::iter(vec![Ok(json!(1)), Err(ClientError::EmptyBody)]),
            CancellationToken::new(),
        );
        let (mut left, mut right) = events.tee().unwrap();
        for branch in [&mut left, &mut right] {
            let mut iter = branch.iter().unwrap();
            assert_eq!(iter.next().await.unwrap().unwrap(), json!(1));
            assert!(matches!(iter.next().await, Some(Err(ClientError::EmptyBody))));
            assert!(iter.next().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_root_abort_ends_both_branches() {
        let events = EventStream::new(
            || stream::iter(vec![Ok(json!(1))]).chain(stream::pending()),
            CancellationToken::new(),
        );
        let root = events.cancellation_handle().clone();
        let (mut left, mut right) = events.tee().unwrap();
        let mut left_iter = left.iter().unwrap();
        let mut right_iter = right.iter().unwrap();

        assert!(left_iter.next().await.is_some());
        root.cancel();
        assert!(left_iter.next().await.is_none());
        assert_eq!(right_iter.next().await.unwrap().unwrap(), json!(1));
        assert!(right_iter.next().await.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_bridge() {
        let mut events = values(vec![json!({"a": 1}), json!("two")]);
        let chunks: Vec<Bytes> = events
            .to_json_lines()
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from("{\"a\":1}\n"), Bytes::from("\"two\"\n")]);
        assert_eq!(events.phase(), StreamPhase::Consumed);
        assert!(matches!(events.to_json_lines(), Err(ClientError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_json_lines_consumer_cancel() {
        let mut events = numbers(10);
        let mut lines = events.to_json_lines().unwrap();
        assert_eq!(lines.next().await.unwrap().unwrap(), Bytes::from("0\n"));
        lines.close();
        assert!(lines.next().await.is_none());
        assert!(events.cancellation_handle().is_cancelled());
    }
}
