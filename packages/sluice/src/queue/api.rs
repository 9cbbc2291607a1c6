// exposed API of the queue.

use self::future::*;
use super::{
    core::{Core, OfferStart, TakeStart},
    error::ShutdownError,
    strategy::OverflowStrategy,
};
use crate::util::ring::RingBuffer;


/// Async multi-producer multi-consumer queue with a pluggable overflow
/// strategy
///
/// A `Queue` is a cheaply clonable handle; every clone operates on the same
/// shared state. The overflow strategy is chosen by the constructor and
/// decides what happens to elements offered while the buffer is full:
///
/// - [`bounded`](Queue::bounded) — producers suspend until space frees
///   (backpressure).
/// - [`dropping`](Queue::dropping) — surplus elements are discarded and the
///   offer resolves `false`.
/// - [`sliding`](Queue::sliding) — the oldest buffered element is evicted to
///   make room and the offer resolves `true`.
/// - [`unbounded`](Queue::unbounded) — the buffer grows without bound.
///
/// Elements are taken in the order they entered the buffer. Takers parked on
/// an empty queue are satisfied in arrival order, directly from later offers,
/// bypassing the buffer.
pub struct Queue<T> {
    core: Core<T>,
}

impl<T> Queue<T> {
    /// Create a queue with the given capacity and the backpressure strategy
    pub fn bounded(capacity: usize) -> Self {
        Queue {
            core: Core::new(
                RingBuffer::bounded(capacity),
                OverflowStrategy::backpressure(),
            ),
        }
    }

    /// Create a queue with no capacity bound
    pub fn unbounded() -> Self {
        Queue { core: Core::new(RingBuffer::unbounded(), OverflowStrategy::Unbounded) }
    }

    /// Create a queue with the given capacity and the dropping strategy
    pub fn dropping(capacity: usize) -> Self {
        Queue {
            core: Core::new(RingBuffer::bounded(capacity), OverflowStrategy::Dropping),
        }
    }

    /// Create a queue with the given capacity and the sliding strategy
    pub fn sliding(capacity: usize) -> Self {
        Queue {
            core: Core::new(RingBuffer::bounded(capacity), OverflowStrategy::Sliding),
        }
    }

    /// Create a future to offer an element into this queue
    ///
    /// Resolves to `Ok(true)` once the element is delivered to a parked taker
    /// or buffered, `Ok(false)` if the dropping strategy discarded it, and
    /// `Err` if the queue is shut down (including a shutdown arriving while
    /// the offer is parked by the backpressure strategy).
    ///
    /// Dropping the future before it resolves withdraws a parked offer;
    /// elements of it that already reached the buffer stay there.
    pub fn offer(&self, item: T) -> OfferFut<T> {
        OfferFut {
            core: self.core.clone(),
            state: OfferState::Start(Some(Batch::One(item))),
        }
    }

    /// Create a future to offer every element of `items`, preserving their
    /// relative order
    ///
    /// Parked takers are satisfied first, one element each in taker-arrival
    /// order; the remainder is buffered; any surplus goes to the overflow
    /// strategy. Resolves to `Ok(true)` unless the dropping strategy
    /// discarded at least one element, in which case `Ok(false)`. Under the
    /// backpressure strategy the future resolves only once every element has
    /// been accepted.
    pub fn offer_all(&self, items: impl IntoIterator<Item = T>) -> OfferFut<T> {
        OfferFut {
            core: self.core.clone(),
            state: OfferState::Start(Some(Batch::Many(items.into_iter().collect()))),
        }
    }

    /// Create a future to take the next element from this queue
    ///
    /// Resolves immediately while the buffer is non-empty; otherwise parks
    /// until an offer arrives or the queue shuts down. Dropping the future
    /// unparks it; an element that raced with cancellation is handed to the
    /// next parked taker or returned to the buffer front, never lost.
    pub fn take(&self) -> TakeFut<T> {
        TakeFut { core: self.core.clone(), state: TakeState::Start }
    }

    /// Take the next element without suspending
    ///
    /// `Ok(None)` means the buffer was empty at the time of the call.
    pub fn try_take(&self) -> Result<Option<T>, ShutdownError> {
        self.core.try_take()
    }

    /// Take every buffered element
    ///
    /// Elements parked by backpressured offers are not included, but the
    /// freed space is immediately refilled from them.
    pub fn take_all(&self) -> Result<Vec<T>, ShutdownError> {
        self.core.take_all()
    }

    /// Take at most `n` buffered elements in FIFO order
    ///
    /// `n` is clamped to the buffered count; `n = 0` yields an empty vec.
    pub fn take_up_to(&self, n: usize) -> Result<Vec<T>, ShutdownError> {
        self.core.take_up_to(n)
    }

    /// Buffered element count, minus parked takers, plus elements parked by
    /// backpressured offers
    ///
    /// Negative by design when takers outnumber everything ever offered: a
    /// size of `-n` means `n` tasks are parked waiting for elements.
    pub fn size(&self) -> isize {
        self.core.size()
    }

    /// The capacity this queue was constructed with, or `None` if unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.core.capacity()
    }

    /// Whether no elements are buffered
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Whether the buffer is at capacity
    pub fn is_full(&self) -> bool {
        self.core.is_full()
    }

    /// Whether this queue has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Shut the queue down
    ///
    /// Every parked taker and every parked backpressured offerer is
    /// interrupted with [`ShutdownError`], buffered elements are discarded,
    /// and all subsequent operations fail with [`ShutdownError`]. Idempotent:
    /// later calls are no-ops.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Create a future that resolves once [`shutdown`](Self::shutdown) has
    /// run
    ///
    /// Resolves immediately if the queue is already shut down.
    pub fn await_shutdown(&self) -> AwaitShutdownFut<T> {
        AwaitShutdownFut { core: self.core.clone(), done: false }
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue { core: self.core.clone() }
    }
}


// future types for the queue.
pub(crate) mod future {
    use super::*;
    use crate::{
        queue::strategy::PendingOffer,
        util::oneshot::OneShot,
    };
    use std::{
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    // elements an offer future has yet to hand over.
    pub(super) enum Batch<T> {
        One(T),
        Many(Vec<T>),
    }

    /// Future for [`Queue::offer`] and [`Queue::offer_all`]
    ///
    /// See those methods for resolution semantics. Dropping an unresolved
    /// future withdraws a parked offer.
    pub struct OfferFut<T> {
        pub(super) core: Core<T>,
        pub(super) state: OfferState<T>,
    }

    pub(super) enum OfferState<T> {
        Start(Option<Batch<T>>),
        Parked(Arc<PendingOffer<T>>),
        Done,
    }

    impl<T> Unpin for OfferFut<T> {}

    impl<T> Future for OfferFut<T> {
        type Output = Result<bool, ShutdownError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            loop {
                match &mut this.state {
                    OfferState::Start(batch) => {
                        let started = match batch.take()
                            .expect("offer future polled after resolving")
                        {
                            Batch::One(item) => this.core.offer_start(item),
                            Batch::Many(items) => this.core.offer_all_start(items),
                        };
                        match started {
                            OfferStart::Ready(result) => {
                                this.state = OfferState::Done;
                                return Poll::Ready(result);
                            }
                            OfferStart::Parked(entry) => {
                                this.state = OfferState::Parked(entry);
                            }
                        }
                    }
                    OfferState::Parked(entry) => {
                        return match entry.poll(cx) {
                            Poll::Ready(result) => {
                                this.state = OfferState::Done;
                                Poll::Ready(result.map(|()| true))
                            }
                            Poll::Pending => Poll::Pending,
                        };
                    }
                    // for implementation of FusedFuture
                    OfferState::Done => return Poll::Pending,
                }
            }
        }
    }

    impl<T> OfferFut<T> {
        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, OfferState::Done)
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for OfferFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for OfferFut<T> {
        fn drop(&mut self) {
            if let OfferState::Parked(entry) = &self.state {
                self.core.cancel_offer(entry);
            }
        }
    }


    /// Future for [`Queue::take`]
    ///
    /// See that method for resolution and cancellation semantics.
    pub struct TakeFut<T> {
        pub(super) core: Core<T>,
        pub(super) state: TakeState<T>,
    }

    pub(super) enum TakeState<T> {
        Start,
        Parked(Arc<OneShot<T>>),
        Done,
    }

    impl<T> Unpin for TakeFut<T> {}

    impl<T> Future for TakeFut<T> {
        type Output = Result<T, ShutdownError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            loop {
                match &this.state {
                    TakeState::Start => match this.core.take_start() {
                        TakeStart::Ready(result) => {
                            this.state = TakeState::Done;
                            return Poll::Ready(result);
                        }
                        TakeStart::Parked(taker) => {
                            this.state = TakeState::Parked(taker);
                        }
                    },
                    TakeState::Parked(taker) => {
                        return match taker.poll_take(cx) {
                            Poll::Ready(Ok(value)) => {
                                this.state = TakeState::Done;
                                Poll::Ready(Ok(value))
                            }
                            Poll::Ready(Err(_)) => {
                                this.state = TakeState::Done;
                                Poll::Ready(Err(ShutdownError))
                            }
                            Poll::Pending => Poll::Pending,
                        };
                    }
                    // for implementation of FusedFuture
                    TakeState::Done => return Poll::Pending,
                }
            }
        }
    }

    impl<T> TakeFut<T> {
        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, TakeState::Done)
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for TakeFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for TakeFut<T> {
        fn drop(&mut self) {
            if let TakeState::Parked(taker) = &self.state {
                self.core.cancel_take(taker);
            }
        }
    }


    /// Future for [`Queue::await_shutdown`]
    pub struct AwaitShutdownFut<T> {
        pub(super) core: Core<T>,
        pub(super) done: bool,
    }

    impl<T> Unpin for AwaitShutdownFut<T> {}

    impl<T> Future for AwaitShutdownFut<T> {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.done {
                return Poll::Pending;
            }
            match this.core.poll_await_shutdown(cx) {
                Poll::Ready(()) => {
                    this.done = true;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            }
        }
    }

    impl<T> AwaitShutdownFut<T> {
        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.done
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for AwaitShutdownFut<T> {
        fn is_terminated(&self) -> bool {
            self.done
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        future::Future,
        pin::Pin,
        task::Poll,
        time::Duration,
    };

    // poll a future exactly once against a real waker, e.g. to park a taker
    // at a known point in the test.
    async fn poll_once<F: Future + Unpin>(fut: &mut F) -> Option<F::Output> {
        let mut once = Some(fut);
        futures::future::poll_fn(move |cx| {
            let fut = once.take().expect("polled twice");
            match Pin::new(fut).poll(cx) {
                Poll::Ready(out) => Poll::Ready(Some(out)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }

    // spin until the queue observes the expected size, so tests can wait for
    // forked operations to park.
    async fn wait_for_size<T>(queue: &Queue<T>, expected: isize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.size() != expected {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("queue never reached expected size");
    }

    #[tokio::test]
    async fn fifo_order_1000() {
        let queue = Queue::bounded(1000);
        for i in 1..=1000 {
            assert_eq!(queue.offer(i).await, Ok(true));
        }
        assert_eq!(queue.take_all(), Ok((1..=1000).collect::<Vec<_>>()));
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn fifo_order_unbounded() {
        let queue = Queue::unbounded();
        assert_eq!(queue.offer_all(1..=1000).await, Ok(true));
        for i in 1..=1000 {
            assert_eq!(queue.take().await, Ok(i));
        }
    }

    #[tokio::test]
    async fn dropping_capacity_law() {
        let queue = Queue::dropping(4);
        assert_eq!(queue.offer_all([1, 2, 3, 4, 5]).await, Ok(false));
        assert_eq!(queue.take_all(), Ok(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn dropping_single_offer() {
        let queue = Queue::dropping(1);
        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.offer(2).await, Ok(false));
        assert_eq!(queue.take_all(), Ok(vec![1]));
    }

    #[tokio::test]
    async fn sliding_eviction_law() {
        let queue = Queue::sliding(2);
        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.offer(2).await, Ok(true));
        assert_eq!(queue.offer(3).await, Ok(true));
        assert_eq!(queue.take_all(), Ok(vec![2, 3]));
    }

    #[tokio::test]
    async fn backpressure_blocks_then_resumes() {
        let queue = Queue::bounded(2);
        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.offer(2).await, Ok(true));

        let forked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(3).await })
        };
        // 2 buffered + 1 parked
        wait_for_size(&queue, 3).await;
        assert!(queue.is_full());

        assert_eq!(queue.take().await, Ok(1));
        assert_eq!(forked.await.unwrap(), Ok(true));
        assert_eq!(queue.take_all(), Ok(vec![2, 3]));
    }

    #[tokio::test]
    async fn negative_size_counts_parked_takers() {
        let queue = Queue::<u32>::bounded(50);
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.take().await })
            })
            .collect();
        wait_for_size(&queue, -100).await;

        assert_eq!(queue.offer_all(0..100).await, Ok(true));
        let mut received: Vec<u32> = Vec::new();
        for handle in handles {
            received.push(handle.await.unwrap().unwrap());
        }
        received.sort_unstable();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn parked_takers_resolve_in_arrival_order() {
        let queue = Queue::bounded(10);
        let mut first = queue.take();
        let mut second = queue.take();
        assert!(poll_once(&mut first).await.is_none());
        assert!(poll_once(&mut second).await.is_none());
        assert_eq!(queue.size(), -2);

        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.offer(2).await, Ok(true));
        assert_eq!(first.await, Ok(1));
        assert_eq!(second.await, Ok(2));
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn offer_all_satisfies_takers_first() {
        let queue = Queue::bounded(10);
        let mut first = queue.take();
        let mut second = queue.take();
        assert!(poll_once(&mut first).await.is_none());
        assert!(poll_once(&mut second).await.is_none());

        assert_eq!(queue.offer_all([1, 2, 3]).await, Ok(true));
        assert_eq!(first.await, Ok(1));
        assert_eq!(second.await, Ok(2));
        assert_eq!(queue.take_all(), Ok(vec![3]));
    }

    #[tokio::test]
    async fn shutdown_interrupts_parked_take() {
        let queue = Queue::<u32>::bounded(10);
        let forked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        wait_for_size(&queue, -1).await;

        queue.shutdown();
        assert_eq!(forked.await.unwrap(), Err(ShutdownError));
        assert!(queue.is_shutdown());

        // idempotent, and late observers resolve immediately
        queue.shutdown();
        queue.await_shutdown().await;
        assert_eq!(queue.offer(1).await, Err(ShutdownError));
        assert_eq!(queue.take().await, Err(ShutdownError));
        assert_eq!(queue.take_all(), Err(ShutdownError));
        assert_eq!(queue.try_take(), Err(ShutdownError));
    }

    #[tokio::test]
    async fn shutdown_interrupts_parked_offer() {
        let queue = Queue::bounded(1);
        assert_eq!(queue.offer(1).await, Ok(true));
        let forked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(2).await })
        };
        wait_for_size(&queue, 2).await;

        queue.shutdown();
        assert_eq!(forked.await.unwrap(), Err(ShutdownError));
    }

    #[tokio::test]
    async fn await_shutdown_parks_until_shutdown() {
        let queue = Queue::<u32>::bounded(1);
        let forked = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.await_shutdown().await;
                queue.is_shutdown()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert!(forked.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_take_unparks() {
        let queue = Queue::<u32>::bounded(10);
        let mut fut = queue.take();
        assert!(poll_once(&mut fut).await.is_none());
        assert_eq!(queue.size(), -1);
        drop(fut);
        assert_eq!(queue.size(), 0);

        // the queue is unaffected afterwards
        assert_eq!(queue.offer(7).await, Ok(true));
        assert_eq!(queue.take().await, Ok(7));
    }

    #[tokio::test]
    async fn cancelled_offer_unparks() {
        let queue = Queue::bounded(1);
        assert_eq!(queue.offer(1).await, Ok(true));
        let mut fut = queue.offer(2);
        assert!(poll_once(&mut fut).await.is_none());
        assert_eq!(queue.size(), 2);
        drop(fut);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.take_all(), Ok(vec![1]));
    }

    #[tokio::test]
    async fn take_up_to_clamps() {
        let queue = Queue::bounded(10);
        assert_eq!(queue.offer_all(1..=5).await, Ok(true));
        assert_eq!(queue.take_up_to(0), Ok(vec![]));
        assert_eq!(queue.take_up_to(2), Ok(vec![1, 2]));
        assert_eq!(queue.take_up_to(99), Ok(vec![3, 4, 5]));
        assert_eq!(queue.take_up_to(1), Ok(vec![]));
    }

    #[tokio::test]
    async fn take_up_to_releases_backpressure() {
        let queue = Queue::bounded(2);
        assert_eq!(queue.offer_all([1, 2]).await, Ok(true));
        let forked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer_all([3, 4]).await })
        };
        wait_for_size(&queue, 4).await;

        assert_eq!(queue.take_up_to(2), Ok(vec![1, 2]));
        assert_eq!(forked.await.unwrap(), Ok(true));
        assert_eq!(queue.take_all(), Ok(vec![3, 4]));
    }

    #[tokio::test]
    async fn try_take_never_parks() {
        let queue = Queue::bounded(2);
        assert_eq!(queue.try_take(), Ok(None));
        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.try_take(), Ok(Some(1)));
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn capacity_observers() {
        let queue = Queue::<u32>::bounded(3);
        assert_eq!(queue.capacity(), Some(3));
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(Queue::<u32>::unbounded().capacity(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_consumers_conserve_elements() {
        use rand::prelude::*;
        use rand_pcg::Pcg32;

        let queue = Queue::bounded(8);
        let producers: Vec<_> = (0u64..4)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut rng = Pcg32::seed_from_u64(p);
                    for i in 0..250u64 {
                        let value = p * 1_000 + i;
                        assert_eq!(queue.offer(value).await, Ok(true));
                        if rng.gen_ratio(1, 8) {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    for _ in 0..250 {
                        got.push(queue.take().await.unwrap());
                    }
                    got
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        let mut all: Vec<u64> = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        let mut expected: Vec<u64> =
            (0..4).flat_map(|p| (0..250).map(move |i| p * 1_000 + i)).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert_eq!(queue.size(), 0);
    }
}
