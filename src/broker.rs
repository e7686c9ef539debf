use crate::{transport::Transport, AcceptError, Channel, ChannelError, ListenerError};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{select, sync::Notify};
use tokio_util::{
    sync::CancellationToken,
    task::{task_tracker::TaskTrackerToken, TaskTracker},
};
use tracing::{debug, trace};

/// Default capacity of the pending-connection queue.
pub const DEFAULT_MAX_PENDING: usize = 1;

/// Reasons a connection attempt is refused before upgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum Refusal {
    /// The broker has been closed.
    #[error("listener is closed")]
    Closed,
    /// Queued and reserved connections have reached capacity.
    #[error("connection queue is full")]
    Full,
}

#[derive(Debug)]
struct State<T: Transport> {
    queue: VecDeque<Channel<T>>,
    /// Slots promised to attempts that have not finished upgrading.
    reserved: usize,
    capacity: usize,
    closed: bool,
}

/// Bounded queue bridging per-connection upgrade tasks and `accept` callers.
///
/// Producers first [`reserve`] a slot, which fails fast when the queue is
/// full or closed, and then [`fulfill`] it with an upgraded transport. The
/// fulfilling task stays alive until the channel it enqueued is done. The
/// queue and the closed flag share one mutex, which is never held across an
/// `.await`.
///
/// [`reserve`]: Self::reserve
/// [`fulfill`]: Reservation::fulfill
#[derive(Debug)]
pub(crate) struct Broker<T: Transport> {
    state: Mutex<State<T>>,
    /// Woken whenever a channel is enqueued or the broker closes.
    notify: Notify,
    /// Tracks every outstanding reservation, including fulfilled ones whose
    /// channel is still open.
    tasks: TaskTracker,
}

impl<T: Transport> Broker<T> {
    /// Create a broker holding at most `capacity` unaccepted channels. A
    /// capacity of 0 is treated as 1.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                reserved: 0,
                capacity: capacity.max(1),
                closed: false,
            }),
            notify: Notify::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once [`Self::close`] has been called.
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of channels waiting to be accepted.
    pub(crate) fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    fn reserved(&self) -> usize {
        self.lock().reserved
    }

    /// Reserve a queue slot for a connection that is about to be upgraded.
    pub(crate) fn reserve(self: &Arc<Self>) -> Result<Reservation<T>, Refusal> {
        let mut state = self.lock();
        if state.closed {
            return Err(Refusal::Closed);
        }
        if state.queue.len() + state.reserved >= state.capacity {
            return Err(Refusal::Full);
        }
        state.reserved += 1;
        trace!(reserved = state.reserved, "reserved queue slot");

        Ok(Reservation {
            broker: Arc::clone(self),
            token: self.tasks.token(),
            released: false,
        })
    }

    /// Wait for the next queued channel.
    ///
    /// A fired `cancel` token takes precedence over both queued channels and
    /// closure.
    pub(crate) async fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Channel<T>, AcceptError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before inspecting the queue, so a concurrent enqueue
            // cannot slip between the check and the wait
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(AcceptError::Cancelled);
            }
            {
                let mut state = self.lock();
                if let Some(channel) = state.queue.pop_front() {
                    return Ok(channel);
                }
                if state.closed {
                    return Err(AcceptError::Closed);
                }
            }

            select! {
                biased;
                _ = cancel.cancelled() => return Err(AcceptError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Stop admitting connections, close every queued channel, and wait for
    /// all outstanding reservations to finish.
    ///
    /// Channels already handed out by [`Self::accept`] must be closed (or
    /// dropped) by their owners before this returns.
    pub(crate) async fn close(&self) -> Result<(), ListenerError> {
        let pending = {
            let mut state = self.lock();
            if state.closed {
                return Err(ListenerError::AlreadyClosed);
            }
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        self.notify.notify_waiters();
        self.tasks.close();

        debug!(pending = pending.len(), "closing listener");
        let mut failed: Option<ChannelError> = None;
        for channel in pending {
            if let Err(err) = channel.close().await {
                failed.get_or_insert(err);
            }
        }

        self.tasks.wait().await;
        debug!("listener closed");

        failed.map_or(Ok(()), |err| Err(ListenerError::Drain(err)))
    }
}

/// A queue slot held by one connection attempt.
///
/// Dropping an unfulfilled reservation (e.g. because the upgrade failed)
/// returns the slot to the broker. A fulfilled reservation does not keep the
/// broker alive, so dropping every handle to the broker without closing it
/// drops the queued channels.
#[derive(Debug)]
pub(crate) struct Reservation<T: Transport> {
    broker: Arc<Broker<T>>,
    token: TaskTrackerToken,
    released: bool,
}

impl<T: Transport> Reservation<T> {
    /// Enqueue a channel built from `transport`, then wait until that channel
    /// is done.
    ///
    /// If the broker closed while the transport was being upgraded, the
    /// channel is closed immediately instead.
    pub(crate) async fn fulfill(mut self, transport: T) {
        let channel = Channel::new(transport);
        let done = channel.done_token();

        let refused = {
            let mut state = self.broker.lock();
            state.reserved -= 1;
            self.released = true;
            if state.closed {
                Some(channel)
            } else {
                state.queue.push_back(channel);
                None
            }
        };

        if let Some(channel) = refused {
            debug!("listener closed during upgrade, dropping connection");
            if let Err(err) = channel.close().await {
                debug!(%err, "failed to close refused channel");
            }
            return;
        }

        self.broker.notify.notify_waiters();
        trace!("channel queued");

        // The queue owns the channel now. Holding the broker while waiting
        // would keep both alive after every listener handle is gone.
        let token = self.token.clone();
        drop(self);

        done.cancelled().await;
        trace!("channel done");
        drop(token);
    }
}

impl<T: Transport> Drop for Reservation<T> {
    fn drop(&mut self) {
        if !self.released {
            self.broker.lock().reserved -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{transport_pair, TestTransport};
    use std::time::Duration;
    use tokio::{task::JoinHandle, time::timeout};

    const WAIT: Duration = Duration::from_secs(1);

    /// Reserve and fulfill a slot, returning the peer end and the task that
    /// stays alive while the queued channel is open.
    async fn connect(
        broker: &Arc<Broker<TestTransport>>,
    ) -> (Channel<TestTransport>, JoinHandle<()>) {
        let reservation = broker.reserve().expect("slot available");
        let (local, remote) = transport_pair().await;
        let task = tokio::spawn(reservation.fulfill(local));
        // wait for the channel to land in the queue
        while broker.reserved() > 0 && !task.is_finished() {
            tokio::task::yield_now().await;
        }
        (Channel::new(remote), task)
    }

    #[tokio::test]
    async fn capacity_is_at_least_one() {
        let broker = Arc::new(Broker::<TestTransport>::new(0));
        let held = broker.reserve().unwrap();
        assert_eq!(broker.reserve().unwrap_err(), Refusal::Full);
        drop(held);
        broker.reserve().unwrap();
    }

    #[tokio::test]
    async fn backpressure() {
        let broker = Arc::new(Broker::new(2));
        let (_p1, _t1) = connect(&broker).await;
        let (_p2, _t2) = connect(&broker).await;
        assert_eq!(broker.pending(), 2);

        assert_eq!(broker.reserve().unwrap_err(), Refusal::Full);

        let ch = broker.accept(&CancellationToken::new()).await.unwrap();
        let (_p3, _t3) = connect(&broker).await;
        assert_eq!(broker.pending(), 2);
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_is_fifo() {
        let broker = Arc::new(Broker::new(2));
        let (first, _t1) = connect(&broker).await;
        let (second, _t2) = connect(&broker).await;
        let cancel = CancellationToken::new();

        first.send("first").await.unwrap();
        second.send("second").await.unwrap();

        let a = broker.accept(&cancel).await.unwrap();
        let b = broker.accept(&cancel).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), "first");
        assert_eq!(b.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn accept_waits_for_enqueue() {
        let broker = Arc::new(Broker::<TestTransport>::new(1));
        let waiter = tokio::spawn({
            let broker = broker.clone();
            async move { broker.accept(&CancellationToken::new()).await }
        });
        tokio::task::yield_now().await;

        let (_peer, task) = connect(&broker).await;
        let ch = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();

        assert!(!task.is_finished());
        ch.close().await.unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let broker = Arc::new(Broker::<TestTransport>::new(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = timeout(WAIT, broker.accept(&cancel)).await.unwrap();
        assert_eq!(res.unwrap_err(), AcceptError::Cancelled);

        broker.close().await.unwrap();
        let res = timeout(WAIT, broker.accept(&cancel)).await.unwrap();
        assert_eq!(res.unwrap_err(), AcceptError::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_is_per_call() {
        let broker = Arc::new(Broker::<TestTransport>::new(1));
        let cancel = CancellationToken::new();

        let cancelled = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.accept(&cancel).await }
        });
        let other = tokio::spawn({
            let broker = broker.clone();
            async move { broker.accept(&CancellationToken::new()).await }
        });
        tokio::task::yield_now().await;

        cancel.cancel();
        let res = timeout(WAIT, cancelled).await.unwrap().unwrap();
        assert_eq!(res.unwrap_err(), AcceptError::Cancelled);

        let (_peer, _task) = connect(&broker).await;
        let ch = timeout(WAIT, other).await.unwrap().unwrap().unwrap();
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_wakes_accept() {
        let broker = Arc::new(Broker::<TestTransport>::new(1));
        let waiter = tokio::spawn({
            let broker = broker.clone();
            async move { broker.accept(&CancellationToken::new()).await }
        });
        tokio::task::yield_now().await;

        broker.close().await.unwrap();
        let res = timeout(WAIT, waiter).await.unwrap().unwrap();
        assert_eq!(res.unwrap_err(), AcceptError::Closed);
    }

    #[tokio::test]
    async fn close_drains_queue() {
        let broker = Arc::new(Broker::new(3));
        let mut peers = vec![];
        let mut tasks = vec![];
        for _ in 0..3 {
            let (peer, task) = connect(&broker).await;
            peers.push(peer);
            tasks.push(task);
        }

        timeout(WAIT, broker.close()).await.unwrap().unwrap();

        assert_eq!(broker.pending(), 0);
        assert!(tasks.iter().all(JoinHandle::is_finished));
        for peer in peers {
            assert!(peer.recv().await.unwrap_err().is_closed());
        }
        assert_eq!(broker.reserve().unwrap_err(), Refusal::Closed);
    }

    #[tokio::test]
    async fn close_waits_for_accepted_channels() {
        let broker = Arc::new(Broker::new(1));
        let (_peer, task) = connect(&broker).await;
        let ch = broker.accept(&CancellationToken::new()).await.unwrap();

        let closing = tokio::spawn({
            let broker = broker.clone();
            async move { broker.close().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());
        assert!(!task.is_finished());

        ch.close().await.unwrap();
        timeout(WAIT, closing).await.unwrap().unwrap().unwrap();
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn close_twice() {
        let broker = Broker::<TestTransport>::new(1);
        broker.close().await.unwrap();
        assert!(broker.is_closed());
        assert!(matches!(
            broker.close().await,
            Err(ListenerError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn upgrade_after_close_is_refused() {
        let broker = Arc::new(Broker::new(1));
        let reservation = broker.reserve().unwrap();

        let closing = tokio::spawn({
            let broker = broker.clone();
            async move { broker.close().await }
        });
        while !broker.is_closed() {
            tokio::task::yield_now().await;
        }

        let (local, remote) = transport_pair().await;
        timeout(WAIT, reservation.fulfill(local)).await.unwrap();
        assert!(Channel::new(remote).recv().await.unwrap_err().is_closed());

        timeout(WAIT, closing).await.unwrap().unwrap().unwrap();
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn dropping_broker_releases_queue() {
        let broker = Arc::new(Broker::new(1));
        let (peer, task) = connect(&broker).await;
        assert_eq!(broker.pending(), 1);

        drop(broker);
        timeout(WAIT, task).await.expect("task hung").unwrap();
        assert!(peer.recv().await.unwrap_err().is_closed());
    }
}
