//! Single-input, multi-subscriber fan-out
//!
//! A `Broadcaster` owns the input channel handed out by `run` and copies
//! every message to each subscriber in registration order. Each subscriber
//! has its own drop policy, so a slow or dead consumer never holds up the
//! producer or the other subscribers:
//!
//! - non-blocking: the message is dropped for that subscriber if its
//!   queue is full
//! - timeout: the subscriber gets up to the configured duration to accept
//!   the message before it is dropped
//!
//! A subscriber whose receiver is gone is marked inactive for good; every
//! later message counts as dropped without a send attempt.
//!
//! On cancellation the dispatch thread first closes the input, so no
//! producer send can succeed from then on, and then drains whatever is
//! still buffered to the active subscribers before exiting. Every message
//! a producer got `Ok` for is therefore either delivered or counted as
//! dropped. Exiting drops the subscriber senders, so subscribers see
//! disconnection after the last message they were given.

use crossbeam_channel::{bounded, select, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::BroadcastError;

/// Why a single send did not deliver
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("channel full")]
    Full,

    #[error("send timeout")]
    Timeout,

    #[error("channel closed")]
    Closed,
}

/// Attempt a send without blocking
pub fn send_non_blocking<T>(tx: &Sender<T>, msg: T) -> Result<(), SendError> {
    tx.try_send(msg).map_err(|e| match e {
        TrySendError::Full(_) => SendError::Full,
        TrySendError::Disconnected(_) => SendError::Closed,
    })
}

/// Send, waiting at most `timeout` for room
pub fn send_with_timeout<T>(tx: &Sender<T>, msg: T, timeout: Duration) -> Result<(), SendError> {
    tx.send_timeout(msg, timeout).map_err(|e| match e {
        SendTimeoutError::Timeout(_) => SendError::Timeout,
        SendTimeoutError::Disconnected(_) => SendError::Closed,
    })
}

/// How long a blocking `BroadcastInput::send` holds the input open per attempt
const SEND_RETRY: Duration = Duration::from_millis(1);

/// Producer side of a broadcaster's input channel.
///
/// Sends check the closed flag under a read lock; the dispatcher takes the
/// write lock to close the input, so no send is in flight once it drains.
#[derive(Debug)]
pub struct BroadcastInput<T> {
    tx: Sender<T>,
    closed: Arc<RwLock<bool>>,
}

impl<T> BroadcastInput<T> {
    /// Queue `msg` if there is room
    pub fn try_send(&self, msg: T) -> Result<(), SendError> {
        let closed = self.closed.read();
        if *closed {
            return Err(SendError::Closed);
        }
        send_non_blocking(&self.tx, msg)
    }

    /// Block until `msg` is queued or the input is closed
    pub fn send(&self, mut msg: T) -> Result<(), SendError> {
        loop {
            let closed = self.closed.read();
            if *closed {
                return Err(SendError::Closed);
            }
            match self.tx.send_timeout(msg, SEND_RETRY) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => msg = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(SendError::Closed),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }
}

impl<T> Clone for BroadcastInput<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// A plain channel as input: closed only when its receiver is dropped
impl<T> From<Sender<T>> for BroadcastInput<T> {
    fn from(tx: Sender<T>) -> Self {
        Self {
            tx,
            closed: Arc::new(RwLock::new(false)),
        }
    }
}

/// How long a subscriber may hold up a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    NonBlocking,
    Timeout(Duration),
}

#[derive(Default)]
struct SubscriberState {
    dropped: AtomicU64,
    inactive: AtomicBool,
}

struct Subscriber<T> {
    tx: Sender<T>,
    policy: DropPolicy,
    state: Arc<SubscriberState>,
}

impl<T> Subscriber<T> {
    fn send(&self, msg: T) {
        if self.state.inactive.load(Ordering::Acquire) {
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let result = match self.policy {
            DropPolicy::NonBlocking => send_non_blocking(&self.tx, msg),
            DropPolicy::Timeout(timeout) => send_with_timeout(&self.tx, msg, timeout),
        };

        if let Err(e) = result {
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
            if e == SendError::Closed {
                self.state.inactive.store(true, Ordering::Release);
                tracing::debug!("Subscriber closed, marking inactive");
            } else {
                tracing::trace!("Subscriber dropped message: {}", e);
            }
        }
    }
}

/// Per-subscriber delivery health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages this subscriber did not receive
    pub dropped: u64,
    /// Receiver is gone; no further sends are attempted
    pub inactive: bool,
}

/// Fan-out from one producer to many subscribers
pub struct Broadcaster<T> {
    pending: Vec<Subscriber<T>>,
    states: Vec<Arc<SubscriberState>>,
    input_capacity: Option<usize>,
    started: bool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            states: Vec::new(),
            input_capacity: None,
            started: false,
            dispatch: Mutex::new(None),
        }
    }

    /// Use an input queue of `capacity` messages instead of two per subscriber
    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = Some(capacity.max(1));
        self
    }

    /// Add a subscriber that drops messages while its queue is full.
    /// Must be called before `run`.
    pub fn subscribe(&mut self, tx: Sender<T>) {
        self.add(tx, DropPolicy::NonBlocking);
    }

    /// Add a subscriber that gets up to `timeout` to accept each message.
    /// Must be called before `run`.
    pub fn subscribe_with_timeout(&mut self, tx: Sender<T>, timeout: Duration) {
        self.add(tx, DropPolicy::Timeout(timeout));
    }

    fn add(&mut self, tx: Sender<T>, policy: DropPolicy) {
        if self.started {
            tracing::warn!("Subscriber added after run() is ignored");
            return;
        }
        let state = Arc::new(SubscriberState::default());
        self.states.push(state.clone());
        self.pending.push(Subscriber { tx, policy, state });
    }

    pub fn subscriber_count(&self) -> usize {
        self.states.len()
    }

    /// Start dispatching and return the input producers send into.
    ///
    /// The broadcaster keeps no sender of its own: dropping every returned
    /// input also ends the dispatch loop.
    pub fn run(&mut self, token: &CancelToken) -> Result<BroadcastInput<T>, BroadcastError> {
        if self.started {
            return Err(BroadcastError::AlreadyStarted);
        }
        if self.pending.is_empty() {
            return Err(BroadcastError::NoSubscribers);
        }

        let capacity = self.input_capacity.unwrap_or(self.pending.len() * 2);
        let (input_tx, input_rx) = bounded::<T>(capacity);
        let input = BroadcastInput::from(input_tx);
        let closed = input.closed.clone();
        let subscribers = std::mem::take(&mut self.pending);
        let token = token.clone();

        let handle = thread::Builder::new()
            .name("broadcast-dispatch".to_string())
            .spawn(move || {
                let mut forwarded: u64 = 0;
                loop {
                    select! {
                        recv(input_rx) -> msg => match msg {
                            Ok(msg) => {
                                dispatch(&subscribers, msg);
                                forwarded += 1;
                            }
                            Err(_) => {
                                tracing::debug!("Broadcast input closed by producers");
                                break;
                            }
                        },
                        recv(token.signal()) -> _ => {
                            *closed.write() = true;
                            let mut drained = 0u64;
                            while let Ok(msg) = input_rx.try_recv() {
                                dispatch(&subscribers, msg);
                                drained += 1;
                            }
                            forwarded += drained;
                            tracing::debug!("Broadcaster cancelled, drained {} buffered message(s)", drained);
                            break;
                        }
                    }
                }
                tracing::debug!("Broadcaster stopped after {} message(s)", forwarded);
            })
            .map_err(|e| BroadcastError::Spawn(e.to_string()))?;

        *self.dispatch.lock() = Some(handle);
        self.started = true;
        Ok(input)
    }

    /// Block until the dispatch loop, including its drain, has finished.
    /// Safe to call from several threads; returns at once if never run.
    pub fn wait(&self) {
        let mut dispatch = self.dispatch.lock();
        if let Some(handle) = dispatch.take() {
            if handle.join().is_err() {
                tracing::error!("Broadcast dispatch thread panicked");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Delivery health per subscriber, in registration order
    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.states
            .iter()
            .map(|s| SubscriberStats {
                dropped: s.dropped.load(Ordering::Relaxed),
                inactive: s.inactive.load(Ordering::Acquire),
            })
            .collect()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch<T: Clone>(subscribers: &[Subscriber<T>], msg: T) {
    if let Some((last, rest)) = subscribers.split_last() {
        for subscriber in rest {
            subscriber.send(msg.clone());
        }
        last.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    fn collect<T>(rx: &Receiver<T>) -> Vec<T> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_run_without_subscribers() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::<i32>::new();
        let err = broadcaster.run(&token).unwrap_err();
        assert_eq!(err, BroadcastError::NoSubscribers);
        assert!(err.to_string().contains("no subscribers"));
    }

    #[test]
    fn test_run_twice() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::<i32>::new();
        let (tx, _rx) = bounded(10);
        broadcaster.subscribe(tx);

        let _input = broadcaster.run(&token).unwrap();
        let err = broadcaster.run(&token).unwrap_err();
        assert!(err.to_string().contains("already started"));

        token.cancel();
        broadcaster.wait();
    }

    #[test]
    fn test_single_subscriber_receives_all() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, rx) = bounded(10);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        input.send(1).unwrap();
        input.send(2).unwrap();
        input.send(3).unwrap();

        token.cancel();
        broadcaster.wait();

        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(broadcaster.stats(), vec![SubscriberStats::default()]);
    }

    #[test]
    fn test_multiple_subscribers_same_sequence() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (tx, rx) = bounded(100);
                broadcaster.subscribe(tx);
                rx
            })
            .collect();

        let input = broadcaster.run(&token).unwrap();
        for i in 0..50 {
            input.send(i).unwrap();
        }

        token.cancel();
        broadcaster.wait();

        let expected: Vec<i32> = (0..50).collect();
        for rx in &receivers {
            assert_eq!(rx.iter().collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn test_non_blocking_subscriber_drops_when_full() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, rx) = bounded(1);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        input.send(1).unwrap();
        input.send(2).unwrap();

        token.cancel();
        broadcaster.wait();

        assert_eq!(collect(&rx), vec![1]);
        let stats = broadcaster.stats();
        assert_eq!(stats[0].dropped, 1);
        assert!(!stats[0].inactive);
    }

    #[test]
    fn test_always_full_subscriber_drops_everything() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        // rendezvous channel nobody reads from is permanently full
        let (tx, _rx) = bounded::<i32>(0);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        for i in 0..10 {
            input.send(i).unwrap();
        }

        token.cancel();
        broadcaster.wait();

        assert_eq!(broadcaster.stats()[0], SubscriberStats { dropped: 10, inactive: false });
    }

    #[test]
    fn test_closed_subscriber_becomes_inactive() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (closed_tx, closed_rx) = bounded::<i32>(10);
        let (open_tx, open_rx) = bounded::<i32>(10);
        broadcaster.subscribe(closed_tx);
        broadcaster.subscribe(open_tx);
        drop(closed_rx);

        let input = broadcaster.run(&token).unwrap();
        for i in 0..5 {
            input.send(i).unwrap();
        }

        token.cancel();
        broadcaster.wait();

        let stats = broadcaster.stats();
        assert_eq!(stats[0], SubscriberStats { dropped: 5, inactive: true });
        assert_eq!(stats[1], SubscriberStats::default());
        assert_eq!(open_rx.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timeout_subscriber_waits_then_drops() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, rx) = bounded(1);
        broadcaster.subscribe_with_timeout(tx, Duration::from_millis(10));

        let input = broadcaster.run(&token).unwrap();
        let begin = Instant::now();
        input.send(1).unwrap();
        input.send(2).unwrap();
        input.send(3).unwrap();

        token.cancel();
        broadcaster.wait();

        assert!(begin.elapsed() >= Duration::from_millis(20));
        assert_eq!(collect(&rx), vec![1]);
        assert_eq!(broadcaster.stats()[0].dropped, 2);
    }

    #[test]
    fn test_timeout_subscriber_accepts_slow_reader() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, rx) = bounded(1);
        broadcaster.subscribe_with_timeout(tx, Duration::from_secs(2));

        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            for msg in rx.iter() {
                thread::sleep(Duration::from_millis(2));
                received.push(msg);
            }
            received
        });

        let input = broadcaster.run(&token).unwrap();
        for i in 0..20 {
            input.send(i).unwrap();
        }

        token.cancel();
        broadcaster.wait();

        assert_eq!(reader.join().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(broadcaster.stats()[0].dropped, 0);
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (slow_tx, _slow_rx) = bounded::<i32>(0);
        let (fast_tx, fast_rx) = bounded::<i32>(100);
        broadcaster.subscribe(slow_tx);
        broadcaster.subscribe(fast_tx);

        let input = broadcaster.run(&token).unwrap();
        for i in 0..30 {
            input.send(i).unwrap();
        }

        token.cancel();
        broadcaster.wait();

        assert_eq!(fast_rx.iter().count(), 30);
        assert_eq!(broadcaster.stats()[0].dropped, 30);
    }

    #[test]
    fn test_cancel_drains_buffered_input() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new().with_input_capacity(1000);
        let (tx, rx) = bounded(1000);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        for i in 0..500 {
            input.send(i).unwrap();
        }
        token.cancel();
        broadcaster.wait();

        assert_eq!(rx.iter().collect::<Vec<_>>(), (0..500).collect::<Vec<_>>());
        // input is closed once the dispatch loop is gone
        assert!(input.send(0).is_err());
    }

    #[test]
    fn test_sends_racing_cancel_are_accounted() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new().with_input_capacity(64);
        let (tx, rx) = bounded::<u64>(16);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        let producer = thread::spawn(move || {
            let mut accepted = 0u64;
            loop {
                match input.try_send(accepted) {
                    Ok(()) => accepted += 1,
                    Err(SendError::Full) => thread::yield_now(),
                    Err(_) => return accepted,
                }
            }
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let accepted = producer.join().unwrap();
        broadcaster.wait();

        assert!(accepted > 0);
        let received = rx.try_iter().count() as u64;
        assert_eq!(received + broadcaster.stats()[0].dropped, accepted);
    }

    #[test]
    fn test_plain_sender_as_input() {
        let (tx, rx) = bounded(1);
        let input = BroadcastInput::from(tx);
        assert_eq!(input.try_send(1), Ok(()));
        assert_eq!(input.try_send(2), Err(SendError::Full));
        assert!(!input.is_closed());
        drop(rx);
        assert_eq!(input.send(3), Err(SendError::Closed));
    }

    #[test]
    fn test_dropping_producers_ends_dispatch() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, rx) = bounded(10);
        broadcaster.subscribe(tx);

        let input = broadcaster.run(&token).unwrap();
        input.send("a").unwrap();
        drop(input);

        broadcaster.wait();
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_wait_from_many_threads() {
        let token = CancelToken::new();
        let mut broadcaster = Broadcaster::new();
        let (tx, _rx) = bounded::<u8>(1);
        broadcaster.subscribe(tx);
        let _input = broadcaster.run(&token).unwrap();

        let broadcaster = Arc::new(broadcaster);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let broadcaster = broadcaster.clone();
                thread::spawn(move || broadcaster.wait())
            })
            .collect();

        token.cancel();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn test_send_helpers() {
        let (tx, rx) = bounded(1);
        assert_eq!(send_non_blocking(&tx, 1), Ok(()));
        assert_eq!(send_non_blocking(&tx, 2), Err(SendError::Full));
        assert_eq!(
            send_with_timeout(&tx, 3, Duration::from_millis(1)),
            Err(SendError::Timeout)
        );
        drop(rx);
        assert_eq!(send_non_blocking(&tx, 4), Err(SendError::Closed));
        assert_eq!(
            send_with_timeout(&tx, 5, Duration::from_millis(1)),
            Err(SendError::Closed)
        );
    }
}
