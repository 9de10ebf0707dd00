//! Chronological candle queue shared by the data feed and the bot run loop.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use vela_core::Candle;

/// Heap entry ordered by the candle's `(time, updated_at, pair)` key.
struct Entry(Candle);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.chronological_cmp(&other.0)
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    sinks: Vec<mpsc::UnboundedSender<Candle>>,
}

/// Min-heap of candles with a notify-on-push hook.
///
/// In backtests every candle is enqueued before draining, so `pop` observes a
/// strict global ordering. In live mode each `push` hands the current minimum
/// to the registered drain channels; under concurrent producers the drained
/// sequence is only guaranteed non-decreasing at steady state.
pub struct CandleQueue {
    inner: Mutex<Inner>,
}

impl CandleQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                sinks: Vec::new(),
            }),
        }
    }

    /// Insert a candle and forward the queue minimum to every drain channel.
    pub fn push(&self, candle: Candle) {
        let sinks = {
            let mut inner = self.inner.lock().expect("candle queue poisoned");
            inner.heap.push(Reverse(Entry(candle)));
            if inner.sinks.is_empty() {
                return;
            }
            inner.sinks.clone()
        };
        // The drain sends happen outside the heap lock so a consumer calling
        // back into the queue cannot deadlock.
        for sink in sinks {
            if let Some(next) = self.pop() {
                if sink.send(next).is_err() {
                    self.remove_closed_sinks();
                }
            }
        }
    }

    /// Remove and return the chronologically smallest candle.
    pub fn pop(&self) -> Option<Candle> {
        let mut inner = self.inner.lock().expect("candle queue poisoned");
        inner.heap.pop().map(|Reverse(Entry(candle))| candle)
    }

    /// The chronologically smallest candle without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Candle> {
        let inner = self.inner.lock().expect("candle queue poisoned");
        inner.heap.peek().map(|Reverse(Entry(candle))| candle.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("candle queue poisoned");
        inner.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a drain channel: every subsequent push pops the queue minimum
    /// and delivers it here in heap order.
    pub fn pop_stream(&self) -> mpsc::UnboundedReceiver<Candle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("candle queue poisoned");
        inner.sinks.push(tx);
        rx
    }

    fn remove_closed_sinks(&self) {
        let mut inner = self.inner.lock().expect("candle queue poisoned");
        inner.sinks.retain(|sink| !sink.is_closed());
    }
}

impl Default for CandleQueue {
    fn default() -> Self {
        Self::new()
    }
}
