//! Event-loop timers.
//!
//! An ordered set of timer events resolved cooperatively by the run loop:
//! nothing fires until [`TimerWheel::resolve`] is called, which invokes the
//! expired handlers on the calling thread and returns the time until the
//! next expiry so the loop knows how long the multiplexer may block.
//!
//! Adding a timer pokes the wheel's wakeup channel, so a loop blocked in
//! the multiplexer recomputes its deadline.

use crate::wakeup::WakeupChannel;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Identifies a timer within its wheel. Ids are recycled LIFO once their
/// queue entries have drained through a `resolve` pass.
pub type TimerId = usize;

/// Sentinel returned by a successful [`TimerWheel::remove`].
pub const INVALID_TIMER: TimerId = usize::MAX;

type Handler = Box<dyn FnMut(TimerId) + Send>;

struct Event {
    /// Taken out of the slot while the handler runs outside the lock;
    /// `None` also marks a slot whose id sits on the free stack.
    handler: Option<Handler>,
    period: Duration,
    /// Shared with in-flight resolve passes so a racing `remove` is seen
    /// at the moment of dispatch.
    armed: Arc<AtomicBool>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventRef {
    expires_at: Instant,
    id: TimerId,
}

#[derive(Default)]
struct WheelState {
    events: Vec<Event>,
    queue: BinaryHeap<Reverse<EventRef>>,
    free_ids: Vec<TimerId>,
}

/// An expired entry collected under the lock, dispatched outside it.
struct ReadyTimer {
    eref: EventRef,
    armed: Arc<AtomicBool>,
    handler: Handler,
    period: Duration,
}

/// Ordered timer set with `add` / `remove` / `resolve` semantics.
///
/// The wheel is safe to use from any thread; handlers run on whichever
/// thread calls `resolve` (the loop thread, in normal operation) and are
/// invoked with the wheel's lock released, so they may call back into
/// `add` and `remove` freely.
pub struct TimerWheel {
    state: Mutex<WheelState>,
    wakeup: WakeupChannel,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WheelState::default()),
            wakeup: WakeupChannel::new(),
        }
    }

    pub(crate) fn wakeup(&self) -> &WakeupChannel {
        &self.wakeup
    }

    /// Add a one-shot timer firing `after` from now.
    pub fn add(&self, after: Duration, handler: impl FnMut(TimerId) + Send + 'static) -> TimerId {
        self.add_at(Instant::now() + after, Duration::ZERO, handler)
    }

    /// Add a periodic timer first firing `after` from now, then every
    /// `period` relative to the previous expiry (drift-free).
    pub fn add_periodic(
        &self,
        after: Duration,
        period: Duration,
        handler: impl FnMut(TimerId) + Send + 'static,
    ) -> TimerId {
        self.add_at(Instant::now() + after, period, handler)
    }

    /// Add a timer with an absolute first expiry. `period` of zero means
    /// one-shot.
    pub fn add_at(
        &self,
        when: Instant,
        period: Duration,
        handler: impl FnMut(TimerId) + Send + 'static,
    ) -> TimerId {
        let mut state = self.state.lock();

        // Prefer a recycled id.
        let id = state.free_ids.pop().unwrap_or(state.events.len());
        if id == state.events.len() {
            state.events.push(Event {
                handler: None,
                period: Duration::ZERO,
                armed: Arc::new(AtomicBool::new(false)),
            });
        }

        let event = &mut state.events[id];
        event.handler = Some(Box::new(handler));
        event.period = period;
        event.armed.store(true, Ordering::SeqCst);

        state.queue.push(Reverse(EventRef { expires_at: when, id }));
        drop(state);

        self.wakeup.interrupt();
        id
    }

    /// Disarm the timer `id`.
    ///
    /// Returns `id` unchanged when it does not name a known slot (so the
    /// call is a no-op whose return value tells the caller "still
    /// invalid"), otherwise [`INVALID_TIMER`]. Designed for
    /// self-assignment:
    ///
    /// ```ignore
    /// let mut timer = wheel.add(Duration::from_secs(1), |_| {});
    /// timer = wheel.remove(timer); // timer == INVALID_TIMER
    /// ```
    ///
    /// The id returns to the free pool once its queue entry drains
    /// through the next `resolve` pass.
    pub fn remove(&self, id: TimerId) -> TimerId {
        let state = self.state.lock();
        if id >= state.events.len() {
            return id;
        }
        state.events[id].armed.store(false, Ordering::SeqCst);
        INVALID_TIMER
    }

    /// Fire every expired, still-armed handler and return the time until
    /// the next expiry, floored at zero. `None` means the queue is empty.
    pub fn resolve(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut ready = {
            let mut state = self.state.lock();
            dequeue(&mut state, now)
        };

        // Handlers run with the lock released; they may re-enter the
        // wheel. A remove that raced in is honored here, before dispatch.
        for timer in &mut ready {
            if timer.armed.load(Ordering::SeqCst) {
                (timer.handler)(timer.eref.id);
            }
            if timer.period.is_zero() {
                timer.armed.store(false, Ordering::SeqCst);
            }
        }

        let mut state = self.state.lock();
        for timer in ready {
            if timer.armed.load(Ordering::SeqCst) {
                state.events[timer.eref.id].handler = Some(timer.handler);
                state.queue.push(Reverse(EventRef {
                    expires_at: timer.eref.expires_at + timer.period,
                    id: timer.eref.id,
                }));
            } else {
                state.events[timer.eref.id].handler = None;
                state.free_ids.push(timer.eref.id);
            }
        }

        state
            .queue
            .peek()
            .map(|Reverse(head)| head.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Exchange the contents of two wheels. Locks are taken in address
    /// order; self-swap is a no-op.
    pub fn swap(&self, other: &TimerWheel) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (first, second) = if (self as *const TimerWheel) < (other as *const TimerWheel) {
            (self, other)
        } else {
            (other, self)
        };

        let mut a = first.state.lock();
        let mut b = second.state.lock();
        std::mem::swap(&mut *a, &mut *b);
        self.wakeup.swap(&other.wakeup);
    }
}

/// Pop expired heads under the lock. Unarmed heads are drained on the
/// spot: their handler slot is cleared and the id returns to the free
/// pool, whether or not they have expired.
fn dequeue(state: &mut WheelState, now: Instant) -> Vec<ReadyTimer> {
    let mut ready = Vec::new();

    while let Some(Reverse(head)) = state.queue.peek().copied() {
        if !state.events[head.id].armed.load(Ordering::SeqCst) {
            state.events[head.id].handler = None;
            state.free_ids.push(head.id);
            state.queue.pop();
            continue;
        }

        if now < head.expires_at {
            break;
        }

        let event = &mut state.events[head.id];
        let Some(handler) = event.handler.take() else {
            state.queue.pop();
            continue;
        };
        ready.push(ReadyTimer {
            eref: head,
            armed: event.armed.clone(),
            handler,
            period: event.period,
        });
        state.queue.pop();
    }

    ready
}
