use binary_heap_plus::{BinaryHeap, MinComparator};
use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub};

const MAX_EVENTS: usize = 16;

/// The `Scheduler` orders the driver's polling callbacks in time.
///
/// Time is measured in microseconds since the driver started; the worker
/// advances `current_time` and drains everything that has come due.
#[derive(Debug)]
pub struct Scheduler {
    /// Time the worker has advanced to, in microseconds.
    pub current_time: DriverTime,
    /// The queue of events to be processed, soonest first.
    event_queue: BinaryHeap<Event, MinComparator>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            current_time: 0u32.into(),
            event_queue: BinaryHeap::with_capacity_min(MAX_EVENTS),
        }
    }

    /// Set the current time to the next closest event.
    #[inline]
    pub fn skip_to_next_event(&mut self) {
        if let Some(event) = self.event_queue.peek() {
            self.current_time = event.timestamp;
        }
    }

    /// Timestamp of the soonest scheduled event.
    #[inline]
    pub fn next_event_time(&self) -> Option<DriverTime> {
        self.event_queue.peek().map(|event| event.timestamp)
    }

    /// Returns any event that should be executed at less than or equal to the
    /// current time.
    ///
    /// The event is removed from the scheduler.
    #[inline]
    pub fn pop_current(&mut self) -> Option<Event> {
        if self
            .event_queue
            .peek()
            .map_or(false, |event| event.timestamp <= self.current_time)
        {
            self.event_queue.pop()
        } else {
            None
        }
    }

    /// Remove all events with the given tag.
    pub fn remove_event(&mut self, tag: EventTag) {
        let mut current_vec = std::mem::replace(&mut self.event_queue, BinaryHeap::new_min()).into_vec();
        current_vec.retain(|event| event.tag != tag);
        self.event_queue = BinaryHeap::from_vec(current_vec);
    }

    /// Clears all scheduled events.
    pub fn clear_events(&mut self) {
        self.event_queue.clear();
    }

    /// Schedule the provided event at the absolute time `when`.
    pub fn schedule_event(&mut self, tag: EventTag, when: DriverTime) {
        self.event_queue.push(Event { tag, timestamp: when });
    }

    /// Schedule the provided event at `current_time + when`.
    pub fn schedule_relative(&mut self, tag: EventTag, when: DriverTime) {
        self.event_queue.push(Event {
            tag,
            timestamp: self.current_time + when,
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub enum EventTag {
    /// Poll a queued transmission's flag word until the engine reaches it.
    TransmissionCheck(u64),
    /// Poll the flag word for the end-of-stream write after at least one full
    /// playback.
    RepetitionCheck(u64),
    /// Scan for and clear hardware error conditions.
    Watchdog,
}

#[derive(Debug, Copy, Clone, Eq)]
pub struct Event {
    pub tag: EventTag,
    pub timestamp: DriverTime,
}

impl core::cmp::PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl core::cmp::PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.timestamp.partial_cmp(&other.timestamp)
    }
}

impl core::cmp::Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

/// A point in driver time, expressed in microseconds since startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct DriverTime(pub u64);

impl From<u64> for DriverTime {
    fn from(time: u64) -> Self {
        DriverTime(time)
    }
}

impl From<u32> for DriverTime {
    fn from(time: u32) -> Self {
        DriverTime(time as u64)
    }
}

impl Add<DriverTime> for DriverTime {
    type Output = DriverTime;

    fn add(self, rhs: DriverTime) -> Self::Output {
        DriverTime(self.0 + rhs.0)
    }
}

impl AddAssign<DriverTime> for DriverTime {
    fn add_assign(&mut self, rhs: DriverTime) {
        self.0 += rhs.0;
    }
}

impl Sub<DriverTime> for DriverTime {
    type Output = DriverTime;

    fn sub(self, rhs: DriverTime) -> Self::Output {
        DriverTime(self.0 - rhs.0)
    }
}
