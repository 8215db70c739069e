//! # rfsim-core
//!
//! Core primitives for the RFSIM simulation framework.
//!
//! This crate provides:
//! - Virtual time representation ([`SimTime`])
//! - Node identity and geometry ([`NodeId`], [`Location`])
//! - The event kernel ([`Scheduler`], [`EventId`])
//! - Re-arming timers ([`Timer`])
//! - The deterministic random number generator ([`SimRng`])
//! - Structured simulation records ([`records`])

pub mod records;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use records::{Record, RecordKind, RecordLog};

// ============================================================================
// Time
// ============================================================================

/// Virtual simulation time in seconds since simulation start.
///
/// Time is a non-negative double-precision value. All internal arithmetic is
/// in seconds; the constructors accept the other units a scenario is likely
/// to be written in.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct SimTime(f64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0.0);

    /// Create from seconds.
    pub fn from_secs(s: f64) -> Self {
        SimTime(s)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: f64) -> Self {
        SimTime(ms / 1_000.0)
    }

    /// Create from microseconds.
    pub fn from_micros(us: f64) -> Self {
        SimTime(us / 1_000_000.0)
    }

    /// Create from minutes.
    pub fn from_minutes(m: f64) -> Self {
        SimTime(m * 60.0)
    }

    /// Get as seconds.
    pub fn as_secs(&self) -> f64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> f64 {
        self.0 * 1_000.0
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> f64 {
        self.0 * 1_000_000.0
    }

    /// Get as minutes.
    pub fn as_minutes(&self) -> f64 {
        self.0 / 60.0
    }

    /// A time is valid when it is non-negative and finite.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0.0 && self.0.is_finite()
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for SimTime {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0 - rhs.0)
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Identity and geometry
// ============================================================================

/// Node identifier.
///
/// Numeric identity with value semantics; wide enough for RFID tag id
/// spaces. The all-ones value is reserved as the broadcast destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u128);

impl NodeId {
    /// The broadcast destination.
    pub const BROADCAST: NodeId = NodeId(u128::MAX);

    /// Create a node id from a numeric value.
    pub fn new(value: u128) -> Self {
        NodeId(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Whether this is the broadcast destination.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Write the id into a little-endian byte array of `len` bytes.
    ///
    /// The value must fit in `len` bytes.
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        let mut value = self.0;
        let mut i = 0;
        while value > 0 {
            assert!(i < len, "node id does not fit in {} bytes", len);
            bytes[i] = (value & 0xff) as u8;
            value >>= 8;
            i += 1;
        }
        bytes
    }

    /// Reconstruct an id from a little-endian byte array.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut value: u128 = 0;
        for (i, byte) in bytes.iter().enumerate() {
            if i >= 16 {
                assert_eq!(*byte, 0, "node id wider than 128 bits");
                continue;
            }
            value |= (*byte as u128) << (8 * i);
        }
        NodeId(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "BROADCAST")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A 3-D Cartesian point in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
    /// Z coordinate in meters.
    pub z: f64,
}

impl Location {
    /// Create a new location.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Location { x, y, z }
    }

    /// Euclidean distance to another location in meters.
    pub fn distance_to(&self, other: &Location) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// The network-stack layer vocabulary shared across crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Physical layer (radio).
    Physical,
    /// Link layer (MAC).
    Link,
    /// Network layer.
    Network,
    /// Transport layer.
    Transport,
    /// Application layer.
    Application,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LayerKind::Physical => "PHY",
            LayerKind::Link => "LINK",
            LayerKind::Network => "NET",
            LayerKind::Transport => "TRAN",
            LayerKind::Application => "APP",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Event kernel
// ============================================================================

/// Handle to a scheduled event.
///
/// A handle identifies exactly one queue entry; once the entry has been
/// dispatched or cancelled, the handle is stale and all queries on it report
/// "not queued".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventId {
    fire_time: SimTime,
    seq: u64,
}

impl EventId {
    /// The time at which the event will fire.
    pub fn fire_time(&self) -> SimTime {
        self.fire_time
    }
}

/// Queue key: fire time first, then scheduling order.
///
/// Fire times are non-negative finite doubles, so `total_cmp` agrees with
/// the numeric ordering. Ties break in insertion order (FIFO).
#[derive(Debug, Clone, Copy)]
struct QueueKey {
    time: SimTime,
    seq: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.time == other.time
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .as_secs()
            .total_cmp(&other.time.as_secs())
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// The virtual-time event kernel: a clock plus a time-ordered queue.
///
/// Events are owned by the queue while queued. The clock only moves forward:
/// [`Scheduler::pop_next`] advances it to each event's fire time in turn and
/// [`Scheduler::finish`] advances it to the stop time at the end of a run.
pub struct Scheduler<E> {
    clock: SimTime,
    queue: BTreeMap<QueueKey, E>,
    next_seq: u64,
}

impl<E> Scheduler<E> {
    /// Create an empty scheduler with the clock at zero.
    pub fn new() -> Self {
        Scheduler {
            clock: SimTime::ZERO,
            queue: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// The current virtual time.
    pub fn now(&self) -> SimTime {
        self.clock
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedule an event to fire `delay` in the future.
    ///
    /// A negative delay is a programmer error.
    pub fn schedule(&mut self, delay: SimTime, event: E) -> EventId {
        assert!(delay.is_valid(), "negative or non-finite event delay");
        let fire_time = self.clock + delay;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(
            QueueKey {
                time: fire_time,
                seq,
            },
            event,
        );
        EventId { fire_time, seq }
    }

    /// Cancel a queued event.
    ///
    /// Returns true if the event was found and removed; cancelling an event
    /// that is not queued has no effect and returns false.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.queue
            .remove(&QueueKey {
                time: id.fire_time,
                seq: id.seq,
            })
            .is_some()
    }

    /// Whether the handle still refers to a queued event.
    pub fn is_queued(&self, id: EventId) -> bool {
        self.queue.contains_key(&QueueKey {
            time: id.fire_time,
            seq: id.seq,
        })
    }

    /// Time until the event fires, or zero if it is not queued.
    pub fn time_remaining(&self, id: EventId) -> SimTime {
        if self.is_queued(id) {
            let remaining = id.fire_time - self.clock;
            debug_assert!(remaining.is_valid());
            remaining
        } else {
            SimTime::ZERO
        }
    }

    /// Remove and return the earliest event with fire time at or before
    /// `stop`, advancing the clock to its fire time.
    ///
    /// Events later than `stop` are left queued.
    pub fn pop_next(&mut self, stop: SimTime) -> Option<(EventId, E)> {
        let key = *self.queue.keys().next()?;
        if key.time > stop {
            return None;
        }
        let event = self.queue.remove(&key).expect("peeked key vanished");
        assert!(self.clock <= key.time, "clock would move backwards");
        self.clock = key.time;
        Some((
            EventId {
                fire_time: key.time,
                seq: key.seq,
            },
            event,
        ))
    }

    /// Advance the clock to the stop time at the end of a run.
    pub fn finish(&mut self, stop: SimTime) {
        if self.clock < stop {
            self.clock = stop;
        }
    }

    /// Discard all queued events and reset the clock to zero.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.clock = SimTime::ZERO;
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Timer
// ============================================================================

/// A re-arming wrapper around a single scheduled event.
///
/// The timer owns its event payload; starting the timer schedules a copy of
/// the payload, and the timer is "running" while that instance is queued.
#[derive(Debug, Clone)]
pub struct Timer<E: Clone> {
    event: Option<E>,
    pending: Option<EventId>,
}

impl<E: Clone> Timer<E> {
    /// Create a timer with no event installed.
    pub fn new() -> Self {
        Timer {
            event: None,
            pending: None,
        }
    }

    /// Create a timer that fires the given event.
    pub fn with_event(event: E) -> Self {
        Timer {
            event: Some(event),
            pending: None,
        }
    }

    /// Install a new event. If the timer is running it is stopped first;
    /// the new event is not scheduled until [`Timer::start`] is called.
    pub fn set_event(&mut self, scheduler: &mut Scheduler<E>, event: E) {
        if self.is_running(scheduler) {
            self.stop(scheduler);
        }
        self.event = Some(event);
    }

    /// Start the timer. Does nothing and returns false if it is already
    /// running.
    pub fn start(&mut self, scheduler: &mut Scheduler<E>, delay: SimTime) -> bool {
        let event = self.event.as_ref().expect("timer started with no event");
        if self.is_running(scheduler) {
            return false;
        }
        self.pending = Some(scheduler.schedule(delay, event.clone()));
        true
    }

    /// Stop the timer. Returns true if a queued event was cancelled.
    pub fn stop(&mut self, scheduler: &mut Scheduler<E>) -> bool {
        let cancelled = match self.pending.take() {
            Some(id) => scheduler.cancel(id),
            None => false,
        };
        cancelled
    }

    /// Stop the timer if running, then start it with the new delay.
    pub fn reschedule(&mut self, scheduler: &mut Scheduler<E>, delay: SimTime) -> bool {
        if self.is_running(scheduler) {
            self.stop(scheduler);
        }
        self.start(scheduler, delay)
    }

    /// Whether the timer's event is currently queued.
    pub fn is_running(&self, scheduler: &Scheduler<E>) -> bool {
        self.pending
            .map(|id| scheduler.is_queued(id))
            .unwrap_or(false)
    }

    /// Time left until the event fires, or zero if the timer is not running.
    pub fn time_remaining(&self, scheduler: &Scheduler<E>) -> SimTime {
        self.pending
            .map(|id| scheduler.time_remaining(id))
            .unwrap_or(SimTime::ZERO)
    }
}

impl<E: Clone> Default for Timer<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Random number generation
// ============================================================================

/// The simulation random number generator.
///
/// A seeded ChaCha8 stream; every draw in a simulation comes from this one
/// generator so a run is fully reproducible from its seed.
pub struct SimRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl SimRng {
    /// Default seed used when a scenario does not specify one.
    pub const DEFAULT_SEED: u64 = 1;

    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        SimRng {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// The seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Re-seed the generator.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.seed = seed;
    }

    /// Integer uniform in `[min, max]` (both inclusive).
    pub fn uniform_int(&mut self, min: u32, max: u32) -> u32 {
        assert!(min <= max);
        self.rng.gen_range(min..=max)
    }

    /// Real uniform in `[0, 1)`.
    pub fn uniform_zero_one(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Real uniform in `[min, max)`.
    pub fn uniform_real(&mut self, min: f64, max: f64) -> f64 {
        assert!(min < max);
        self.rng.gen_range(min..max)
    }

    /// Draw from an exponential distribution with rate `lambda`.
    pub fn exponential(&mut self, lambda: f64) -> f64 {
        let dist = Exp::new(lambda).expect("non-positive exponential rate");
        dist.sample(&mut self.rng)
    }

    /// Draw from a normal distribution.
    pub fn normal(&mut self, mean: f64, sigma: f64) -> f64 {
        let dist = Normal::new(mean, sigma).expect("invalid normal parameters");
        dist.sample(&mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500.0);
        assert_eq!(time.as_micros(), 1_500_000.0);
        assert!((SimTime::from_minutes(2.0).as_secs() - 120.0).abs() < 1e-12);
        assert!((SimTime::from_micros(250.0).as_secs() - 250e-6).abs() < 1e-15);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100.0);
        let t2 = SimTime::from_millis(50.0);
        assert!((t1 + t2).as_millis() - 150.0 < 1e-9);
        assert!((t1 - t2).as_millis() - 50.0 < 1e-9);
        assert!(t2 < t1);
        assert!(!(t1 - t1 - t2).is_valid());
    }

    #[test]
    fn test_node_id_byte_round_trip() {
        for &(value, len) in &[(0u128, 4), (1, 4), (0xdead_beef, 12), (1460502, 12)] {
            let id = NodeId::new(value);
            assert_eq!(NodeId::from_bytes(&id.to_bytes(len)), id);
        }
    }

    #[test]
    fn test_node_id_broadcast_display() {
        assert_eq!(format!("{}", NodeId::BROADCAST), "BROADCAST");
        assert_eq!(format!("{}", NodeId::new(7)), "7");
    }

    #[test]
    fn test_location_distance() {
        let a = Location::new(0.0, 0.0, 0.0);
        let b = Location::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_scheduler_orders_by_time() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(SimTime::from_secs(2.0), 2);
        sched.schedule(SimTime::from_secs(0.5), 1);
        sched.schedule(SimTime::from_secs(5.0), 3);

        let mut order = Vec::new();
        let mut last = SimTime::ZERO;
        while let Some((id, ev)) = sched.pop_next(SimTime::from_secs(10.0)) {
            assert!(last <= id.fire_time());
            last = id.fire_time();
            order.push(ev);
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_scheduler_fifo_tie_break() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        for i in 0..5 {
            sched.schedule(SimTime::from_secs(1.5), i);
        }
        let mut order = Vec::new();
        while let Some((_, ev)) = sched.pop_next(SimTime::from_secs(2.0)) {
            order.push(ev);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_scheduler_cancel() {
        let mut sched: Scheduler<&'static str> = Scheduler::new();
        let keep = sched.schedule(SimTime::from_secs(1.0), "keep");
        let drop = sched.schedule(SimTime::from_secs(1.0), "drop");

        assert!(sched.is_queued(drop));
        assert!(sched.cancel(drop));
        assert!(!sched.is_queued(drop));
        // A second cancel has no effect.
        assert!(!sched.cancel(drop));
        assert!(sched.is_queued(keep));

        let (_, ev) = sched.pop_next(SimTime::from_secs(2.0)).unwrap();
        assert_eq!(ev, "keep");
        assert!(sched.pop_next(SimTime::from_secs(2.0)).is_none());
    }

    #[test]
    fn test_scheduler_stops_at_stop_time() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(SimTime::from_secs(1.0), 1);
        sched.schedule(SimTime::from_secs(3.0), 2);

        assert!(sched.pop_next(SimTime::from_secs(2.0)).is_some());
        assert!(sched.pop_next(SimTime::from_secs(2.0)).is_none());
        // The late event is still queued.
        assert_eq!(sched.len(), 1);
        sched.finish(SimTime::from_secs(2.0));
        assert_eq!(sched.now(), SimTime::from_secs(2.0));
    }

    #[test]
    fn test_scheduler_reset() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(SimTime::from_secs(1.0), 1);
        sched.pop_next(SimTime::from_secs(2.0));
        sched.schedule(SimTime::from_secs(1.0), 2);
        sched.reset();
        assert!(sched.is_empty());
        assert_eq!(sched.now(), SimTime::ZERO);
    }

    #[test]
    fn test_timer_lifecycle() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let mut timer = Timer::with_event(9);

        assert!(!timer.is_running(&sched));
        assert_eq!(timer.time_remaining(&sched), SimTime::ZERO);

        assert!(timer.start(&mut sched, SimTime::from_secs(2.0)));
        assert!(timer.is_running(&sched));
        // Starting a running timer is a no-op.
        assert!(!timer.start(&mut sched, SimTime::from_secs(1.0)));
        assert!((timer.time_remaining(&sched).as_secs() - 2.0).abs() < 1e-12);

        assert!(timer.stop(&mut sched));
        assert!(!timer.is_running(&sched));
        assert!(!timer.stop(&mut sched));

        assert!(timer.reschedule(&mut sched, SimTime::from_secs(0.5)));
        let (_, ev) = sched.pop_next(SimTime::from_secs(1.0)).unwrap();
        assert_eq!(ev, 9);
        // The event fired; the timer no longer reports running.
        assert!(!timer.is_running(&sched));
        assert!(!timer.stop(&mut sched));
    }

    #[test]
    fn test_timer_set_event_stops_running_timer() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let mut timer = Timer::with_event(1);
        timer.start(&mut sched, SimTime::from_secs(1.0));
        timer.set_event(&mut sched, 2);
        assert!(!timer.is_running(&sched));
        assert!(timer.start(&mut sched, SimTime::from_secs(1.0)));
        let (_, ev) = sched.pop_next(SimTime::from_secs(2.0)).unwrap();
        assert_eq!(ev, 2);
    }

    #[test]
    fn test_rng_determinism() {
        let mut a = SimRng::new(42);
        let mut b = SimRng::new(42);
        for _ in 0..10 {
            assert_eq!(a.uniform_int(0, 100), b.uniform_int(0, 100));
        }
        let x = a.uniform_real(1.0, 2.0);
        assert!((1.0..2.0).contains(&x));
        assert!(a.exponential(2.0) >= 0.0);
    }

    #[test]
    fn test_rng_uniform_int_degenerate_range() {
        let mut rng = SimRng::new(7);
        for _ in 0..20 {
            assert_eq!(rng.uniform_int(0, 0), 0);
        }
    }
}
