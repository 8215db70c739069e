//! The slotted-MAC base.
//!
//! Both RFID MACs divide time into fixed slots driven by a self-rescheduling
//! slot timer and keep at most one packet armed for transmission in a chosen
//! slot. A node is in a contention cycle exactly while its current slot
//! number is below the cycle's slot count.

use crate::layer::Direction;
use crate::world::Ev;
use crate::LayerId;
use rfsim_core::{Scheduler, SimTime, Timer};
use rfsim_packet::Packet;

/// Shared slotted-MAC state.
#[derive(Debug)]
pub struct SlottedMac {
    /// Length of one slot.
    pub slot_duration: SimTime,
    /// Fires at every slot boundary.
    pub slot_timer: Timer<Ev>,
    /// One-shot timer that hands the armed packet to the link layer after
    /// the interframe spacing.
    pub send_timer: Timer<Ev>,
    /// The current slot number in the cycle.
    pub current_slot: u32,
    /// The chosen transmission slot.
    pub tx_slot: u32,
    /// Number of slots in the current contention cycle.
    pub number_of_slots: u32,
    /// The packet armed for transmission, if any.
    pub packet_to_transmit: Option<Packet>,
}

impl SlottedMac {
    /// Default slot duration: 2 ms.
    pub const DEFAULT_SLOT_DURATION: f64 = 2.0e-3;

    /// Fresh slotted-MAC state with the default slot duration.
    pub fn new() -> Self {
        SlottedMac {
            slot_duration: SimTime::from_secs(Self::DEFAULT_SLOT_DURATION),
            slot_timer: Timer::new(),
            send_timer: Timer::new(),
            current_slot: 0,
            tx_slot: 0,
            number_of_slots: 0,
            packet_to_transmit: None,
        }
    }

    /// Whether the node is currently engaged in a contention cycle.
    pub fn in_contention_cycle(&self) -> bool {
        self.current_slot < self.number_of_slots
    }

    /// Leave the contention cycle by zeroing the slot state.
    pub fn stop_contention_cycle(&mut self) {
        self.current_slot = 0;
        self.number_of_slots = 0;
    }

    /// Arm the send timer: after `ifs`, hand `packet` to the link layer in
    /// the given direction.
    pub fn start_send_timer(
        &mut self,
        scheduler: &mut Scheduler<Ev>,
        link: LayerId,
        direction: Direction,
        packet: Packet,
        ifs: SimTime,
    ) -> bool {
        debug_assert!(!self.send_timer.is_running(scheduler));
        self.send_timer.set_event(
            scheduler,
            Ev::SendToLink {
                link,
                direction,
                packet,
            },
        );
        self.send_timer.start(scheduler, ifs)
    }
}

impl Default for SlottedMac {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_cycle_predicate() {
        let mut mac = SlottedMac::new();
        assert!(!mac.in_contention_cycle());

        mac.current_slot = 0;
        mac.number_of_slots = 10;
        assert!(mac.in_contention_cycle());

        mac.current_slot = 10;
        assert!(!mac.in_contention_cycle());

        mac.stop_contention_cycle();
        assert_eq!(mac.current_slot, 0);
        assert_eq!(mac.number_of_slots, 0);
        assert!(!mac.in_contention_cycle());
    }

    #[test]
    fn test_send_timer_fires_send_event() {
        let mut sched: Scheduler<Ev> = Scheduler::new();
        let mut mac = SlottedMac::new();
        let armed = mac.start_send_timer(
            &mut sched,
            LayerId(2),
            Direction::Lower,
            Packet::new(),
            SimTime::from_micros(10.0),
        );
        assert!(armed);
        assert!(mac.send_timer.is_running(&sched));

        let (id, ev) = sched.pop_next(SimTime::from_secs(1.0)).unwrap();
        assert!((id.fire_time().as_micros() - 10.0).abs() < 1e-9);
        match ev {
            Ev::SendToLink {
                link, direction, ..
            } => {
                assert_eq!(link, LayerId(2));
                assert_eq!(direction, Direction::Lower);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
