// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Cross-core doorbell.
//!
//! Each core owns the receiving end of one doorbell channel; its
//! [`LinkRuntime`](crate::runtime::LinkRuntime) turns every event into a
//! `NOTIFY` command for the addressed link. A ring producer rings the
//! peer's doorbell after publishing so the peer never has to poll.

use crate::status::Status;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyEvent {
    pub src_core: u16,
    pub link_id: u32,
}

/// Sending end of a core's doorbell.
#[derive(Clone)]
pub struct Doorbell {
    core_id: u16,
    tx: kanal::Sender<NotifyEvent>,
}

/// Creates the doorbell of `core_id`, buffering up to `capacity` events.
pub fn doorbell(core_id: u16, capacity: usize) -> (Doorbell, kanal::Receiver<NotifyEvent>) {
    let (tx, rx) = kanal::bounded(capacity);
    (Doorbell { core_id, tx }, rx)
}

impl Doorbell {
    /// Core this doorbell wakes.
    pub fn core_id(&self) -> u16 {
        self.core_id
    }

    /// Wakes `link_id` on the doorbell's core. Blocks only while the
    /// peer's event buffer is full.
    pub fn ring(&self, src_core: u16, link_id: u32) -> Result<(), Status> {
        let ev = NotifyEvent { src_core, link_id };
        match self.tx.try_send(ev) {
            Ok(true) => Ok(()),
            Ok(false) => {
                trace!("doorbell of core {} full, waiting", self.core_id);
                self.tx.send(ev).map_err(|_| self.closed())
            }
            Err(_) => Err(self.closed()),
        }
    }

    fn closed(&self) -> Status {
        warn!("doorbell of core {} is closed", self.core_id);
        Status::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let (bell, rx) = doorbell(1, 2);
        bell.ring(0, 10).unwrap();
        bell.ring(0, 11).unwrap();
        assert_eq!(rx.recv().unwrap().link_id, 10);
        assert_eq!(
            rx.recv().unwrap(),
            NotifyEvent {
                src_core: 0,
                link_id: 11
            }
        );
    }

    #[test]
    fn closed_doorbell_fails() {
        let (bell, rx) = doorbell(1, 1);
        drop(rx);
        assert_eq!(bell.ring(0, 1).unwrap_err(), Status::Fail);
    }
}
