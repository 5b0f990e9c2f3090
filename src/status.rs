// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Status values returned by every runtime operation.
//!
//! The set is closed: capacity conditions (queue full, pool
//! exhausted, ring empty) are ordinary return values that the caller decides
//! how to handle, while contract violations abort through `panic!`.

use std::time::Duration;
use thiserror::Error;

/// Non-OK outcome of a runtime operation. `Ok(())` stands for OK.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Generic failure.
    #[error("operation failed")]
    Fail,
    /// A blocking wait expired or was force-unblocked.
    #[error("timed out")]
    Timeout,
    /// The queue has no free slot and the caller may not wait.
    #[error("queue full")]
    QueueFull,
    /// The queue holds no element and the caller may not wait.
    #[error("queue empty")]
    QueueEmpty,
    /// The fixed-size message pool is exhausted.
    #[error("no messages available")]
    NoMessages,
    /// Bad argument, or a blocking wait on a queue not configured to block.
    #[error("invalid argument")]
    InvalidArgument,
    /// Cross-core ring has `max_elements` unread elements.
    #[error("ring full")]
    RingFull,
    /// Cross-core ring has no unread element.
    #[error("ring empty")]
    RingEmpty,
}

impl Status {
    /// Stable wire code, used where a status has to cross a core boundary.
    pub const fn code(self) -> i32 {
        match self {
            Status::Fail => -1,
            Status::InvalidArgument => -2,
            Status::Timeout => -3,
            Status::QueueFull => -4,
            Status::QueueEmpty => -5,
            Status::NoMessages => -6,
            Status::RingFull => -7,
            Status::RingEmpty => -8,
        }
    }

    /// Inverse of [`Status::code`]. Unknown negative codes map to `Fail`.
    pub fn from_code(code: i32) -> Result<(), Status> {
        match code {
            c if c >= 0 => Ok(()),
            -2 => Err(Status::InvalidArgument),
            -3 => Err(Status::Timeout),
            -4 => Err(Status::QueueFull),
            -5 => Err(Status::QueueEmpty),
            -6 => Err(Status::NoMessages),
            -7 => Err(Status::RingFull),
            -8 => Err(Status::RingEmpty),
            _ => Err(Status::Fail),
        }
    }
}

/// Packs a result into its wire code.
pub fn result_code(res: Result<(), Status>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// How long a queue operation may suspend the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    NoWait,
    Forever,
    After(Duration),
}

impl Timeout {
    pub fn is_no_wait(&self) -> bool {
        matches!(self, Timeout::NoWait)
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::NoWait
        } else {
            Timeout::After(d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for s in [
            Status::Fail,
            Status::InvalidArgument,
            Status::Timeout,
            Status::QueueFull,
            Status::QueueEmpty,
            Status::NoMessages,
            Status::RingFull,
            Status::RingEmpty,
        ] {
            assert_eq!(Status::from_code(s.code()), Err(s));
        }
        assert_eq!(Status::from_code(0), Ok(()));
        assert_eq!(Status::from_code(-99), Err(Status::Fail));
    }

    #[test]
    fn zero_duration_is_no_wait() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::NoWait);
        assert!(Timeout::from(Duration::from_millis(5)) != Timeout::NoWait);
    }
}
