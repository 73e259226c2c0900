// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

use crate::hal::Hal;

const POLL_SPIN_COUNT: u32 = 10;
const POLL_MAX_DELAY: Duration = Duration::from_micros(1024);

/// The deadline has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PollTimeout;

/// A bounded wait: a few busy spins, then delays that double up to a cap.
pub(crate) struct QueuePoll<'a> {
    hal: &'a dyn Hal,
    deadline: Duration,
    spin_cnt: u32,
    delay: Duration,
}

impl<'a> QueuePoll<'a> {
    pub(crate) fn new(hal: &'a dyn Hal, timeout: Duration) -> Self {
        Self {
            hal,
            deadline: hal.now().saturating_add(timeout),
            spin_cnt: 0,
            delay: Duration::from_micros(1),
        }
    }

    /// Waits a little, or fails if the deadline has passed.
    pub(crate) fn poll(&mut self) -> Result<(), PollTimeout> {
        if self.hal.now() >= self.deadline {
            return Err(PollTimeout);
        }

        if self.spin_cnt < POLL_SPIN_COUNT {
            self.spin_cnt += 1;
            core::hint::spin_loop();
            return Ok(());
        }

        self.hal.delay(self.delay);
        self.delay = (self.delay * 2).min(POLL_MAX_DELAY);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimHal;

    #[test]
    fn expires_after_deadline() {
        let hal = SimHal::new();
        let mut poll = QueuePoll::new(&*hal, Duration::from_millis(5));
        let start = hal.now();
        while poll.poll().is_ok() {}
        assert!(hal.now() - start >= Duration::from_millis(5));
    }

    #[test]
    fn zero_timeout_fails_immediately() {
        let hal = SimHal::new();
        let mut poll = QueuePoll::new(&*hal, Duration::ZERO);
        assert_eq!(poll.poll(), Err(PollTimeout));
    }
}
