use std::time::Duration;

use rand::Rng;

use crate::config::CoapParams;

/// Confirmable-message retransmission schedule (RFC 7252 §4.2).
///
/// The first timeout is drawn from `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`
/// and doubles on every retransmission.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    timeout: Duration,
    left: u32,
}

impl RetransmitTimer {
    pub fn new(params: &CoapParams, rng: &mut impl Rng) -> Self {
        let factor = rng.gen_range(1.0..=params.ack_random_factor.max(1.0));
        Self {
            timeout: params.ack_timeout.mul_f64(factor),
            left: params.max_retransmit,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }

    pub fn attempt(&mut self) {
        let Some(left) = self.left.checked_sub(1) else {
            return;
        };

        self.left = left;
        self.timeout = self.timeout.saturating_mul(2);
    }
}
