//! Adaptive queue depth for non-master channels
//!
//! Starvation stalls the whole composed output, so the safe length grows as
//! soon as a channel starves after having reached it, and only shrinks after a
//! long run of ticks with frames to spare.

use tracing::info;

/// Upper bound for the safe queue length.
pub const MAX_SAFE_QUEUE_LENGTH: u32 = 5;

/// Consecutive non-starved ticks before one frame of latency is reclaimed.
pub const SPARE_FRAMES_BEFORE_SHRINK: u32 = 1000;

/// What the synchronizer saw on a channel during one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueObservation {
    /// A frame was needed and the queue was empty.
    Starved,
    /// A frame was popped; `depth` frames remain queued.
    Available { depth: usize },
    /// No frame was asked for this tick.
    Idle,
}

#[derive(Debug, Clone)]
pub struct QueueLengthPolicy {
    channel: usize,
    safe_queue_length: u32,
    frames_with_spare: u32,
    been_at_safe_point_since_last_starvation: bool,
}

impl QueueLengthPolicy {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            safe_queue_length: 0,
            frames_with_spare: 0,
            been_at_safe_point_since_last_starvation: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.channel);
    }

    pub fn safe_queue_length(&self) -> u32 {
        self.safe_queue_length
    }

    pub fn update(&mut self, observation: QueueObservation) {
        let depth = match observation {
            QueueObservation::Idle => return,
            QueueObservation::Starved => {
                if self.been_at_safe_point_since_last_starvation
                    && self.safe_queue_length < MAX_SAFE_QUEUE_LENGTH
                {
                    self.safe_queue_length += 1;
                    info!(
                        card = self.channel,
                        safe_length = self.safe_queue_length,
                        "Starvation, increasing safe queue length"
                    );
                }
                self.frames_with_spare = 0;
                self.been_at_safe_point_since_last_starvation = false;
                return;
            }
            QueueObservation::Available { depth } => depth,
        };

        if depth >= self.safe_queue_length as usize {
            self.been_at_safe_point_since_last_starvation = true;
        }
        self.frames_with_spare += 1;
        if self.frames_with_spare > SPARE_FRAMES_BEFORE_SHRINK {
            if self.safe_queue_length > 0 {
                self.safe_queue_length -= 1;
                info!(
                    card = self.channel,
                    safe_length = self.safe_queue_length,
                    "Spare frames for a long time, reducing safe queue length"
                );
            }
            self.frames_with_spare = 0;
        }
    }

    /// How many frames to drop from the head of a queue of `depth` frames.
    pub fn excess(&self, depth: usize) -> usize {
        depth.saturating_sub(self.safe_queue_length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starvation_before_reaching_safe_point_does_not_grow() {
        let mut policy = QueueLengthPolicy::new(1);
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.safe_queue_length(), 0);
    }

    #[test]
    fn starvation_after_safe_point_grows_once() {
        let mut policy = QueueLengthPolicy::new(1);
        policy.update(QueueObservation::Available { depth: 0 });
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.safe_queue_length(), 1);

        // Flag was cleared by the starvation.
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.safe_queue_length(), 1);
    }

    #[test]
    fn never_exceeds_cap() {
        let mut policy = QueueLengthPolicy::new(0);
        for _ in 0..50 {
            policy.update(QueueObservation::Available { depth: 10 });
            policy.update(QueueObservation::Starved);
        }
        assert_eq!(policy.safe_queue_length(), MAX_SAFE_QUEUE_LENGTH);
    }

    #[test]
    fn long_surplus_reclaims_latency() {
        let mut policy = QueueLengthPolicy::new(0);
        for _ in 0..2 {
            policy.update(QueueObservation::Available { depth: 3 });
            policy.update(QueueObservation::Starved);
        }
        assert_eq!(policy.safe_queue_length(), 2);

        for _ in 0..SPARE_FRAMES_BEFORE_SHRINK {
            policy.update(QueueObservation::Available { depth: 2 });
        }
        assert_eq!(policy.safe_queue_length(), 2);
        policy.update(QueueObservation::Available { depth: 2 });
        assert_eq!(policy.safe_queue_length(), 1);
    }

    #[test]
    fn idle_ticks_do_not_count_as_starvation() {
        let mut policy = QueueLengthPolicy::new(2);
        policy.update(QueueObservation::Available { depth: 1 });
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.safe_queue_length(), 1);

        for _ in 0..999 {
            policy.update(QueueObservation::Available { depth: 1 });
        }
        for _ in 0..10 {
            policy.update(QueueObservation::Idle);
        }
        assert_eq!(policy.safe_queue_length(), 1);

        // Only an explicit needed-but-empty tick grows it.
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.safe_queue_length(), 2);
    }

    #[test]
    fn excess_is_what_exceeds_safe_length() {
        let mut policy = QueueLengthPolicy::new(0);
        assert_eq!(policy.excess(3), 3);
        policy.update(QueueObservation::Available { depth: 0 });
        policy.update(QueueObservation::Starved);
        assert_eq!(policy.excess(3), 2);
        assert_eq!(policy.excess(0), 0);
    }

    /// A channel whose producer skips one frame every `period` ticks and
    /// delivers two on the following tick.
    fn simulate(period: u64, ticks: u64) -> (QueueLengthPolicy, Vec<u64>) {
        let mut policy = QueueLengthPolicy::new(0);
        let mut depth = 0usize;
        let mut starved_at = Vec::new();
        for tick in 0..ticks {
            depth += match tick % period {
                0 => 0,
                1 => 2,
                _ => 1,
            };
            if depth == 0 {
                policy.update(QueueObservation::Starved);
                starved_at.push(tick);
            } else {
                depth -= 1;
                policy.update(QueueObservation::Available { depth });
                depth -= policy.excess(depth);
            }
            assert!(policy.safe_queue_length() <= MAX_SAFE_QUEUE_LENGTH);
        }
        (policy, starved_at)
    }

    #[test]
    fn periodic_starvation_converges() {
        let (policy, starved_at) = simulate(50, 900);
        assert_eq!(policy.safe_queue_length(), 1);
        // Startup starvations, then none once the buffer holds one frame.
        assert!(starved_at.iter().all(|&t| t < 120), "{starved_at:?}");
    }

    #[test]
    fn periodic_starvation_stays_bounded_over_long_runs() {
        let ticks = 100_000;
        let (_, starved_at) = simulate(50, ticks);
        // At most one relapse per reclaim window.
        let budget = (ticks / u64::from(SPARE_FRAMES_BEFORE_SHRINK)) as usize + 5;
        assert!(starved_at.len() <= budget, "{} > {budget}", starved_at.len());
    }
}
