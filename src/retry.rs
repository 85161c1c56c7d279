//! Exponential backoff shared by the reconnection loop and QoS >= 1 PUBLISH
//! retransmission.
use std::{cmp, ops::Range, time::Duration};

/// A hold-off period that doubles on each increase, clamped to a maximum.
#[derive(Debug)]
pub struct HoldOff {
	min: Duration,
	max: Duration,
	cur: Option<Duration>,
}

impl HoldOff {
	pub fn new(r: Range<Duration>) -> Self {
		Self {
			min: r.start,
			max: r.end,
			cur: None,
		}
	}

	/// Reset the hold-off period to `min`.
	pub fn reset(&mut self) {
		self.cur = None;
	}

	/// Doubles the hold-off period, clamped at `max`.
	pub fn increase(&mut self) {
		self.cur = Some(match self.cur {
			None => self.min,
			Some(cur) => cmp::min(cur.saturating_mul(2), self.max),
		});
	}

	/// The current hold-off period, or `None` if it has never been
	/// increased (or was just reset).
	pub fn current(&self) -> Option<Duration> {
		self.cur
	}

	/// Sleeps for the current hold-off period, a no-op if never increased.
	pub async fn wait(&self) {
		if let Some(duration) = self.cur {
			tokio::time::sleep(duration).await;
		}
	}

	/// Sleeps for the current period, then doubles it.
	pub async fn wait_and_increase(&mut self) {
		self.wait().await;
		self.increase();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn doubles_up_to_ceiling() {
		let mut backoff = HoldOff::new(Duration::from_millis(100)..Duration::from_secs(1));
		assert_eq!(backoff.current(), None);

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_millis(100)));

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_millis(200)));

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_millis(400)));

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_millis(800)));

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_secs(1)));

		backoff.increase();
		assert_eq!(backoff.current(), Some(Duration::from_secs(1)));
	}

	#[test]
	fn reset_returns_to_unset() {
		let mut backoff = HoldOff::new(Duration::from_millis(50)..Duration::from_secs(5));
		backoff.increase();
		backoff.increase();
		backoff.reset();
		assert_eq!(backoff.current(), None);
	}
}
