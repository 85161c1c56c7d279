//! The active subscription table: which filters currently have a live
//! dispatch channel, and which filter best matches an inbound PUBLISH.
use crate::{FilterBuf, QoS, Topic};
use std::time::Instant;

/// One active subscription: the filter the Server accepted, the QoS it
/// granted, and the channel inbound messages matching it are dispatched to.
#[derive(Debug)]
struct Entry<T> {
	filter: FilterBuf,
	qos: QoS,
	channel: T,
	/// Set while an UNSUBSCRIBE for this filter is in flight but not yet
	/// acknowledged. Dispatch is skipped for tombstoned entries so a message
	/// arriving between the UNSUBSCRIBE and its UNSUBACK is not delivered to
	/// a handle the caller already considers gone; the entry is only dropped
	/// once the UNSUBACK is processed.
	tombstoned: bool,
}

/// The table of filters a connection is currently subscribed to.
#[derive(Debug)]
pub struct Subscriptions<T> {
	entries: Vec<Entry<T>>,
}

impl<T> Default for Subscriptions<T> {
	fn default() -> Self {
		Self {
			entries: Vec::new(),
		}
	}
}

impl<T> Subscriptions<T> {
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl<T: Clone> Subscriptions<T> {
	/// All currently active (non-tombstoned) filters and their granted QoS,
	/// for resubscribing a fresh session.
	pub fn active_filters(&self) -> Vec<(FilterBuf, QoS)> {
		self.entries
			.iter()
			.filter(|entry| !entry.tombstoned)
			.map(|entry| (entry.filter.clone(), entry.qos))
			.collect()
	}

	/// Drains all entries, for re-sending as a single resubscribe.
	pub fn drain(&mut self) -> Vec<(FilterBuf, QoS, T)> {
		self.entries
			.drain(..)
			.map(|entry| (entry.filter, entry.qos, entry.channel))
			.collect()
	}

	/// Adds or replaces the entry for `filter`.
	pub fn insert(&mut self, filter: FilterBuf, qos: QoS, channel: T) {
		for entry in self.entries.iter_mut() {
			if entry.filter == filter {
				entry.qos = qos;
				entry.channel = channel;
				entry.tombstoned = false;
				return;
			}
		}

		self.entries.push(Entry {
			filter,
			qos,
			channel,
			tombstoned: false,
		});
	}

	/// Marks `filters` as no longer deliverable. The entries are not removed
	/// until `remove_tombstoned` is called, so a PUBLISH racing the in-flight
	/// UNSUBSCRIBE is silently dropped rather than delivered.
	pub fn tombstone(&mut self, filters: &[FilterBuf]) {
		for entry in self.entries.iter_mut() {
			if filters.contains(&entry.filter) {
				entry.tombstoned = true;
			}
		}
	}

	/// Removes tombstoned entries matching `filters`, called once the
	/// corresponding UNSUBACK has been processed.
	pub fn remove_tombstoned(&mut self, filters: &[FilterBuf]) {
		self.entries
			.retain(|entry| !(entry.tombstoned && filters.contains(&entry.filter)));
	}

	/// Finds the best-matching (highest-scoring) active, non-tombstoned
	/// subscription for `topic`.
	pub fn match_topic(&self, topic: &Topic) -> Option<&T> {
		let start = Instant::now();

		let found = self
			.entries
			.iter()
			.filter(|entry| !entry.tombstoned)
			.filter_map(|entry| {
				entry
					.filter
					.matches_topic(topic)
					.map(|score| (score.score(), entry))
			})
			.max_by_key(|(score, _)| *score);

		match found {
			Some((score, entry)) => {
				tracing::trace!(
					topic = %topic,
					filter = %entry.filter,
					score,
					elapsed = ?start.elapsed(),
					"matched inbound publish to subscription"
				);
				Some(&entry.channel)
			}
			None => {
				tracing::warn!(topic = %topic, "no subscription matches inbound publish");
				None
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn matches_best_scoring_filter() {
		let mut table = Subscriptions::default();
		table.insert(FilterBuf::new("a/+".to_string()).unwrap(), QoS::AtMostOnce, 1);
		table.insert(
			FilterBuf::new("a/b".to_string()).unwrap(),
			QoS::AtMostOnce,
			2,
		);

		let topic = Topic::new("a/b").unwrap();
		assert_eq!(table.match_topic(topic), Some(&2));
	}

	#[test]
	fn tombstoned_entries_are_skipped() {
		let mut table = Subscriptions::default();
		let filter = FilterBuf::new("a/b".to_string()).unwrap();
		table.insert(filter.clone(), QoS::AtMostOnce, 1);
		table.tombstone(&[filter]);

		let topic = Topic::new("a/b").unwrap();
		assert_eq!(table.match_topic(topic), None);
	}
}
