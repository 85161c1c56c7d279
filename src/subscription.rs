//! The handle returned by [`crate::Client::subscribe`]: a receiver for
//! matching messages plus the filters it was granted.
use crate::{
	client,
	command::{CommandTx, Message, PublishRx},
	FilterBuf, QoS, Result,
};
use std::time::Duration;

/// A live subscription to one or more filters.
///
/// Dropping a `Subscription` without calling [`Subscription::unsubscribe`]
/// sends a best-effort UNSUBSCRIBE for its filters in the background; use
/// `unsubscribe` directly if the caller needs to know it completed.
#[derive(Debug)]
pub struct Subscription {
	tx: CommandTx,
	rx: PublishRx,
	filters: Vec<(FilterBuf, QoS)>,
	response_wait: Duration,
}

impl Subscription {
	pub(crate) fn new(
		filters: Vec<(FilterBuf, QoS)>,
		rx: PublishRx,
		tx: CommandTx,
		response_wait: Duration,
	) -> Self {
		Self {
			tx,
			rx,
			filters,
			response_wait,
		}
	}

	/// Receives the next message matching this subscription's filters.
	///
	/// Returns `None` once the actor task has shut down and no further
	/// messages will ever arrive.
	pub async fn recv(&mut self) -> Option<Message> {
		let message = self.rx.recv().await;
		if message.is_none() {
			// The actor is gone; there is nothing left to unsubscribe from.
			self.filters.clear();
		}
		message
	}

	/// Sends an UNSUBSCRIBE for every filter in this subscription and waits
	/// for the matching UNSUBACK.
	pub async fn unsubscribe(mut self) -> Result<()> {
		let filters = std::mem::take(&mut self.filters)
			.into_iter()
			.map(|(filter, _)| filter)
			.collect();
		client::unsubscribe(&self.tx, self.response_wait, filters).await
	}

	/// The filters this subscription was granted, and the QoS the Server
	/// assigned each one.
	pub fn filters(&self) -> &[(FilterBuf, QoS)] {
		&self.filters
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if self.filters.is_empty() {
			return;
		}

		let (response, _) = tokio::sync::oneshot::channel();
		let filters = std::mem::take(&mut self.filters)
			.into_iter()
			.map(|(filter, _)| filter)
			.collect();

		let _ = self.tx.send(crate::command::Command::Unsubscribe(
			crate::command::UnsubscribeCommand {
				filters,
				response,
				cancel: crate::command::CancelToken::new(),
			},
		));
	}
}
