//! Commands sent from a [`crate::client::Client`] handle to its actor task.
use crate::{config::PublishRetry, FilterBuf, QoS, TopicBuf};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

pub type CommandTx = mpsc::UnboundedSender<Command>;
pub type CommandRx = mpsc::UnboundedReceiver<Command>;

/// Identifies a pending SUBSCRIBE/UNSUBSCRIBE for [`Command::CancelWait`],
/// independent of the packet id the actor assigns it (the caller doesn't
/// know that id until after the actor has already queued the packet).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CancelToken(u64);

impl CancelToken {
	pub fn new() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

/// An inbound PUBLISH, stripped of everything a subscriber doesn't need.
#[derive(Clone, Debug)]
pub struct Message {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub retain: bool,
}

pub type PublishTx = mpsc::Sender<Message>;
pub type PublishRx = mpsc::Receiver<Message>;

#[derive(Debug)]
pub struct PublishCommand {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
	pub retry: PublishRetry,
	pub response: oneshot::Sender<crate::Result<()>>,
}

#[derive(Debug)]
pub struct SubscribeCommand {
	pub filters: Vec<(FilterBuf, QoS)>,
	pub channel: PublishTx,
	pub response: oneshot::Sender<Vec<(FilterBuf, QoS)>>,
	pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct UnsubscribeCommand {
	pub filters: Vec<FilterBuf>,
	pub response: oneshot::Sender<()>,
	pub cancel: CancelToken,
}

#[derive(Debug)]
pub enum Command {
	Publish(PublishCommand),
	Subscribe(SubscribeCommand),
	Unsubscribe(UnsubscribeCommand),
	/// Sent when a caller's [`tokio::time::timeout`] around a `Wait` elapses
	/// before the matching ack arrived, so the actor can drop the
	/// now-unobserved pending-operation entry instead of leaving it to trip
	/// [`crate::state::ClientState::expired`] forever.
	CancelWait(CancelToken),
	Shutdown,
}
