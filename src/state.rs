//! Per-connection bookkeeping: outgoing packet queue, pending-operation
//! tables, the shared packet-id generator, and keep-alive/expiry tracking.
//! Exactly one actor task owns a `ClientState`; nothing here needs to be
//! `Sync`, there is never more than one reference to it.
use crate::{
	command::CancelToken,
	operation::IdGenerator,
	retry::HoldOff,
	subscriptions::Subscriptions,
	wire::{
		codec::Encodable,
		packets::{Connect, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe},
		Codec, StandardCodec,
	},
	FilterBuf, PacketId, PacketType, QoS, Topic,
};
use bytes::{Bytes, BytesMut};
use std::{
	collections::HashMap,
	fmt,
	sync::Arc,
	time::{Duration, Instant},
};

/// A packet was received that the current connection state cannot make
/// sense of.
#[derive(Debug)]
pub enum StateError {
	/// An ack arrived for a packet id with no matching pending operation.
	Unsolicited(PacketType),
	/// The Server sent a packet a Server must never send.
	InvalidPacket,
	/// A well-formed packet violated a protocol invariant (mismatched
	/// payload length, and similar).
	ProtocolError(&'static str),
}

#[derive(Debug)]
struct PublishState<R> {
	response: R,
	retry: HoldOff,
	due: Instant,
	attempts: u32,
	/// This PUBLISH's retry limit, resolved from [`crate::config::PublishRetry`]
	/// at the time it was sent.
	limit: u32,
	topic: crate::TopicBuf,
	payload: Bytes,
	retain: bool,
}

#[derive(Debug)]
struct SubscribeState<T, R> {
	filters: Vec<(FilterBuf, QoS, T)>,
	response: R,
	expires: Instant,
	cancel: CancelToken,
}

#[derive(Debug)]
struct UnsubscribeState<R> {
	filters: Vec<FilterBuf>,
	response: R,
	expires: Instant,
	cancel: CancelToken,
}

/// The full state of one connection attempt: the outgoing packet queue, the
/// subscription table, and every pending PUBLISH/SUBSCRIBE/UNSUBSCRIBE
/// awaiting its ack.
pub struct ClientState<PubTx, PubResp, SubResp, UnsubResp> {
	active_subscriptions: Subscriptions<PubTx>,

	/// Packets queued for transmission, already serialized. Serializing
	/// eagerly (rather than holding typed `Packet`s) sidesteps the borrowed
	/// topic/filter lifetimes in the wire types.
	pub outgoing: BytesMut,

	publish_state: HashMap<PacketId, PublishState<PubResp>>,
	subscribe_state: HashMap<PacketId, SubscribeState<PubTx, SubResp>>,
	unsubscribe_state: HashMap<PacketId, UnsubscribeState<UnsubResp>>,

	ids: IdGenerator,

	/// Serialized CONNECT, resent verbatim on every reconnect attempt.
	connect: Bytes,

	/// Encodes every outbound packet; defaults to [`StandardCodec`] but may
	/// be swapped for a broker-specific override via
	/// [`crate::ConnectOptions::codec`].
	codec: Arc<dyn Codec>,

	pub keep_alive: Duration,
	pub response_wait: Duration,
	pub max_publish_retries: u32,
	pub retry_ceiling: Duration,
	pub retry_interval: Duration,

	/// `Some` while a PINGREQ is outstanding.
	pub pingreq_state: Option<Instant>,
}

impl<PubTx, PubResp, SubResp, UnsubResp> fmt::Debug for ClientState<PubTx, PubResp, SubResp, UnsubResp> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientState")
			.field(
				"active_subscriptions",
				&!self.active_subscriptions.is_empty(),
			)
			.field("outgoing_len", &self.outgoing.len())
			.field("pingreq_state", &self.pingreq_state)
			.finish_non_exhaustive()
	}
}

impl<PubTx, PubResp, SubResp, UnsubResp> Default for ClientState<PubTx, PubResp, SubResp, UnsubResp> {
	fn default() -> Self {
		Self {
			active_subscriptions: Subscriptions::default(),
			outgoing: BytesMut::new(),
			publish_state: HashMap::new(),
			subscribe_state: HashMap::new(),
			unsubscribe_state: HashMap::new(),
			ids: IdGenerator::default(),
			connect: Bytes::new(),
			codec: Arc::new(StandardCodec),
			keep_alive: Duration::default(),
			response_wait: crate::config::DEFAULT_RESPONSE_WAIT,
			max_publish_retries: crate::config::DEFAULT_MAX_PUBLISH_RETRIES,
			retry_ceiling: crate::config::DEFAULT_RETRY_CEILING,
			retry_interval: crate::config::DEFAULT_RETRY_INTERVAL,
			pingreq_state: None,
		}
	}
}

impl<PubTx: Clone + fmt::Debug, PubResp, SubResp, UnsubResp>
	ClientState<PubTx, PubResp, SubResp, UnsubResp>
{
	pub fn new(
		connect: &Connect,
		keep_alive: Duration,
		response_wait: Duration,
		max_publish_retries: u32,
		retry_ceiling: Duration,
		retry_interval: Duration,
		codec: Arc<dyn Codec>,
	) -> Self {
		let mut buffer = BytesMut::new();
		codec
			.encode_connect(connect, &mut buffer)
			.expect("a freshly-built CONNECT always serializes");

		Self {
			connect: buffer.freeze(),
			codec,
			keep_alive,
			response_wait,
			max_publish_retries,
			retry_ceiling,
			retry_interval,
			..Default::default()
		}
	}

	pub fn enqueue_packet(&mut self, packet: &impl Encodable) {
		packet
			.encode_via(&*self.codec, &mut self.outgoing)
			.expect("serializing to an in-memory BytesMut does not fail");
	}

	/// Takes the buffered outgoing bytes, if any, for writing to the wire.
	pub fn take_outgoing(&mut self) -> Option<Bytes> {
		(!self.outgoing.is_empty()).then(|| self.outgoing.split().freeze())
	}

	/// Queues the stored CONNECT packet for (re)transmission.
	pub fn reconnect(&mut self) {
		self.outgoing.extend_from_slice(&self.connect[..]);
	}

	fn next_id(&mut self) -> PacketId {
		let in_use: std::collections::HashSet<PacketId> = self
			.publish_state
			.keys()
			.chain(self.subscribe_state.keys())
			.chain(self.unsubscribe_state.keys())
			.copied()
			.collect();
		self.ids.next(&in_use)
	}

	#[inline]
	pub fn has_active_subscriptions(&self) -> bool {
		!self.active_subscriptions.is_empty()
	}

	/// Re-subscribes to every filter in the active table under a fresh
	/// packet id, used after a reconnect loses the broker-side session.
	pub fn generate_resubscribe(&mut self, response: SubResp) -> bool {
		if self.active_subscriptions.is_empty() {
			return false;
		}

		let drained = self.active_subscriptions.drain();
		let id = self.next_id();

		self.enqueue_packet(&Subscribe {
			id,
			filters: drained
				.iter()
				.map(|(filter, qos, _)| (filter.as_ref(), *qos))
				.collect(),
		});

		self.subscribe_state.insert(
			id,
			SubscribeState {
				filters: drained,
				response,
				expires: Instant::now() + self.response_wait,
				// Nothing external awaits a resubscribe, so it can never be
				// the target of a Command::CancelWait.
				cancel: CancelToken::new(),
			},
		);

		true
	}

	pub fn subscribe(
		&mut self,
		filters: Vec<(FilterBuf, QoS)>,
		channel: PubTx,
		response: SubResp,
		cancel: CancelToken,
	) {
		let id = self.next_id();
		self.enqueue_packet(&Subscribe {
			id,
			filters: filters.iter().map(|(f, q)| (f.as_ref(), *q)).collect(),
		});

		self.subscribe_state.insert(
			id,
			SubscribeState {
				filters: filters
					.into_iter()
					.map(|(filter, qos)| (filter, qos, channel.clone()))
					.collect(),
				response,
				expires: Instant::now() + self.response_wait,
				cancel,
			},
		);
	}

	pub fn suback(&mut self, ack: SubAck) -> Result<(SubResp, Vec<(FilterBuf, QoS)>), StateError> {
		let SubAck { id, result } = ack;

		let state = self
			.subscribe_state
			.remove(&id)
			.ok_or(StateError::Unsolicited(PacketType::SubAck))?;

		let SubscribeState {
			filters, response, ..
		} = state;

		if result.len() != filters.len() {
			return Err(StateError::ProtocolError(
				"SUBACK payload length does not match the SUBSCRIBE payload length",
			));
		}

		let granted: Vec<_> = result
			.into_iter()
			.zip(filters)
			.filter_map(|(result_qos, (filter, _, channel))| {
				let qos = result_qos.ok()?;
				Some((filter, qos, channel))
			})
			.collect();

		for (filter, qos, channel) in &granted {
			self.active_subscriptions
				.insert(filter.clone(), *qos, channel.clone());
		}

		Ok((
			response,
			granted.into_iter().map(|(f, q, _)| (f, q)).collect(),
		))
	}

	pub fn unsubscribe(
		&mut self,
		filters: Vec<FilterBuf>,
		response: UnsubResp,
		cancel: CancelToken,
	) {
		self.active_subscriptions.tombstone(&filters);

		let id = self.next_id();
		self.enqueue_packet(&Unsubscribe {
			id,
			filters: filters.iter().map(|f| f.as_ref()).collect(),
		});

		self.unsubscribe_state.insert(
			id,
			UnsubscribeState {
				filters,
				response,
				expires: Instant::now() + self.response_wait,
				cancel,
			},
		);
	}

	/// Rolls back a not-yet-acknowledged SUBSCRIBE or UNSUBSCRIBE entry whose
	/// `Wait` the caller has given up on, identified by the [`CancelToken`]
	/// it was registered with. A no-op if the ack already arrived first.
	pub fn cancel_wait(&mut self, token: CancelToken) {
		if let Some(id) = self
			.subscribe_state
			.iter()
			.find(|(_, state)| state.cancel == token)
			.map(|(id, _)| *id)
		{
			self.subscribe_state.remove(&id);
			return;
		}

		if let Some(id) = self
			.unsubscribe_state
			.iter()
			.find(|(_, state)| state.cancel == token)
			.map(|(id, _)| *id)
		{
			self.unsubscribe_state.remove(&id);
		}
	}

	pub fn unsuback(&mut self, ack: UnsubAck) -> Result<UnsubResp, StateError> {
		let UnsubAck { id } = ack;

		let state = self
			.unsubscribe_state
			.remove(&id)
			.ok_or(StateError::Unsolicited(PacketType::UnsubAck))?;

		self.active_subscriptions.remove_tombstoned(&state.filters);
		Ok(state.response)
	}

	/// Finds the dispatch channel for an inbound PUBLISH on `topic`.
	pub fn find_publish_channel(&self, topic: &Topic) -> Option<&PubTx> {
		self.active_subscriptions.match_topic(topic)
	}

	/// Enqueues a PUBLISH. Returns `Some(response)` immediately for QoS 0
	/// (there is nothing to wait for); for QoS 1 the response is held until
	/// the matching PUBACK arrives. `retry` overrides this call's retry
	/// limit and starting backoff; fields left `None` fall back to this
	/// connection's configured defaults.
	pub fn publish(
		&mut self,
		topic: crate::TopicBuf,
		payload: Bytes,
		qos: QoS,
		retain: bool,
		retry: crate::config::PublishRetry,
		response: PubResp,
	) -> Option<PubResp> {
		match qos {
			QoS::AtMostOnce => {
				self.enqueue_packet(&Publish::AtMostOnce {
					retain,
					topic: &topic,
					payload,
				});
				Some(response)
			}
			QoS::AtLeastOnce => {
				let id = self.next_id();
				self.enqueue_packet(&Publish::AtLeastOnce {
					id,
					retain,
					duplicate: false,
					topic: &topic,
					payload: payload.clone(),
				});

				let limit = retry.limit.unwrap_or(self.max_publish_retries);
				let interval = retry.interval.unwrap_or(self.retry_interval);

				let mut backoff = HoldOff::new(interval..self.retry_ceiling.max(interval));
				backoff.increase();
				let due = Instant::now() + backoff.current().expect("just increased");

				self.publish_state.insert(
					id,
					PublishState {
						response,
						retry: backoff,
						due,
						attempts: 1,
						limit,
						topic,
						payload,
						retain,
					},
				);
				None
			}
		}
	}

	pub fn puback(&mut self, id: PacketId) -> Result<PubResp, StateError> {
		let state = self
			.publish_state
			.remove(&id)
			.ok_or(StateError::Unsolicited(PacketType::PubAck))?;
		Ok(state.response)
	}

	/// Re-queues every PUBLISH whose retry hold-off has elapsed, marking it
	/// `duplicate = true` and doubling its hold-off. Returns the responses of
	/// publishes that exhausted `max_publish_retries` without being
	/// acknowledged.
	///
	/// Under `aws-compat`, a retried PUBLISH is re-keyed under a freshly
	/// generated packet id rather than resending the original one: AWS IoT
	/// Core's broker acks a retried QoS >= 1 PUBLISH against the identifier
	/// it was last sent with, not the one it first saw.
	pub fn retry_expired_publishes(&mut self) -> Vec<PubResp> {
		let now = Instant::now();
		let due: Vec<PacketId> = self
			.publish_state
			.iter()
			.filter(|(_, state)| now >= state.due)
			.map(|(id, _)| *id)
			.collect();

		let mut exhausted = Vec::new();

		for id in due {
			let mut state = self
				.publish_state
				.remove(&id)
				.expect("id just observed in this map");

			if state.attempts >= state.limit {
				exhausted.push(state.response);
				continue;
			}

			state.attempts += 1;
			state.retry.increase();
			state.due = now + state.retry.current().expect("just increased");

			#[cfg(feature = "aws-compat")]
			let id = self.next_id();

			self.enqueue_packet(&Publish::AtLeastOnce {
				id,
				retain: state.retain,
				duplicate: true,
				topic: &state.topic,
				payload: state.payload.clone(),
			});

			self.publish_state.insert(id, state);
		}

		exhausted
	}

	/// Whether any pending operation has outlived its deadline: an
	/// outstanding PINGREQ, a SUBSCRIBE, or an UNSUBSCRIBE.
	pub fn expired(&self) -> bool {
		let now = Instant::now();

		let pingreq_expired = self.pingreq_state.map_or(false, |sent| {
			now.saturating_duration_since(sent) > self.keep_alive
		});

		let subscribes_expired = self
			.subscribe_state
			.values()
			.any(|state| now > state.expires);

		let unsubscribes_expired = self
			.unsubscribe_state
			.values()
			.any(|state| now > state.expires);

		pingreq_expired || subscribes_expired || unsubscribes_expired
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{QoS, Topic};
	use tokio::sync::oneshot;

	type TestState = ClientState<(), oneshot::Sender<()>, oneshot::Sender<()>, oneshot::Sender<()>>;

	#[test]
	fn publish_at_most_once_completes_immediately() {
		let mut state = TestState::default();
		let (tx, _rx) = oneshot::channel();
		let topic = crate::TopicBuf::try_from("a/b").unwrap();
		let response = state.publish(
			topic,
			Bytes::from_static(b"x"),
			QoS::AtMostOnce,
			false,
			crate::config::PublishRetry::default(),
			tx,
		);
		assert!(response.is_some());
		assert!(state.take_outgoing().is_some());
	}

	#[test]
	fn publish_at_least_once_waits_for_ack() {
		let mut state = TestState::default();
		let (tx, _rx) = oneshot::channel();
		let topic = crate::TopicBuf::try_from("a/b").unwrap();
		let response = state.publish(
			topic,
			Bytes::from_static(b"x"),
			QoS::AtLeastOnce,
			false,
			crate::config::PublishRetry::default(),
			tx,
		);
		assert!(response.is_none());
	}

	#[test]
	fn expired_is_false_with_nothing_pending() {
		let state = TestState::default();
		assert!(!state.expired());
	}

	#[test]
	fn find_publish_channel_uses_best_match() {
		let mut state = TestState::default();
		state.active_subscriptions.insert(
			FilterBuf::new("a/b").unwrap(),
			QoS::AtMostOnce,
			(),
		);
		let topic = Topic::new("a/b").unwrap();
		assert!(state.find_publish_channel(topic).is_some());
	}

	#[test]
	fn retry_reassigns_packet_id_under_aws_compat() {
		let mut state = TestState::default();
		state.retry_ceiling = Duration::from_millis(500);
		let (tx, _rx) = oneshot::channel();
		let topic = crate::TopicBuf::try_from("a/b").unwrap();
		state.publish(
			topic,
			Bytes::from_static(b"x"),
			QoS::AtLeastOnce,
			false,
			crate::config::PublishRetry::default(),
			tx,
		);
		let original_id = *state.publish_state.keys().next().unwrap();

		std::thread::sleep(Duration::from_millis(600));
		let exhausted = state.retry_expired_publishes();
		assert!(exhausted.is_empty());

		let retried_id = *state.publish_state.keys().next().unwrap();

		#[cfg(feature = "aws-compat")]
		assert_ne!(retried_id, original_id);
		#[cfg(not(feature = "aws-compat"))]
		assert_eq!(retried_id, original_id);
	}
}
