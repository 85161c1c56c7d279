//! The actor event loop: one task per connection, owning a [`ClientState`]
//! exclusively and driving it from three event sources — commands from
//! `Client` handles, packets from the Server, and keep-alive/retry ticks.
use crate::{
	command::{Command, CommandRx, Message, PublishCommand, SubscribeCommand, UnsubscribeCommand},
	config::ConnectOptions,
	retry::HoldOff,
	state::{ClientState, StateError},
	transport::{MqttStream, Transport},
	wire::{
		packets::{self, ConnAck, Publish},
		Packet,
	},
};
use std::{ops::ControlFlow, time::Instant};
use tokio::{sync::oneshot, time};

pub type TokioClientState = ClientState<
	crate::command::PublishTx,
	oneshot::Sender<crate::Result<()>>,
	oneshot::Sender<Vec<(crate::FilterBuf, crate::QoS)>>,
	oneshot::Sender<()>,
>;

/// Drives reconnection: dials the transport, waits out the backoff on
/// failure, and runs one connection's [`preconnect_task`]/[`connected_task`]
/// lifecycle until the caller asks to shut down or the Server refuses the
/// connection outright.
///
/// `connect_ack`, if given, is resolved at most once, with the outcome of
/// the *first* CONNACK this task observes — it exists so
/// [`crate::Client::connect`] can wait for that outcome synchronously
/// instead of returning a handle before the connection is even live.
/// Reconnects after that first attempt are unobserved by any caller.
pub async fn run(
	options: ConnectOptions,
	transport: Box<dyn Transport>,
	state: &mut TokioClientState,
	commands: &mut CommandRx,
	mut connect_ack: Option<oneshot::Sender<crate::Result<()>>>,
) -> crate::Result<()> {
	let mut reconnect_delay = HoldOff::new(
		std::time::Duration::from_millis(75)..state.keep_alive.max(std::time::Duration::from_secs(1)),
	);

	loop {
		reconnect_delay.wait_and_increase().await;

		let stream = match transport.connect(&options.host, options.port).await {
			Ok(stream) => stream,
			Err(error) => {
				tracing::warn!(error = ?error, "failed to connect, backing off");
				continue;
			}
		};

		let mut connection = MqttStream::new(stream, 8 * 1024);

		match preconnect_task(state, commands, &mut connection, &mut reconnect_delay, &mut connect_ack).await {
			ControlFlow::Continue(()) => continue,
			ControlFlow::Break(result) => break result,
		}
	}
}

pub async fn preconnect_task(
	state: &mut TokioClientState,
	commands: &mut CommandRx,
	connection: &mut MqttStream,
	reconnect_delay: &mut HoldOff,
	connect_ack: &mut Option<oneshot::Sender<crate::Result<()>>>,
) -> ControlFlow<crate::Result<()>, ()> {
	state.reconnect();
	let Some(bytes) = state.take_outgoing() else {
		return ControlFlow::Continue(());
	};

	if connection.write_bytes(bytes).await.is_err() {
		return ControlFlow::Continue(());
	}

	let sleep = time::sleep(state.keep_alive.max(std::time::Duration::from_secs(5)));
	tokio::pin!(sleep);

	#[rustfmt::skip]
	let session_present = tokio::select! {
		result = connection.read_packet(|packet| match packet {
			Packet::ConnAck(ConnAck { session_present, code }) => Some((session_present, code)),
			_ => None,
		}) => {
			match result {
				Ok(Some(Some((session_present, code)))) => {
					if code != 0x00 {
						tracing::warn!(code, "connect refused by server");
						let error = crate::Error::ServerRefused(code);
						if let Some(ack) = connect_ack.take() {
							let _ = ack.send(Err(crate::Error::ServerRefused(code)));
						}
						// A non-zero CONNACK code is never retryable: resending
						// the identical CONNECT would only be refused again.
						return ControlFlow::Break(Err(error));
					}
					reconnect_delay.reset();
					if let Some(ack) = connect_ack.take() {
						let _ = ack.send(Ok(()));
					}
					session_present
				}
				_ => return ControlFlow::Continue(()),
			}
		}
		_ = &mut sleep => return ControlFlow::Continue(()),
	};

	connected_task(state, commands, connection, session_present).await
}

async fn connected_task(
	state: &mut TokioClientState,
	commands: &mut CommandRx,
	connection: &mut MqttStream,
	session_present: bool,
) -> ControlFlow<crate::Result<()>, ()> {
	if !session_present && state.has_active_subscriptions() {
		let (tx, rx) = oneshot::channel();
		if state.generate_resubscribe(tx) {
			if let Some(bytes) = state.take_outgoing() {
				if connection.write_bytes(bytes).await.is_err() {
					return ControlFlow::Continue(());
				}
			}
		}
		tokio::spawn(async move {
			if let Err(error) = rx.await {
				tracing::warn!(?error, "failed to restore session subscriptions");
			}
		});
	}

	let mut keep_alive =
		time::interval_at((Instant::now() + state.keep_alive).into(), state.keep_alive);
	let mut retry_tick = time::interval(std::time::Duration::from_secs(1));

	loop {
		#[rustfmt::skip]
		tokio::select! {
			command = commands.recv() => {
				let Some(command) = command else {
					return ControlFlow::Break(Ok(()));
				};

				if process_command(state, command) {
					if let Some(bytes) = state.take_outgoing() {
						let _ = connection.write_bytes(bytes).await;
					}
					return ControlFlow::Break(Ok(()));
				}
			}
			result = connection.read_packet(|packet| process_packet(&mut *state, packet)) => {
				match result {
					Ok(Some(Ok(()))) => {}
					Ok(Some(Err(error))) => {
						tracing::warn!(?error, "protocol violation from server");
						return ControlFlow::Continue(());
					}
					Ok(None) => {
						tracing::warn!("connection closed by server");
						return ControlFlow::Continue(());
					}
					Err(error) => {
						tracing::warn!(?error, "transport read failed");
						return ControlFlow::Continue(());
					}
				}
			}
			_ = keep_alive.tick() => {
				if state.expired() {
					tracing::warn!("pending requests exceeded their deadline");
					return ControlFlow::Continue(());
				}

				if state.pingreq_state.is_none() {
					state.pingreq_state = Some(Instant::now());
					state.enqueue_packet(&packets::PingReq);
				}
			}
			_ = retry_tick.tick() => {
				for response in state.retry_expired_publishes() {
					let _ = response.send(Err(crate::Error::RetryExhausted));
				}
			}
		}

		if let Some(bytes) = state.take_outgoing() {
			if connection.write_bytes(bytes).await.is_err() {
				return ControlFlow::Continue(());
			}
			keep_alive.reset_at((Instant::now() + state.keep_alive).into());
		}
	}
}

fn process_packet(state: &mut TokioClientState, packet: Packet) -> Result<(), StateError> {
	match packet {
		Packet::Publish(publish) => {
			let message = Message {
				topic: publish.topic().to_owned(),
				payload: publish.payload().clone(),
				retain: publish.retain(),
			};

			let Some(channel) = state.find_publish_channel(publish.topic()) else {
				tracing::warn!(topic = %publish.topic(), "dropping publish with no matching subscription");
				if let Some(id) = publish.id() {
					state.enqueue_packet(&packets::PubAck { id });
				}
				return Ok(());
			};

			if channel.try_send(message).is_err() {
				tracing::warn!(topic = %publish.topic(), "dropping publish, subscriber channel full or closed");
			}

			if let Publish::AtLeastOnce { id, .. } = *publish {
				state.enqueue_packet(&packets::PubAck { id });
			}

			Ok(())
		}
		Packet::PubAck(packets::PubAck { id }) => {
			if let Ok(response) = state.puback(id) {
				let _ = response.send(Ok(()));
			}
			Ok(())
		}
		Packet::SubAck(ack) => {
			let (response, granted) = state.suback(*ack)?;
			let _ = response.send(granted);
			Ok(())
		}
		Packet::UnsubAck(ack) => {
			let response = state.unsuback(ack)?;
			let _ = response.send(());
			Ok(())
		}
		Packet::PingResp => {
			let Some(sent) = state.pingreq_state.take() else {
				return Err(StateError::Unsolicited(crate::PacketType::PingResp));
			};
			tracing::trace!(elapsed = ?sent.elapsed(), "pingresp received");
			Ok(())
		}
		Packet::Connect(_)
		| Packet::ConnAck(_)
		| Packet::Subscribe(_)
		| Packet::Unsubscribe(_)
		| Packet::PingReq
		| Packet::Disconnect => Err(StateError::InvalidPacket),
	}
}

/// Processes a command, returning `true` if the task should shut down.
fn process_command(state: &mut TokioClientState, command: Command) -> bool {
	match command {
		Command::Shutdown => {
			state.enqueue_packet(&packets::Disconnect);
			true
		}
		Command::Publish(PublishCommand {
			topic,
			payload,
			qos,
			retain,
			retry,
			response,
		}) => {
			if let Some(response) = state.publish(topic, payload, qos, retain, retry, response) {
				let _ = response.send(Ok(()));
			}
			false
		}
		Command::Subscribe(SubscribeCommand {
			filters,
			channel,
			response,
			cancel,
		}) => {
			state.subscribe(filters, channel, response, cancel);
			false
		}
		Command::Unsubscribe(UnsubscribeCommand {
			filters,
			response,
			cancel,
		}) => {
			state.unsubscribe(filters, response, cancel);
			false
		}
		Command::CancelWait(token) => {
			state.cancel_wait(token);
			false
		}
	}
}
