//! The public handle to a running connection: cheap to clone, backed by an
//! actor task reachable only through [`Command`]s sent over an unbounded
//! channel.
use crate::{
	command::{
		CancelToken, Command, CommandTx, PublishCommand, SubscribeCommand, UnsubscribeCommand,
	},
	config::{ConnectOptions, Limits, PublishRetry},
	misc::{Credentials, Will},
	state::ClientState,
	subscription::Subscription,
	task,
	transport::{TcpTransport, Transport},
	wire::packets::Connect,
	Error, FilterBuf, QoS, Result, TopicBuf,
};
use bytes::Bytes;
use std::time::Duration;
use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};

/// A handle to a running MQTT connection.
///
/// Cloning a `Client` is cheap (it is just an `mpsc` sender); every clone
/// drives the same actor task and shares the same connection.
#[derive(Clone, Debug)]
pub struct Client {
	tx: CommandTx,
	response_wait: Duration,
}

impl Client {
	fn new(tx: CommandTx, response_wait: Duration) -> Self {
		Self { tx, response_wait }
	}

	/// Connects to `options.host:options.port` over plain TCP and waits up
	/// to `limits.connect_timeout` for the CONNACK, then spawns the actor
	/// task that keeps the connection alive (retrying with exponential
	/// backoff on drops) until a caller calls [`Client::disconnect`] or
	/// every handle (and the actor's internal references) are dropped.
	///
	/// Returns the `Client` handle together with the actor task's
	/// [`JoinHandle`], which resolves once the task has shut down. Fails
	/// with [`Error::Timeout`] if no CONNACK arrives in time, or with
	/// [`Error::ServerRefused`] if the Server's CONNACK carries a non-zero
	/// return code.
	pub async fn connect(
		options: ConnectOptions,
		limits: Limits,
	) -> Result<(Self, JoinHandle<Result<()>>)> {
		Self::connect_with_transport(options, limits, Box::new(TcpTransport)).await
	}

	/// As [`Client::connect`], but dialing through a caller-supplied
	/// [`Transport`] instead of a bare TCP socket. Integration tests use
	/// this to run the actor task over an in-memory duplex pipe.
	pub async fn connect_with_transport(
		options: ConnectOptions,
		limits: Limits,
		transport: Box<dyn Transport>,
	) -> Result<(Self, JoinHandle<Result<()>>)> {
		if let Some(will) = &options.will {
			if will.payload.len() > u16::MAX as usize {
				return Err(Error::BadParameter("will payload exceeds 65535 bytes"));
			}
		}

		let (tx, mut rx) = mpsc::unbounded_channel();

		#[cfg(feature = "aws-compat")]
		let keep_alive = crate::config::clamp_aws_keepalive(options.keep_alive);
		#[cfg(not(feature = "aws-compat"))]
		let keep_alive = options.keep_alive;

		let credentials = options.credentials.as_ref().map(|c| Credentials {
			username: &c.username,
			password: c.password.as_deref(),
		});
		let will = options.will.as_ref().map(|w| Will {
			topic: w.topic.as_ref(),
			payload: w.payload.clone(),
			qos: w.qos,
			retain: w.retain,
		});

		let connect = Connect {
			client_id: &options.client_id,
			keep_alive: keep_alive.as_secs().try_into().unwrap_or(u16::MAX),
			clean_session: options.clean_session,
			credentials,
			will,
			..Default::default()
		};

		let codec = options
			.codec
			.clone()
			.unwrap_or_else(|| std::sync::Arc::new(crate::wire::StandardCodec));

		let mut state = ClientState::new(
			&connect,
			keep_alive,
			limits.response_wait,
			limits.max_publish_retries,
			limits.retry_ceiling,
			limits.retry_interval,
			codec,
		);

		let response_wait = limits.response_wait;
		let connect_timeout = limits.connect_timeout;
		let mut options = options;
		options.keep_alive = keep_alive;

		let (connect_ack, connect_ack_rx) = oneshot::channel();

		let handle = tokio::spawn(async move {
			task::run(options, transport, &mut state, &mut rx, Some(connect_ack)).await
		});

		match tokio::time::timeout(connect_timeout, connect_ack_rx).await {
			Ok(Ok(Ok(()))) => Ok((Self::new(tx, response_wait), handle)),
			Ok(Ok(Err(error))) => Err(error),
			Ok(Err(_)) => Err(Error::Closed),
			Err(_) => {
				handle.abort();
				Err(Error::Timeout(connect_timeout))
			}
		}
	}

	/// Subscribes to `filters`, returning a [`Subscription`] once the
	/// matching SUBACK arrives (or [`Error::Timeout`] if it doesn't, within
	/// this client's configured `response_wait`).
	///
	/// `buffer` bounds how many unconsumed messages the subscription's
	/// channel holds before a slow consumer starts losing the oldest
	/// unread message.
	pub async fn subscribe<F, E>(
		&self,
		filters: impl IntoIterator<Item = (F, QoS)>,
		buffer: usize,
	) -> Result<Subscription>
	where
		F: TryInto<FilterBuf, Error = E>,
		Error: From<E>,
	{
		let filters = filters
			.into_iter()
			.map(|(filter, qos)| Ok((filter.try_into()?, qos)))
			.collect::<Result<Vec<_>>>()?;

		let (response, response_rx) = oneshot::channel();
		let (channel, rx) = mpsc::channel(buffer.max(1));
		let cancel = CancelToken::new();

		self.tx.send(Command::Subscribe(SubscribeCommand {
			filters,
			channel,
			response,
			cancel,
		}))?;

		match tokio::time::timeout(self.response_wait, response_rx).await {
			Ok(received) => {
				let granted = received?;
				Ok(Subscription::new(
					granted,
					rx,
					self.tx.clone(),
					self.response_wait,
				))
			}
			Err(_) => {
				let _ = self.tx.send(Command::CancelWait(cancel));
				Err(Error::Timeout(self.response_wait))
			}
		}
	}

	/// Publishes `payload` to `topic`, using this connection's default
	/// retry limit and backoff for [`QoS::AtLeastOnce`]. See
	/// [`Client::publish_with_retry`] to override them per call.
	pub async fn publish<T, E>(
		&self,
		topic: T,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<()>
	where
		T: TryInto<TopicBuf, Error = E>,
		Error: From<E>,
	{
		self.publish_with_retry(topic, payload, qos, retain, PublishRetry::default())
			.await
	}

	/// As [`Client::publish`], but with `retry` overriding this call's
	/// retry limit and starting backoff for [`QoS::AtLeastOnce`].
	///
	/// For [`QoS::AtMostOnce`] this resolves once the packet has been
	/// handed to the transport; for [`QoS::AtLeastOnce`] it resolves once
	/// the matching PUBACK arrives, or fails with
	/// [`Error::RetryExhausted`] if the retry budget is exhausted first.
	pub async fn publish_with_retry<T, E>(
		&self,
		topic: T,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
		retry: PublishRetry,
	) -> Result<()>
	where
		T: TryInto<TopicBuf, Error = E>,
		Error: From<E>,
	{
		let topic = topic.try_into()?;
		let (response, response_rx) = oneshot::channel();

		self.tx.send(Command::Publish(PublishCommand {
			topic,
			payload: payload.into(),
			qos,
			retain,
			retry,
			response,
		}))?;

		response_rx.await??;
		Ok(())
	}

	/// Unsubscribes `filters` directly, without going through a
	/// [`Subscription`] handle.
	pub async fn unsubscribe<F, E>(&self, filters: impl IntoIterator<Item = F>) -> Result<()>
	where
		F: TryInto<FilterBuf, Error = E>,
		Error: From<E>,
	{
		let filters = filters
			.into_iter()
			.map(|f| Ok(f.try_into()?))
			.collect::<Result<Vec<_>>>()?;

		unsubscribe(&self.tx, self.response_wait, filters).await
	}

	/// Sends a DISCONNECT and asks the actor task to shut down.
	pub async fn disconnect(self) -> Result<()> {
		self.tx.send(Command::Shutdown)?;
		Ok(())
	}
}

/// Shared by [`Client::unsubscribe`] and [`Subscription::unsubscribe`].
pub(crate) async fn unsubscribe(
	tx: &CommandTx,
	response_wait: Duration,
	filters: Vec<FilterBuf>,
) -> Result<()> {
	let (response, response_rx) = oneshot::channel();
	let cancel = CancelToken::new();

	tx.send(Command::Unsubscribe(UnsubscribeCommand {
		filters,
		response,
		cancel,
	}))?;

	match tokio::time::timeout(response_wait, response_rx).await {
		Ok(received) => {
			received?;
			Ok(())
		}
		Err(_) => {
			let _ = tx.send(Command::CancelWait(cancel));
			Err(Error::Timeout(response_wait))
		}
	}
}
