//! Drives the actor task end to end over an in-memory duplex pipe, with a
//! hand-rolled stub broker on the other end reading and writing raw frames.
use bytes::{Bytes, BytesMut};
use iot_mqtt_client::{
	config::{ConnectOptions, Limits, PublishRetry, Will},
	transport::{AsyncReadWrite, MqttStream, Transport},
	wire::{
		packets::{ConnAck, PubAck, Publish, SerializePacket, SubAck, SubscribeFailed, UnsubAck},
		serde::WriteError,
		Packet,
	},
	Client, Codec, Error, FilterBuf, PacketId, QoS, Topic, TopicBuf,
};
use std::{
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::{io::DuplexStream, time::timeout};

/// Hands the duplex stream to the first `connect()` call and fails every
/// call after, so a dropped connection's background reconnect attempts
/// don't spin up a second stub broker nobody is driving.
struct SingleConnect(Mutex<Option<DuplexStream>>);

impl SingleConnect {
	fn new(stream: DuplexStream) -> Self {
		Self(Mutex::new(Some(stream)))
	}
}

#[async_trait::async_trait]
impl Transport for SingleConnect {
	async fn connect(
		&self,
		_host: &str,
		_port: u16,
	) -> iot_mqtt_client::Result<Box<dyn AsyncReadWrite + Unpin>> {
		match self.0.lock().unwrap().take() {
			Some(stream) => Ok(Box::new(stream)),
			None => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
		}
	}
}

/// The broker side of the pipe, speaking the same framed codec the client
/// does.
struct StubBroker(MqttStream);

impl StubBroker {
	async fn next<R>(&mut self, f: impl FnOnce(Packet<'_>) -> R) -> R {
		self.0
			.read_packet(f)
			.await
			.expect("transport read failed")
			.expect("connection closed early")
	}

	async fn expect_connect(&mut self) {
		self.next(|packet| assert!(matches!(packet, Packet::Connect(_))))
			.await;
	}

	async fn expect_disconnect(&mut self) {
		self.next(|packet| assert!(matches!(packet, Packet::Disconnect)))
			.await;
	}

	async fn expect_pingreq(&mut self) {
		self.next(|packet| assert!(matches!(packet, Packet::PingReq)))
			.await;
	}

	async fn expect_subscribe(&mut self) -> (PacketId, Vec<(String, QoS)>) {
		self.next(|packet| match packet {
			Packet::Subscribe(s) => (
				s.id,
				s.filters
					.iter()
					.map(|(f, q)| (f.as_str().to_owned(), *q))
					.collect(),
			),
			other => panic!("expected SUBSCRIBE, got {other:?}"),
		})
		.await
	}

	async fn expect_unsubscribe(&mut self) -> (PacketId, Vec<String>) {
		self.next(|packet| match packet {
			Packet::Unsubscribe(u) => (
				u.id,
				u.filters.iter().map(|f| f.as_str().to_owned()).collect(),
			),
			other => panic!("expected UNSUBSCRIBE, got {other:?}"),
		})
		.await
	}

	/// Returns (topic, payload, retain, duplicate, packet id).
	async fn expect_publish(&mut self) -> (String, Bytes, bool, bool, Option<PacketId>) {
		self.next(|packet| match packet {
			Packet::Publish(p) => (
				p.topic().as_str().to_owned(),
				p.payload().clone(),
				p.retain(),
				p.duplicate(),
				p.id(),
			),
			other => panic!("expected PUBLISH, got {other:?}"),
		})
		.await
	}

	async fn send_connack(&mut self, code: u8, session_present: bool) {
		self.0
			.write_packet(&ConnAck {
				session_present,
				code,
			})
			.await
			.unwrap();
	}

	async fn send_suback(&mut self, id: PacketId, result: Vec<Result<QoS, SubscribeFailed>>) {
		self.0.write_packet(&SubAck { id, result }).await.unwrap();
	}

	async fn send_unsuback(&mut self, id: PacketId) {
		self.0.write_packet(&UnsubAck { id }).await.unwrap();
	}

	async fn send_puback(&mut self, id: PacketId) {
		self.0.write_packet(&PubAck { id }).await.unwrap();
	}

	async fn send_publish(&mut self, topic: &str, payload: &[u8]) {
		self.0
			.write_packet(&Publish::AtMostOnce {
				retain: false,
				topic: Topic::new(topic).unwrap(),
				payload: Bytes::copy_from_slice(payload),
			})
			.await
			.unwrap();
	}
}

type Connecting =
	std::pin::Pin<Box<dyn std::future::Future<Output = iot_mqtt_client::Result<(Client, tokio::task::JoinHandle<iot_mqtt_client::Result<()>>)>>>>;

/// Spawns the actor against a duplex pipe and hands back the client side
/// before any CONNACK has been exchanged, so tests can drive the stub
/// broker's side of the handshake themselves. `Client::connect_with_transport`
/// itself waits for that CONNACK, so it runs concurrently with whatever
/// drives the broker in each test rather than being awaited here.
fn setup(keep_alive: Duration, limits: Limits) -> (Connecting, StubBroker) {
	let (client_side, broker_side) = tokio::io::duplex(128 * 1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "integration-test".to_owned(),
		keep_alive,
		..Default::default()
	};

	let connecting = Box::pin(Client::connect_with_transport(options, limits, transport));
	let broker = StubBroker(MqttStream::new(Box::new(broker_side), 128 * 1024));

	(connecting, broker)
}

/// Drives `connecting` to completion concurrently with sending an
/// accepting CONNACK from `broker`, and unwraps the result.
async fn connect_accepted(
	connecting: Connecting,
	broker: &mut StubBroker,
) -> (Client, tokio::task::JoinHandle<iot_mqtt_client::Result<()>>) {
	let driver = async {
		broker.expect_connect().await;
		broker.send_connack(0x00, false).await;
	};
	let (result, ()) = tokio::join!(connecting, driver);
	result.expect("connect should succeed against an accepting stub broker")
}

#[tokio::test]
async fn happy_connect_and_keepalive_pingreq() {
	let (connecting, mut broker) = setup(Duration::from_millis(150), Limits::default());
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	timeout(Duration::from_millis(500), broker.expect_pingreq())
		.await
		.expect("client did not send a keep-alive PINGREQ in time");

	drop(client);
}

#[tokio::test]
async fn qos1_publish_retries_then_exhausts() {
	let limits = Limits {
		max_publish_retries: 2,
		..Default::default()
	};
	let (connecting, mut broker) = setup(Duration::from_secs(60), limits);
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let publish = tokio::spawn({
		let client = client.clone();
		async move {
			client
				.publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
				.await
		}
	});

	let (_, _, _, duplicate, id) = broker.expect_publish().await;
	assert!(!duplicate);
	let id = id.expect("QoS 1 PUBLISH carries a packet id");

	let (_, _, _, duplicate, retried_id) = timeout(Duration::from_secs(3), broker.expect_publish())
		.await
		.expect("expected a retransmitted PUBLISH");
	assert!(duplicate);

	// Under the default `aws-compat` feature, AWS IoT Core acks a retried
	// QoS >= 1 PUBLISH against the id it was last sent with, so the retry
	// is re-keyed; without it the original id is resent unchanged.
	#[cfg(feature = "aws-compat")]
	assert_ne!(retried_id, Some(id));
	#[cfg(not(feature = "aws-compat"))]
	assert_eq!(retried_id, Some(id));

	let result = timeout(Duration::from_secs(3), publish)
		.await
		.expect("publish task timed out")
		.unwrap();
	assert!(matches!(result, Err(Error::RetryExhausted)));
}

#[tokio::test]
async fn qos1_publish_completes_on_puback() {
	let (connecting, mut broker) = setup(Duration::from_secs(60), Limits::default());
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let publish = tokio::spawn({
		let client = client.clone();
		async move {
			client
				.publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
				.await
		}
	});

	let (_, _, _, _, id) = broker.expect_publish().await;
	broker.send_puback(id.unwrap()).await;

	let result = timeout(Duration::from_secs(1), publish).await.unwrap().unwrap();
	assert!(result.is_ok());
}

#[tokio::test]
async fn subscribe_partial_reject_drops_failed_filter_silently() {
	let (connecting, mut broker) = setup(Duration::from_secs(60), Limits::default());
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let subscribe = tokio::spawn({
		let client = client.clone();
		async move {
			client
				.subscribe([("a", QoS::AtMostOnce), ("b/#", QoS::AtLeastOnce)], 8)
				.await
		}
	});

	let (id, filters) = broker.expect_subscribe().await;
	assert_eq!(
		filters,
		vec![
			("a".to_owned(), QoS::AtMostOnce),
			("b/#".to_owned(), QoS::AtLeastOnce),
		]
	);
	broker
		.send_suback(id, vec![Ok(QoS::AtMostOnce), Err(SubscribeFailed)])
		.await;

	let mut subscription = timeout(Duration::from_secs(1), subscribe)
		.await
		.unwrap()
		.unwrap()
		.unwrap();
	assert_eq!(
		subscription.filters(),
		&[(FilterBuf::new("a").unwrap(), QoS::AtMostOnce)]
	);

	broker.send_publish("b/x", b"ignored").await;
	let received = timeout(Duration::from_millis(200), subscription.recv()).await;
	assert!(
		received.is_err(),
		"message on a refused filter must not be delivered"
	);
}

#[tokio::test]
async fn subscribe_wait_timeout_cancels_pending_entry() {
	let limits = Limits {
		response_wait: Duration::from_millis(80),
		..Default::default()
	};
	let (connecting, mut broker) = setup(Duration::from_secs(60), limits);
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let result = client.subscribe([("x", QoS::AtMostOnce)], 8).await;
	assert!(matches!(result, Err(Error::Timeout(_))));

	// The SUBSCRIBE still went out; its (late) SUBACK arrives only after the
	// caller has already given up and the entry has been cancelled.
	let (id, _) = broker.expect_subscribe().await;
	broker.send_suback(id, vec![Ok(QoS::AtMostOnce)]).await;
}

#[tokio::test]
async fn disconnect_during_pending_publish_fails_the_publish() {
	let (connecting, mut broker) = setup(Duration::from_secs(60), Limits::default());
	let (client, handle) = connect_accepted(connecting, &mut broker).await;

	let publish = tokio::spawn({
		let client = client.clone();
		async move {
			client
				.publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
				.await
		}
	});

	broker.expect_publish().await;
	client.disconnect().await.unwrap();
	broker.expect_disconnect().await;

	let result = timeout(Duration::from_secs(1), publish).await.unwrap().unwrap();
	assert!(matches!(result, Err(Error::Closed)));

	let _ = timeout(Duration::from_secs(1), handle).await;
}

/// The actor task is single-threaded and processes one command or packet at
/// a time, so there is no literal race to exercise here: a PUBLISH cannot be
/// mid-dispatch while an UNSUBSCRIBE is being applied. What this checks is
/// the ordering guarantee that property relies on — once the UNSUBSCRIBE's
/// ack has been processed, no later PUBLISH on that filter is delivered.
#[tokio::test]
async fn unsubscribe_stops_dispatch_to_matching_topic() {
	let (connecting, mut broker) = setup(Duration::from_secs(60), Limits::default());
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let subscribe = tokio::spawn({
		let client = client.clone();
		async move { client.subscribe([("x", QoS::AtMostOnce)], 8).await }
	});
	let (id, _) = broker.expect_subscribe().await;
	broker.send_suback(id, vec![Ok(QoS::AtMostOnce)]).await;
	let mut subscription = timeout(Duration::from_secs(1), subscribe)
		.await
		.unwrap()
		.unwrap()
		.unwrap();

	broker.send_publish("x", b"before").await;
	let message = timeout(Duration::from_millis(200), subscription.recv())
		.await
		.expect("message should arrive before unsubscribing")
		.expect("channel should stay open");
	assert_eq!(&message.payload[..], b"before");

	let unsubscribe = tokio::spawn({
		let client = client.clone();
		async move { client.unsubscribe(["x"]).await }
	});
	let (unsub_id, _) = broker.expect_unsubscribe().await;
	broker.send_unsuback(unsub_id).await;
	timeout(Duration::from_secs(1), unsubscribe)
		.await
		.unwrap()
		.unwrap()
		.unwrap();

	broker.send_publish("x", b"after").await;
	let received = timeout(Duration::from_millis(200), subscription.recv()).await;
	assert!(
		received.is_err(),
		"no message should be delivered once unsubscribed"
	);
}

#[tokio::test]
async fn connect_fails_synchronously_on_server_refused() {
	let (client_side, broker_side) = tokio::io::duplex(4 * 1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "c".to_owned(),
		..Default::default()
	};

	let connecting = Client::connect_with_transport(options, Limits::default(), transport);
	let mut broker = StubBroker(MqttStream::new(Box::new(broker_side), 4 * 1024));

	let driver = async {
		broker.expect_connect().await;
		broker.send_connack(0x01, false).await;
	};
	let (result, ()) = tokio::join!(connecting, driver);
	assert!(matches!(result, Err(Error::ServerRefused(0x01))));
}

#[tokio::test]
async fn connect_times_out_when_no_connack_arrives() {
	let (client_side, _broker_side) = tokio::io::duplex(4 * 1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "c".to_owned(),
		..Default::default()
	};
	let limits = Limits {
		connect_timeout: Duration::from_millis(100),
		..Default::default()
	};

	let result = Client::connect_with_transport(options, limits, transport).await;
	assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tokio::test]
async fn qos1_publish_with_retry_override_uses_custom_schedule() {
	let (connecting, mut broker) = setup(Duration::from_secs(60), Limits::default());
	let (client, _handle) = connect_accepted(connecting, &mut broker).await;

	let publish = tokio::spawn({
		let client = client.clone();
		async move {
			client
				.publish_with_retry(
					"t",
					Bytes::from_static(b"x"),
					QoS::AtLeastOnce,
					false,
					PublishRetry {
						limit: Some(3),
						interval: Some(Duration::from_millis(50)),
					},
				)
				.await
		}
	});

	// One initial send plus 3 retries before the custom limit is exhausted;
	// the stub never sends a PUBACK for any of them.
	for _ in 0..4 {
		timeout(Duration::from_secs(2), broker.expect_publish())
			.await
			.expect("expected a PUBLISH frame");
	}

	let result = timeout(Duration::from_secs(1), publish)
		.await
		.expect("publish task timed out")
		.unwrap();
	assert!(matches!(result, Err(Error::RetryExhausted)));
}

#[tokio::test]
async fn oversized_will_payload_is_rejected() {
	let (client_side, _broker_side) = tokio::io::duplex(1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "c".to_owned(),
		will: Some(Will {
			topic: TopicBuf::new("lwt").unwrap(),
			payload: Bytes::from(vec![0u8; 65536]),
			qos: QoS::AtMostOnce,
			retain: false,
		}),
		..Default::default()
	};

	let result = Client::connect_with_transport(options, Limits::default(), transport).await;
	assert!(matches!(result, Err(Error::BadParameter(_))));
}

#[tokio::test]
async fn max_size_will_payload_is_accepted() {
	let (client_side, broker_side) = tokio::io::duplex(256 * 1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "c".to_owned(),
		will: Some(Will {
			topic: TopicBuf::new("lwt").unwrap(),
			payload: Bytes::from(vec![0u8; 65535]),
			qos: QoS::AtMostOnce,
			retain: false,
		}),
		..Default::default()
	};

	let connecting = Client::connect_with_transport(options, Limits::default(), transport);
	let mut broker = StubBroker(MqttStream::new(Box::new(broker_side), 256 * 1024));

	let driver = async {
		timeout(Duration::from_secs(1), broker.expect_connect())
			.await
			.expect("CONNECT carrying the maximum-size will payload did not arrive");
		broker.send_connack(0x00, false).await;
	};
	let (result, ()) = tokio::join!(connecting, driver);
	let (client, _handle) = result.unwrap();

	drop(client);
}

/// A serializer override that forces every PUBLISH onto the wire with
/// `retain` set, regardless of what the caller asked for.
#[derive(Debug)]
struct ForceRetainCodec;

impl Codec for ForceRetainCodec {
	fn encode_publish(&self, packet: &Publish<'_>, dst: &mut BytesMut) -> Result<(), WriteError> {
		let forced = match packet {
			Publish::AtMostOnce { topic, payload, .. } => Publish::AtMostOnce {
				retain: true,
				topic: *topic,
				payload: payload.clone(),
			},
			Publish::AtLeastOnce { id, duplicate, topic, payload, .. } => Publish::AtLeastOnce {
				id: *id,
				retain: true,
				duplicate: *duplicate,
				topic: *topic,
				payload: payload.clone(),
			},
		};
		forced.serialize_to_bytes(dst)
	}
}

#[tokio::test]
async fn codec_override_reaches_the_wire() {
	let (client_side, broker_side) = tokio::io::duplex(64 * 1024);
	let transport: Box<dyn Transport> = Box::new(SingleConnect::new(client_side));

	let options = ConnectOptions {
		host: "stub".to_owned(),
		client_id: "c".to_owned(),
		codec: Some(Arc::new(ForceRetainCodec)),
		..Default::default()
	};

	let connecting = Client::connect_with_transport(options, Limits::default(), transport);
	let mut broker = StubBroker(MqttStream::new(Box::new(broker_side), 64 * 1024));

	let driver = async {
		broker.expect_connect().await;
		broker.send_connack(0x00, false).await;
	};
	let (result, ()) = tokio::join!(connecting, driver);
	let (client, _handle) = result.unwrap();

	client
		.publish("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce, false)
		.await
		.unwrap();

	let (_, _, retain, _, _) = broker.expect_publish().await;
	assert!(retain, "override should have forced retain=true onto the wire");
}
