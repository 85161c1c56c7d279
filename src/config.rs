//! Runtime-overridable configuration.
//!
//! Values that the original implementation this client is modeled on
//! carries as compile-time macros (`IOT_MQTT_RESPONSE_WAIT_MS`,
//! `IOT_MQTT_RETRY_MS_CEILING`, the AWS keep-alive bounds) are ordinary
//! struct fields here, since a Rust library cannot require a recompile to
//! change a timeout.
use crate::{wire::Codec, QoS};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};

/// Default time a waitable operation (SUBSCRIBE, UNSUBSCRIBE, ...) is
/// allowed to remain unacknowledged before [`crate::Error::Timeout`].
pub const DEFAULT_RESPONSE_WAIT: Duration = Duration::from_secs(5);

/// Ceiling for the exponential retry backoff applied to both reconnection
/// attempts and QoS >= 1 PUBLISH retransmission.
pub const DEFAULT_RETRY_CEILING: Duration = Duration::from_secs(60);

/// Lower bound on CONNECT `keep_alive` accepted by AWS IoT Core.
pub const AWS_IOT_MIN_KEEPALIVE_SECS: u16 = 30;

/// Upper bound on CONNECT `keep_alive` accepted by AWS IoT Core. A
/// requested keep-alive of `0` (meaning "no keep-alive") is clamped to this
/// value rather than left disabled, since AWS IoT Core does not honor a
/// disabled keep-alive.
pub const AWS_IOT_MAX_KEEPALIVE_SECS: u16 = 1200;

/// Maximum number of retransmission attempts for a QoS >= 1 PUBLISH before
/// it fails with [`crate::Error::RetryExhausted`].
pub const DEFAULT_MAX_PUBLISH_RETRIES: u32 = 8;

/// Starting backoff before a QoS >= 1 PUBLISH's first retransmission,
/// doubling (up to `retry_ceiling`) on each attempt after that.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Owned login credentials, re-sent verbatim on every reconnection.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

impl From<&str> for Credentials {
	#[inline]
	fn from(username: &str) -> Self {
		Self {
			username: username.to_owned(),
			password: None,
		}
	}
}

impl From<(&str, &str)> for Credentials {
	#[inline]
	fn from((username, password): (&str, &str)) -> Self {
		Self {
			username: username.to_owned(),
			password: Some(password.to_owned()),
		}
	}
}

/// Owned Last Will and Testament, re-sent verbatim on every reconnection.
#[derive(Clone, Debug)]
pub struct Will {
	pub topic: crate::TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

/// Parameters for [`crate::Client::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
	pub host: String,
	pub port: u16,
	pub client_id: String,
	pub keep_alive: Duration,
	pub clean_session: bool,
	pub credentials: Option<Credentials>,
	pub will: Option<Will>,
	/// Overrides the default MQTT 3.1.1 wire encoding for one or more
	/// outbound packet types. `None` uses [`crate::StandardCodec`].
	pub codec: Option<Arc<dyn Codec>>,
	#[cfg(feature = "tls")]
	pub tls: bool,
}

impl std::fmt::Debug for ConnectOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut debug = f.debug_struct("ConnectOptions");
		debug
			.field("host", &self.host)
			.field("port", &self.port)
			.field("client_id", &self.client_id)
			.field("keep_alive", &self.keep_alive)
			.field("clean_session", &self.clean_session)
			.field("credentials", &self.credentials)
			.field("will", &self.will)
			.field("codec", &self.codec.is_some().then_some("<override>"));
		#[cfg(feature = "tls")]
		debug.field("tls", &self.tls);
		debug.finish()
	}
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			host: String::new(),
			port: 1883,
			client_id: String::new(),
			keep_alive: Duration::from_secs(60),
			clean_session: true,
			credentials: None,
			will: None,
			codec: None,
			#[cfg(feature = "tls")]
			tls: false,
		}
	}
}

impl<H: AsRef<str>> From<(H, u16)> for ConnectOptions {
	fn from((host, port): (H, u16)) -> Self {
		Self {
			host: host.as_ref().to_owned(),
			port,
			..Default::default()
		}
	}
}

/// Timeouts and retry limits that govern the operation engine and
/// keep-alive clock.
#[derive(Clone, Debug)]
pub struct Limits {
	pub response_wait: Duration,
	pub retry_ceiling: Duration,
	pub max_publish_retries: u32,
	/// Default starting backoff for a QoS >= 1 PUBLISH's retry schedule.
	/// Overridable per call with [`PublishRetry::interval`].
	pub retry_interval: Duration,
	/// How long [`crate::Client::connect`] waits for the first CONNACK
	/// before failing with [`crate::Error::Timeout`].
	pub connect_timeout: Duration,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			response_wait: DEFAULT_RESPONSE_WAIT,
			retry_ceiling: DEFAULT_RETRY_CEILING,
			max_publish_retries: DEFAULT_MAX_PUBLISH_RETRIES,
			retry_interval: DEFAULT_RETRY_INTERVAL,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}
}

/// Default time [`crate::Client::connect`] waits for the first CONNACK.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call override for a QoS >= 1 PUBLISH's retry schedule. Each `None`
/// field falls back to the connection-wide default carried on [`Limits`].
/// `Some(0)` for `limit` disables retry outright: the PUBLISH is sent once
/// and fails with [`crate::Error::RetryExhausted`] if no PUBACK arrives
/// before that single attempt expires.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublishRetry {
	pub limit: Option<u32>,
	pub interval: Option<Duration>,
}

/// Clamps a requested keep-alive to the bounds AWS IoT Core enforces.
/// A request of `0` seconds ("disabled") is raised to the maximum, since
/// AWS IoT Core treats it as invalid rather than as "no keep-alive".
#[cfg(feature = "aws-compat")]
pub(crate) fn clamp_aws_keepalive(requested: Duration) -> Duration {
	let secs = requested.as_secs();
	let clamped = if secs == 0 {
		AWS_IOT_MAX_KEEPALIVE_SECS
	} else {
		secs.clamp(
			AWS_IOT_MIN_KEEPALIVE_SECS as u64,
			AWS_IOT_MAX_KEEPALIVE_SECS as u64,
		) as u16
	};
	Duration::from_secs(clamped as u64)
}

#[cfg(all(test, feature = "aws-compat"))]
mod tests {
	use super::*;

	#[test]
	fn zero_keepalive_clamps_to_max() {
		assert_eq!(
			clamp_aws_keepalive(Duration::from_secs(0)),
			Duration::from_secs(AWS_IOT_MAX_KEEPALIVE_SECS as u64)
		);
	}

	#[test]
	fn out_of_range_keepalive_clamps() {
		assert_eq!(
			clamp_aws_keepalive(Duration::from_secs(5)),
			Duration::from_secs(AWS_IOT_MIN_KEEPALIVE_SECS as u64)
		);
		assert_eq!(
			clamp_aws_keepalive(Duration::from_secs(99999)),
			Duration::from_secs(AWS_IOT_MAX_KEEPALIVE_SECS as u64)
		);
	}

	#[test]
	fn in_range_keepalive_is_unchanged() {
		assert_eq!(
			clamp_aws_keepalive(Duration::from_secs(120)),
			Duration::from_secs(120)
		);
	}
}
