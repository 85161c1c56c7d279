//! The pluggable network interface the actor task reads and writes MQTT
//! packets through, plus the framing buffer layered on top of it.
use crate::wire::{
	packets::{Frame, ParseError, SerializePacket},
	Packet,
};
use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Bound satisfied by any duplex byte stream the client can speak MQTT over.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl AsyncReadWrite for TcpStream {}

#[cfg(feature = "tls")]
impl AsyncReadWrite for tokio_rustls::client::TlsStream<TcpStream> {}

/// Lets an in-memory duplex pipe stand in for a socket, so integration
/// tests can drive the actor task against a stub broker without touching
/// the network.
impl AsyncReadWrite for tokio::io::DuplexStream {}

/// Connects to a broker and returns a boxed duplex stream.
///
/// Implemented for plain TCP and, behind the `tls` feature, TLS; tests
/// substitute an in-memory duplex pipe.
#[async_trait::async_trait]
pub trait Transport: Send {
	async fn connect(&self, host: &str, port: u16) -> crate::Result<Box<dyn AsyncReadWrite + Unpin>>;
}

/// Plain TCP transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait::async_trait]
impl Transport for TcpTransport {
	async fn connect(&self, host: &str, port: u16) -> crate::Result<Box<dyn AsyncReadWrite + Unpin>> {
		let stream = TcpStream::connect((host, port)).await?;
		Ok(Box::new(stream))
	}
}

#[cfg(feature = "tls")]
pub use tls::TlsTransport;

#[cfg(feature = "tls")]
mod tls {
	use super::*;
	use std::sync::Arc;
	use tokio_rustls::{
		rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
		TlsConnector,
	};

	/// TLS-over-TCP transport using `tokio-rustls` with the Mozilla root
	/// store bundled by `webpki-roots`. This crate does not implement TLS
	/// itself.
	#[derive(Clone)]
	pub struct TlsTransport {
		config: Arc<ClientConfig>,
	}

	impl Default for TlsTransport {
		fn default() -> Self {
			let mut roots = RootCertStore::empty();
			roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
				OwnedTrustAnchor::from_subject_spki_name_constraints(
					ta.subject,
					ta.spki,
					ta.name_constraints,
				)
			}));

			let config = ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(roots)
				.with_no_client_auth();

			Self {
				config: Arc::new(config),
			}
		}
	}

	#[async_trait::async_trait]
	impl Transport for TlsTransport {
		async fn connect(
			&self,
			host: &str,
			port: u16,
		) -> crate::Result<Box<dyn AsyncReadWrite + Unpin>> {
			let stream = TcpStream::connect((host, port)).await?;
			let connector = TlsConnector::from(Arc::clone(&self.config));
			let name = ServerName::try_from(host)
				.map_err(|_| crate::Error::BadParameter("invalid TLS server name"))?;
			let stream = connector
				.connect(name, stream)
				.await
				.map_err(crate::Error::from)?;
			Ok(Box::new(stream))
		}
	}
}

/// Buffers bytes read from a [`Transport`] and decodes complete MQTT frames
/// from them, writing serialized packets straight through.
pub struct PacketStream<T> {
	stream: T,
	buffer: BytesMut,
}

impl<T> PacketStream<T> {
	pub fn new(stream: T, capacity: usize) -> Self {
		Self {
			stream,
			buffer: BytesMut::with_capacity(capacity),
		}
	}

	fn parse_frame(&mut self) -> Result<Option<Frame>, ParseError> {
		let mut cursor = Cursor::new(&self.buffer[..]);
		match Frame::check(&mut cursor) {
			Ok(extent) => {
				let bytes = self.buffer.split_to(extent).freeze();
				Ok(Some(Frame::parse(bytes)?))
			}
			Err(ParseError::Incomplete) => Ok(None),
			Err(error) => Err(error),
		}
	}
}

impl<T: AsyncRead + Unpin> PacketStream<T> {
	/// Reads from the underlying stream until a complete frame is buffered,
	/// `Ok(None)` on clean shutdown.
	pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
		loop {
			if let Some(frame) = self.parse_frame()? {
				return Ok(Some(frame));
			}

			if 0 == self.stream.read_buf(&mut self.buffer).await? {
				return if self.buffer.is_empty() {
					Ok(None)
				} else {
					Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into())
				};
			}
		}
	}
}

impl<T: AsyncWrite + Unpin> PacketStream<T> {
	pub async fn write(&mut self, mut buffer: impl Buf) -> crate::Result<()> {
		self.stream.write_all_buf(&mut buffer).await?;
		Ok(())
	}
}

/// A connected MQTT stream: frames bytes from a [`Transport`] connection
/// into [`Packet`]s and serializes outgoing packets to it.
pub struct MqttStream {
	stream: PacketStream<Box<dyn AsyncReadWrite + Unpin>>,
}

impl MqttStream {
	pub fn new(stream: Box<dyn AsyncReadWrite + Unpin>, buffer_capacity: usize) -> Self {
		Self {
			stream: PacketStream::new(stream, buffer_capacity),
		}
	}

	pub async fn write_packet(&mut self, packet: &impl SerializePacket) -> crate::Result<()> {
		let mut buf = BytesMut::new();
		packet
			.serialize_to_bytes(&mut buf)
			.map_err(|_| crate::Error::BadParameter("packet too large to serialize"))?;
		self.stream.write(buf).await
	}

	/// Reads the next frame and hands the parsed, borrowed [`Packet`] to `f`.
	///
	/// `Packet<'a>` borrows from the `Frame` backing it, so there is no
	/// owned form to hand back across an `.await` point; passing a callback
	/// instead lets the caller finish with the packet before the `Frame`
	/// that owns its bytes goes out of scope.
	pub async fn read_packet<R>(
		&mut self,
		f: impl FnOnce(Packet<'_>) -> R,
	) -> crate::Result<Option<R>> {
		match self.stream.read_frame().await? {
			Some(frame) => Ok(Some(f(Packet::parse(&frame)?))),
			None => Ok(None),
		}
	}

	pub async fn write_bytes(&mut self, buffer: impl Buf) -> crate::Result<()> {
		self.stream.write(buffer).await
	}
}
