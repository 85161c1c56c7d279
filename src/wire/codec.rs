//! The serializer override vtable: a pluggable encoder sitting between
//! [`crate::state::ClientState`] and the wire, so a caller can swap in a
//! broker-specific wire format without touching the actor loop.
//!
//! The default implementation produces MQTT 3.1.1 bit-for-bit; anything
//! stored via [`crate::ConnectOptions::codec`] stands in for it instead, one
//! packet type at a time.
use super::packets::{
	Connect, Disconnect, PingReq, PubAck, Publish, SerializePacket, Subscribe, Unsubscribe,
};
use super::serde::WriteError;
use bytes::BytesMut;

/// Per-packet-type override points for outbound serialization.
///
/// Every method has a default that matches the standard MQTT 3.1.1 wire
/// format; override only the packets a broker needs encoded differently.
pub trait Codec: Send + Sync {
	fn encode_connect(&self, packet: &Connect<'_>, dst: &mut BytesMut) -> Result<(), WriteError> {
		packet.serialize_to_bytes(dst)
	}

	fn encode_publish(&self, packet: &Publish<'_>, dst: &mut BytesMut) -> Result<(), WriteError> {
		packet.serialize_to_bytes(dst)
	}

	fn encode_puback(&self, packet: &PubAck, dst: &mut BytesMut) -> Result<(), WriteError> {
		packet.serialize_to_bytes(dst)
	}

	fn encode_subscribe(&self, packet: &Subscribe<'_>, dst: &mut BytesMut) -> Result<(), WriteError> {
		packet.serialize_to_bytes(dst)
	}

	fn encode_unsubscribe(
		&self,
		packet: &Unsubscribe<'_>,
		dst: &mut BytesMut,
	) -> Result<(), WriteError> {
		packet.serialize_to_bytes(dst)
	}

	fn encode_pingreq(&self, dst: &mut BytesMut) -> Result<(), WriteError> {
		PingReq.serialize_to_bytes(dst)
	}

	fn encode_disconnect(&self, dst: &mut BytesMut) -> Result<(), WriteError> {
		Disconnect.serialize_to_bytes(dst)
	}
}

/// The MQTT 3.1.1 wire format, unmodified. Installed whenever
/// [`crate::ConnectOptions::codec`] is left `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodec;

impl Codec for StandardCodec {}

/// Routes a concrete packet type to its [`Codec`] method.
///
/// `Codec` cannot simply take `&impl SerializePacket`, since a vtable method
/// must be monomorphic; this is the double-dispatch glue that lets
/// [`crate::state::ClientState::enqueue_packet`] stay generic while still
/// reaching the right override.
pub(crate) trait Encodable {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError>;
}

impl Encodable for Connect<'_> {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_connect(self, dst)
	}
}

impl Encodable for Publish<'_> {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_publish(self, dst)
	}
}

impl Encodable for PubAck {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_puback(self, dst)
	}
}

impl Encodable for Subscribe<'_> {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_subscribe(self, dst)
	}
}

impl Encodable for Unsubscribe<'_> {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_unsubscribe(self, dst)
	}
}

impl Encodable for PingReq {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_pingreq(dst)
	}
}

impl Encodable for Disconnect {
	fn encode_via(&self, codec: &dyn Codec, dst: &mut BytesMut) -> Result<(), WriteError> {
		codec.encode_disconnect(dst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{PacketId, Topic};
	use std::num::NonZeroU16;

	/// A codec that prefixes every PUBLISH with a marker byte, to prove an
	/// override actually reaches the wire instead of the default path.
	#[derive(Debug, Default)]
	struct TaggingCodec;

	impl Codec for TaggingCodec {
		fn encode_publish(&self, packet: &Publish<'_>, dst: &mut BytesMut) -> Result<(), WriteError> {
			dst.extend_from_slice(&[0xff]);
			packet.serialize_to_bytes(dst)
		}
	}

	#[test]
	fn override_runs_instead_of_default_for_its_packet_type() {
		let id: PacketId = NonZeroU16::new(1).unwrap();
		let publish = Publish::AtLeastOnce {
			id,
			topic: Topic::new("a/b").unwrap(),
			payload: bytes::Bytes::from_static(b"hi"),
			retain: false,
			duplicate: false,
		};

		let mut standard = BytesMut::new();
		StandardCodec.encode_publish(&publish, &mut standard).unwrap();

		let mut tagged = BytesMut::new();
		TaggingCodec.encode_publish(&publish, &mut tagged).unwrap();

		assert_eq!(tagged[0], 0xff);
		assert_eq!(&tagged[1..], &standard[..]);
	}

	#[test]
	fn unoverridden_packet_types_fall_back_to_the_default() {
		let mut standard = BytesMut::new();
		StandardCodec.encode_pingreq(&mut standard).unwrap();

		let mut tagged = BytesMut::new();
		TaggingCodec.encode_pingreq(&mut tagged).unwrap();

		assert_eq!(standard, tagged);
	}
}
