//! Small value types shared by the wire codec and the public API.
use crate::QoS;
use bytes::Bytes;
use std::num::NonZeroU16;

/// Login credentials carried on a CONNECT packet.
///
/// It is not possible to set a password without also setting a username,
/// matching the MQTT 3.1.1 CONNECT flag layout (the password flag may only
/// be set when the username flag is set).
#[derive(Clone, Debug)]
pub struct Credentials<'a> {
	pub username: &'a str,
	pub password: Option<&'a str>,
}

/// Last Will and Testament, published by the Server on behalf of the Client
/// if the connection is lost without a prior DISCONNECT.
#[derive(Clone, Debug)]
pub struct Will<'a> {
	pub topic: &'a crate::Topic,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

/// A monotonically-increasing [`NonZeroU16`] counter that wraps back to `1`
/// instead of overflowing. Start from [`WrappingNonZeroU16::MAX`] if the
/// first increment should yield `1`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WrappingNonZeroU16(NonZeroU16);

impl WrappingNonZeroU16 {
	pub const MAX: Self = Self(NonZeroU16::MAX);

	#[inline]
	pub fn get(self) -> NonZeroU16 {
		self.0
	}
}

impl Default for WrappingNonZeroU16 {
	#[inline]
	fn default() -> Self {
		Self(NonZeroU16::MIN)
	}
}

impl std::ops::AddAssign<u16> for WrappingNonZeroU16 {
	#[inline]
	fn add_assign(&mut self, rhs: u16) {
		self.0 = self.0.checked_add(rhs).unwrap_or(NonZeroU16::MIN);
	}
}

#[cfg(test)]
mod tests {
	use super::WrappingNonZeroU16;
	use std::num::NonZeroU16;

	#[test]
	fn wraps_around_to_one() {
		let mut id = WrappingNonZeroU16::MAX;
		id += 1;
		assert_eq!(id.get(), NonZeroU16::new(1).unwrap());
	}
}
