/// Quality of Service.
///
/// QoS 2 (`ExactlyOnce`) publish is not implemented by this crate; the
/// server-assigned return codes that would select it during SUBSCRIBE are
/// rejected the same way a broker rejects any unsupported subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
	#[default]
	AtMostOnce = 0,
	AtLeastOnce = 1,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid QoS value {0}")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
	type Error = InvalidQoS;
	#[inline]
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::AtMostOnce),
			1 => Ok(Self::AtLeastOnce),
			other => Err(InvalidQoS(other)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_valid_values() {
		assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
		assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
	}

	#[test]
	fn rejects_qos_two_and_above() {
		assert!(QoS::try_from(2).is_err());
		assert!(QoS::try_from(3).is_err());
	}
}
