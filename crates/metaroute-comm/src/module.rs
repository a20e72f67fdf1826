//! Logical protocol consumers sharing one transport

use crate::error::CommError;
use derive_more::Display;

/// Tag identifying which component sent or should receive a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[repr(u8)]
pub enum CommunicationModule {
    LoadBalancing = 0,
    DistributedAtomicOp = 1,
    AdminOp = 2,
    PrefixPerm = 3,
}

impl CommunicationModule {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommunicationModule {
    type Error = CommError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::LoadBalancing),
            1 => Ok(Self::DistributedAtomicOp),
            2 => Ok(Self::AdminOp),
            3 => Ok(Self::PrefixPerm),
            other => Err(CommError::Malformed(format!("unknown module tag {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_tags() {
        assert_eq!(CommunicationModule::AdminOp.as_u8(), 2);
        assert_eq!(
            CommunicationModule::try_from(3).unwrap(),
            CommunicationModule::PrefixPerm
        );
        assert!(CommunicationModule::try_from(4).is_err());
        assert_eq!(CommunicationModule::LoadBalancing.to_string(), "LoadBalancing");
    }
}
