//! Serialized topic information stored after the segment header

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SeuratError},
    topic::TypeDescriptor,
};

use super::constants::STATIC_INFO_CAPACITY;

/// Immutable description of a topic, written once by the segment creator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticInfo {
    pub domain: String,
    pub topic: String,
    pub type_descriptor: TypeDescriptor,
    pub created_by: u32,
    pub created_at_nanos: u64,
    pub persistent: bool,
}

impl StaticInfo {
    /// Serialize with bincode, returning the bytes and their CRC32
    pub fn encode(&self) -> Result<(Vec<u8>, u32)> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > STATIC_INFO_CAPACITY {
            return Err(SeuratError::invalid_parameter(
                "static_info",
                format!(
                    "Topic information needs {} bytes, only {} are reserved",
                    bytes.len(),
                    STATIC_INFO_CAPACITY
                ),
            ));
        }
        let crc = crc32fast::hash(&bytes);
        Ok((bytes, crc))
    }

    /// Verify the checksum and deserialize
    pub fn decode(bytes: &[u8], crc: u32) -> Result<Self> {
        if crc32fast::hash(bytes) != crc {
            return Err(SeuratError::corrupted("Static info checksum mismatch"));
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StaticInfo {
        StaticInfo {
            domain: "robot".to_string(),
            topic: "imu".to_string(),
            type_descriptor: TypeDescriptor::custom("Imu", 24, 4),
            created_by: 42,
            created_at_nanos: 1_700_000_000,
            persistent: false,
        }
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let (mut bytes, crc) = info().encode().unwrap();
        assert_eq!(StaticInfo::decode(&bytes, crc).unwrap(), info());

        bytes[0] ^= 0xff;
        let err = StaticInfo::decode(&bytes, crc).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupted);
    }

    #[test]
    fn test_oversized_info_is_rejected() {
        let mut big = info();
        big.topic = "t".repeat(STATIC_INFO_CAPACITY);
        assert!(big.encode().is_err());
    }
}
