//! Type descriptors used to reject mismatched publishers and subscribers

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Describes the payload type carried by a topic.
///
/// Two endpoints are compatible when `size`, `align` and `schema_hash` are
/// equal. `type_name` is informational and only surfaces in discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Human readable type name
    pub type_name: String,
    /// Size of one element in bytes
    pub size: u64,
    /// Required alignment in bytes
    pub align: u32,
    /// Hash identifying the schema
    pub schema_hash: u64,
}

impl TypeDescriptor {
    /// Descriptor for an untyped byte payload
    pub fn bytes() -> Self {
        Self::custom("[u8]", 1, 1)
    }

    /// Descriptor for a plain-old-data type.
    ///
    /// The schema hash is derived from `std::any::type_name`, which is only
    /// stable between binaries built by the same compiler. Use
    /// [`TypeDescriptor::with_schema_hash`] for cross-toolchain setups.
    pub fn of<T: bytemuck::Pod>() -> Self {
        Self::custom(
            std::any::type_name::<T>(),
            std::mem::size_of::<T>() as u64,
            std::mem::align_of::<T>() as u32,
        )
    }

    /// Descriptor with an explicit name, size and alignment
    pub fn custom(type_name: impl Into<String>, size: u64, align: u32) -> Self {
        let type_name = type_name.into();
        let schema_hash = schema_hash(&type_name, size, align);
        Self {
            type_name,
            size,
            align,
            schema_hash,
        }
    }

    /// Override the schema hash
    pub fn with_schema_hash(mut self, schema_hash: u64) -> Self {
        self.schema_hash = schema_hash;
        self
    }

    /// Check whether two descriptors may share a topic
    pub fn is_compatible(&self, other: &TypeDescriptor) -> bool {
        self.size == other.size && self.align == other.align && self.schema_hash == other.schema_hash
    }

    /// Validate the descriptor
    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::SeuratError;

        if self.size == 0 {
            return Err(SeuratError::invalid_parameter(
                "type_descriptor.size",
                "Type size must be greater than 0",
            ));
        }

        if self.align == 0 || !self.align.is_power_of_two() {
            return Err(SeuratError::invalid_parameter(
                "type_descriptor.align",
                "Alignment must be a power of two",
            ));
        }

        Ok(())
    }
}

impl Default for TypeDescriptor {
    fn default() -> Self {
        Self::bytes()
    }
}

/// FNV-1a over the type name, size and alignment
fn schema_hash(type_name: &str, size: u64, align: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    let size_bytes = size.to_le_bytes();
    let align_bytes = align.to_le_bytes();
    let bytes = type_name
        .as_bytes()
        .iter()
        .chain(size_bytes.iter())
        .chain(align_bytes.iter());
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
