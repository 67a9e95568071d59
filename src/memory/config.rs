//! Segment layout configuration and file naming

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    config::{ROOT_DIR_NAME, ROOT_ENV},
    error::{Result, SeuratError},
    layout::{
        LayoutParams, MessagingPattern, SegmentHeader, SegmentLayout, FLAG_CHECKSUM,
        FLAG_PERSISTENT, LAYOUT_VERSION, SEGMENT_EXTENSION, SEGMENT_MAGIC,
    },
    topic::TypeDescriptor,
};

/// Everything that determines the shared layout of a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Publish-subscribe topic or event service
    pub pattern: MessagingPattern,
    /// Payload type
    pub type_descriptor: TypeDescriptor,
    /// Capacity of one slot payload in bytes
    pub payload_size: usize,
    /// Number of sample slots
    pub slot_count: usize,
    /// Publisher entries in the endpoint table
    pub max_publishers: usize,
    /// Subscriber entries in the endpoint table
    pub max_subscribers: usize,
    /// Depth of each subscriber queue
    pub queue_capacity: usize,
    /// Distinct event ids per listener (event services)
    pub event_capacity: usize,
    /// Keep the file after the last detach (fixed by the creator)
    pub persistent: bool,
    /// Stamp payload checksums (fixed by the creator)
    pub checksum_payloads: bool,
}

impl SegmentConfig {
    /// Layout parameters for offset computation
    pub fn layout_params(&self) -> LayoutParams {
        LayoutParams {
            payload_size: self.payload_size,
            type_align: self.type_descriptor.align as usize,
            slot_count: self.slot_count,
            max_publishers: self.max_publishers,
            max_subscribers: self.max_subscribers,
            queue_capacity: self.queue_capacity,
            event_capacity: self.event_capacity,
        }
    }

    /// Compute the segment layout
    pub fn layout(&self) -> Result<SegmentLayout> {
        SegmentLayout::compute(self.layout_params())
    }

    /// Header flag bits
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.persistent {
            flags |= FLAG_PERSISTENT;
        }
        if self.checksum_payloads {
            flags |= FLAG_CHECKSUM;
        }
        flags
    }

    /// Check that an existing, ready header describes the same layout.
    ///
    /// Topics must match exactly. An event service only has to offer at least
    /// the requested notifiers, listeners and event ids. Persistence and
    /// checksum flags are decided by the creator and are not compared.
    pub fn check_compatible(&self, segment: &str, header: &SegmentHeader) -> Result<()> {
        if header.magic != SEGMENT_MAGIC {
            return Err(SeuratError::incompatible(segment, "Bad magic number"));
        }

        if header.layout_version != LAYOUT_VERSION {
            return Err(SeuratError::incompatible(
                segment,
                format!(
                    "Layout version {} does not match {}",
                    header.layout_version, LAYOUT_VERSION
                ),
            ));
        }

        match header.pattern() {
            Some(pattern) if pattern == self.pattern => {}
            Some(pattern) => {
                return Err(SeuratError::incompatible(
                    segment,
                    format!(
                        "Segment is a {} service, requested {}",
                        pattern.name(),
                        self.pattern.name()
                    ),
                ))
            }
            None => {
                return Err(SeuratError::incompatible(
                    segment,
                    format!("Unknown messaging pattern {}", header.pattern),
                ))
            }
        }

        let desc = &self.type_descriptor;
        if header.type_size != desc.size
            || header.type_align != desc.align
            || header.schema_hash != desc.schema_hash
        {
            return Err(SeuratError::incompatible(
                segment,
                format!(
                    "Payload type {} (size {}, align {}) does not match the topic type (size {}, align {})",
                    desc.type_name, desc.size, desc.align, header.type_size, header.type_align
                ),
            ));
        }

        let at_least = self.pattern == MessagingPattern::Event;
        let mismatches = [
            ("payload_size", header.payload_size as usize, self.payload_size, false),
            ("pool_capacity", header.slot_count as usize, self.slot_count, false),
            ("max_publishers", header.max_publishers as usize, self.max_publishers, at_least),
            ("max_subscribers", header.max_subscribers as usize, self.max_subscribers, at_least),
            ("queue_capacity", header.queue_capacity as usize, self.queue_capacity, false),
            ("event_capacity", header.event_capacity as usize, self.event_capacity, at_least),
        ];

        for (field, existing, requested, at_least) in mismatches {
            let compatible = if at_least {
                existing >= requested
            } else {
                existing == requested
            };
            if !compatible {
                let relation = if at_least { "at least " } else { "" };
                return Err(SeuratError::incompatible(
                    segment,
                    format!("{} is {}, requested {}{}", field, existing, relation, requested),
                ));
            }
        }

        Ok(())
    }
}

/// Resolve the root directory holding all domains.
///
/// `SEURAT_ROOT` wins; otherwise `/dev/shm/seurat` where `/dev/shm` exists,
/// else `seurat` under the system temp directory.
pub fn default_root() -> PathBuf {
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }

    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(ROOT_DIR_NAME)
    } else {
        std::env::temp_dir().join(ROOT_DIR_NAME)
    }
}

/// Directory of a domain
pub fn domain_dir(root: &Path, domain: &str) -> PathBuf {
    root.join(domain)
}

/// File backing a topic segment
pub fn segment_path(root: &Path, domain: &str, topic: &str) -> PathBuf {
    domain_dir(root, domain).join(format!("{}.{}", topic, SEGMENT_EXTENSION))
}

/// Topic name of a segment file, if the file looks like one
pub fn topic_from_path(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_paths() {
        let root = Path::new("/tmp/seurat-test");
        let path = segment_path(root, "robot", "imu");
        assert_eq!(path, PathBuf::from("/tmp/seurat-test/robot/imu.seg"));
        assert_eq!(topic_from_path(&path), Some("imu".to_string()));
        assert_eq!(topic_from_path(Path::new("/tmp/robot/imu.tmp")), None);
    }

    #[test]
    fn test_flags() {
        let config = SegmentConfig {
            pattern: MessagingPattern::PublishSubscribe,
            type_descriptor: TypeDescriptor::bytes(),
            payload_size: 64,
            slot_count: 4,
            max_publishers: 1,
            max_subscribers: 1,
            queue_capacity: 4,
            event_capacity: 0,
            persistent: true,
            checksum_payloads: true,
        };
        assert_eq!(config.flags(), FLAG_PERSISTENT | FLAG_CHECKSUM);
        assert!(config.layout().is_ok());
    }
}
