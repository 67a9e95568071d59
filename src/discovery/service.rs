//! Read-only enumeration of domains, topics and endpoints

use std::{
    io::ErrorKind as IoErrorKind,
    mem::size_of,
    path::{Path, PathBuf},
    sync::atomic::Ordering,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    error::{Result, SeuratError},
    layout::{
        EndpointEntry, EndpointKind, EntryState, MessagingPattern, SegmentHeader, SegmentLayout, SegmentState,
        SlotMeta, StaticInfo, LAYOUT_VERSION, SEGMENT_MAGIC, STATIC_INFO_CAPACITY,
    },
    liveness::endpoint_alive,
    memory::{default_root, domain_dir, segment_path, topic_from_path, ReadOnlyRegion},
    pool::SamplePool,
    topic::{validate_name, OverflowPolicy},
};

use super::records::{DomainInfo, EndpointInfo, TopicInfo};

/// Lists what exists below a root directory without attaching to anything.
///
/// Segments are mapped read-only and only read with atomic loads. Files that
/// are not ready segments (wrong magic or version, still initializing, bad
/// static info checksum) are skipped, as are endpoints whose process is gone
/// or whose heartbeat is older than the staleness threshold.
#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    heartbeat_timeout: Option<Duration>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(default_root())
    }
}

impl Discovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            heartbeat_timeout: None,
        }
    }

    /// Treat endpoints whose heartbeat is older than `timeout` as gone
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every domain directory below the root
    pub fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let mut domains = Vec::new();
        for entry in read_dir(&self.root)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if validate_name("domain", name).is_ok() => name.to_string(),
                _ => continue,
            };
            let topic_count = match self.list_topics(&name) {
                Ok(topics) => topics.len(),
                Err(e) => {
                    warn!("Skipping domain {}: {}", path.display(), e);
                    continue;
                }
            };
            domains.push(DomainInfo {
                name,
                path,
                topic_count,
            });
        }
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }

    /// Every ready topic of `domain`; empty when the domain does not exist
    pub fn list_topics(&self, domain: &str) -> Result<Vec<TopicInfo>> {
        validate_name("domain", domain)?;

        let mut topics = Vec::new();
        for entry in read_dir(&domain_dir(&self.root, domain))? {
            let path = entry.path();
            if topic_from_path(&path).is_none() {
                continue;
            }
            match SegmentView::open(&path) {
                Ok(Some(view)) => topics.push(self.topic_info(&view, path)),
                Ok(None) => {}
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    /// Live endpoints of `domain/topic`; empty when the topic does not exist
    pub fn list_endpoints(&self, domain: &str, topic: &str) -> Result<Vec<EndpointInfo>> {
        validate_name("domain", domain)?;
        validate_name("topic", topic)?;

        let path = segment_path(&self.root, domain, topic);
        let view = match SegmentView::open(&path) {
            Ok(Some(view)) => view,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                return Ok(Vec::new());
            }
        };

        let mut endpoints: Vec<EndpointInfo> = view
            .entries()
            .iter()
            .filter_map(|entry| self.endpoint_info(entry))
            .collect();
        endpoints.sort_by_key(|e| e.id);
        Ok(endpoints)
    }

    fn live(&self, entry: &EndpointEntry) -> Option<(EndpointKind, u32)> {
        if entry.state() != EntryState::Active {
            return None;
        }
        let kind = entry.kind()?;
        let pid = entry.pid.load(Ordering::Acquire);
        let heartbeat = entry.heartbeat.load(Ordering::Acquire);
        if endpoint_alive(pid, heartbeat, self.heartbeat_timeout) {
            Some((kind, pid))
        } else {
            None
        }
    }

    fn endpoint_info(&self, entry: &EndpointEntry) -> Option<EndpointInfo> {
        let (kind, pid) = self.live(entry)?;
        Some(EndpointInfo {
            id: entry.endpoint_id.load(Ordering::Acquire),
            kind,
            pid,
            policy: OverflowPolicy::from_raw(entry.policy.load(Ordering::Relaxed)),
            connected_at_nanos: entry.connected_at.load(Ordering::Relaxed),
            heartbeat_nanos: entry.heartbeat.load(Ordering::Relaxed),
            samples: entry.counter.load(Ordering::Relaxed),
            dropped: entry.dropped.load(Ordering::Relaxed),
            peers: entry.peers.load(Ordering::Relaxed),
        })
    }

    fn topic_info(&self, view: &SegmentView, path: PathBuf) -> TopicInfo {
        let header = view.header();
        let params = &view.layout.params;

        let (mut producers, mut consumers) = (0, 0);
        for entry in view.entries() {
            match self.live(entry) {
                Some((kind, _)) if kind.is_producer() => producers += 1,
                Some(_) => consumers += 1,
                None => {}
            }
        }

        TopicInfo {
            pattern: header.pattern().unwrap_or(MessagingPattern::PublishSubscribe),
            domain: view.info.domain.clone(),
            name: view.info.topic.clone(),
            path,
            type_descriptor: view.info.type_descriptor.clone(),
            payload_size: params.payload_size,
            pool_capacity: params.slot_count,
            queue_capacity: params.queue_capacity,
            max_publishers: params.max_publishers,
            max_subscribers: params.max_subscribers,
            persistent: header.is_persistent(),
            checksums: header.has_checksums(),
            size: view.layout.total_size,
            attached: header.attached.load(Ordering::Acquire),
            event_capacity: params.event_capacity,
            producers,
            consumers,
            created_by: view.info.created_by,
            created_at_nanos: view.info.created_at_nanos,
            pool: SamplePool::new(header, view.slot_metas()).stats(),
        }
    }
}

fn read_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(|e| e.ok()).collect()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SeuratError::from_io(e, "Failed to list directory")),
    }
}

/// A ready segment mapped read-only
struct SegmentView {
    region: ReadOnlyRegion,
    layout: SegmentLayout,
    info: StaticInfo,
}

impl SegmentView {
    /// `Ok(None)` for anything that is not a ready segment of this format
    fn open(path: &Path) -> Result<Option<Self>> {
        let region = match ReadOnlyRegion::open(path, size_of::<SegmentHeader>())? {
            Some(region) => region,
            None => return Ok(None),
        };

        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        if header.magic != SEGMENT_MAGIC || header.layout_version != LAYOUT_VERSION {
            debug!("{} is not a segment of this format", path.display());
            return Ok(None);
        }
        if header.state() != SegmentState::Ready {
            return Ok(None);
        }

        let layout = SegmentLayout::from_header(header)?;
        if layout.total_size > region.size() {
            return Err(SeuratError::corrupted(format!(
                "{} is shorter than its layout",
                path.display()
            )));
        }

        let len = header.static_info_len as usize;
        if len > STATIC_INFO_CAPACITY {
            return Err(SeuratError::corrupted("Static info length out of range"));
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(region.as_ptr().add(layout.static_info_offset), len)
        };
        let info = StaticInfo::decode(bytes, header.static_info_crc)?;

        Ok(Some(Self {
            region,
            layout,
            info,
        }))
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    fn entries(&self) -> &[EndpointEntry] {
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(self.layout.endpoints_offset) as *const EndpointEntry,
                self.layout.endpoint_count(),
            )
        }
    }

    fn slot_metas(&self) -> &[SlotMeta] {
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(self.layout.slot_meta_offset) as *const SlotMeta,
                self.layout.params.slot_count,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::MessagingPattern,
        memory::{SegmentConfig, SegmentManager},
        topic::TypeDescriptor,
    };
    use tempfile::TempDir;

    fn config() -> SegmentConfig {
        SegmentConfig {
            pattern: MessagingPattern::PublishSubscribe,
            type_descriptor: TypeDescriptor::bytes(),
            payload_size: 64,
            slot_count: 4,
            max_publishers: 1,
            max_subscribers: 1,
            queue_capacity: 2,
            event_capacity: 0,
            persistent: false,
            checksum_payloads: false,
        }
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let discovery = Discovery::new(dir.path().join("nothing"));
        assert!(discovery.list_domains().unwrap().is_empty());
        assert!(discovery.list_topics("robot").unwrap().is_empty());
        assert!(discovery.list_endpoints("robot", "imu").unwrap().is_empty());
    }

    #[test]
    fn test_foreign_files_skipped() {
        let dir = TempDir::new().unwrap();
        let domain = dir.path().join("robot");
        std::fs::create_dir_all(&domain).unwrap();
        std::fs::write(domain.join("junk.seg"), vec![0u8; 4096]).unwrap();
        std::fs::write(domain.join("notes.txt"), b"hello").unwrap();

        let discovery = Discovery::new(dir.path());
        assert!(discovery.list_topics("robot").unwrap().is_empty());

        let domains = discovery.list_domains().unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].topic_count, 0);
    }

    #[test]
    fn test_ready_segment_listed() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(dir.path(), Duration::from_millis(200));
        let _handle = manager.open_or_create("robot", "imu", &config()).unwrap();

        let topics = Discovery::new(dir.path()).list_topics("robot").unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "imu");
        assert_eq!(topics[0].pool_capacity, 4);
        assert_eq!(topics[0].attached, 1);
        assert_eq!(topics[0].pool.free, 4);
        assert_eq!(topics[0].producers, 0);
    }

    #[test]
    fn test_corrupted_static_info_skipped() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(dir.path(), Duration::from_millis(200));
        let handle = manager.open_or_create("robot", "imu", &config()).unwrap();

        let offset = handle.layout().static_info_offset;
        unsafe {
            let byte = (handle.header() as *const SegmentHeader as *mut u8).add(offset);
            *byte ^= 0xff;
        }

        assert!(Discovery::new(dir.path()).list_topics("robot").unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_domain_skipped() {
        use std::{fs::Permissions, os::unix::fs::PermissionsExt};

        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(dir.path(), Duration::from_millis(200));
        let _handle = manager.open_or_create("robot", "imu", &config()).unwrap();

        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, Permissions::from_mode(0o000)).unwrap();
        // Privileged users read through the mode bits.
        let unreadable = std::fs::read_dir(&locked).is_err();

        let domains = Discovery::new(dir.path()).list_domains();
        std::fs::set_permissions(&locked, Permissions::from_mode(0o755)).unwrap();

        let names: Vec<String> = domains.unwrap().into_iter().map(|d| d.name).collect();
        if unreadable {
            assert_eq!(names, ["robot"]);
        } else {
            assert_eq!(names, ["locked", "robot"]);
        }
    }

    #[test]
    fn test_event_service_listed() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(dir.path(), Duration::from_millis(200));
        let events = SegmentConfig {
            pattern: MessagingPattern::Event,
            payload_size: 0,
            slot_count: 0,
            queue_capacity: 0,
            event_capacity: 8,
            ..config()
        };
        let _handle = manager.open_or_create("robot", "alarm", &events).unwrap();

        let topics = Discovery::new(dir.path()).list_topics("robot").unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].pattern, MessagingPattern::Event);
        assert_eq!(topics[0].event_capacity, 8);
        assert_eq!(topics[0].pool_capacity, 0);
    }
}
