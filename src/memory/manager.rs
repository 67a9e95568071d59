//! Creating, attaching to and removing topic segments

use std::{
    collections::HashMap,
    io::ErrorKind as IoErrorKind,
    mem::size_of,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc, RwLock, Weak},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::DEFAULT_CREATION_TIMEOUT,
    error::{Result, SeuratError},
    layout::{
        HeaderParams, SegmentHeader, SegmentLayout, SegmentState, StaticInfo, LAYOUT_VERSION,
        SEGMENT_MAGIC, STATIC_INFO_CAPACITY,
    },
    liveness::{current_pid, now_nanos, process_alive},
    topic::validate_name,
};

use super::{
    config::{default_root, domain_dir, segment_path, SegmentConfig},
    region::{ReadOnlyRegion, SharedMemoryRegion},
    segment::{Segment, SegmentHandle},
};

/// Pause between attempts while another process creates or destroys a segment
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one attempt to attach to a segment file
enum Attempt {
    /// Attached; the count already includes the new handle
    Attached(Arc<Segment>),
    /// No file at the path
    Missing,
    /// Creator still initializing
    Pending,
    /// Initialization abandoned by a dead creator
    Stale { inode: u64 },
    /// Last user is unlinking the file
    Destroying,
}

/// Opens topic segments below one root directory.
///
/// Handles of the same segment opened through one manager share a single
/// mapping.
#[derive(Debug)]
pub struct SegmentManager {
    root: PathBuf,
    creation_timeout: Duration,
    segments: RwLock<HashMap<PathBuf, Weak<Segment>>>,
}

impl SegmentManager {
    /// Create a manager for `root` with the given creation timeout
    pub fn new(root: impl Into<PathBuf>, creation_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            creation_timeout,
            segments: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn creation_timeout(&self) -> Duration {
        self.creation_timeout
    }

    /// File backing `domain/topic`
    pub fn segment_path(&self, domain: &str, topic: &str) -> PathBuf {
        segment_path(&self.root, domain, topic)
    }

    /// Attach to `domain/topic`, creating the segment if it does not exist.
    ///
    /// An existing segment must match `config` exactly, otherwise this fails
    /// with `Incompatible`.
    pub fn open_or_create(
        &self,
        domain: &str,
        topic: &str,
        config: &SegmentConfig,
    ) -> Result<SegmentHandle> {
        self.open(domain, topic, Some(config))
    }

    /// Attach to an existing segment, adopting the layout stored in its header
    pub fn open_existing(&self, domain: &str, topic: &str) -> Result<SegmentHandle> {
        self.open(domain, topic, None)
    }

    /// Detach a handle; the last detach of a non-persistent segment removes it
    pub fn close(&self, handle: SegmentHandle) -> Result<()> {
        let path = handle.path().to_path_buf();
        handle.close();
        self.prune(&path);
        Ok(())
    }

    /// Unlink a segment nobody is attached to.
    ///
    /// Corrupted segments and segments abandoned during initialization are
    /// removed regardless of their attachment count. Returns `false` when
    /// there was no segment.
    pub fn remove(&self, domain: &str, topic: &str) -> Result<bool> {
        validate_name("domain", domain)?;
        validate_name("topic", topic)?;

        let path = self.segment_path(domain, topic);
        let label = format!("{}/{}", domain, topic);

        let region = match ReadOnlyRegion::open(&path, size_of::<SegmentHeader>()) {
            Ok(Some(region)) => Some(region),
            Ok(None) if !path.exists() => return Ok(false),
            Ok(None) => None,
            Err(e) => return Err(e),
        };

        if let Some(region) = &region {
            let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
            let attached = header.attached.load(Ordering::Acquire);
            let removable = match header.state() {
                SegmentState::Corrupted => true,
                SegmentState::Initializing | SegmentState::Uninitialized => {
                    !process_alive(header.creator_pid)
                }
                _ => attached == 0,
            };
            if !removable {
                return Err(SeuratError::invalid_parameter(
                    "topic",
                    format!("Segment {} still has {} attachments", label, attached),
                ));
            }
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to remove segment file")),
        }
        let _ = std::fs::remove_dir(domain_dir(&self.root, domain));
        self.forget(&path);

        info!("Removed segment {}", label);
        Ok(true)
    }

    fn open(
        &self,
        domain: &str,
        topic: &str,
        config: Option<&SegmentConfig>,
    ) -> Result<SegmentHandle> {
        validate_name("domain", domain)?;
        validate_name("topic", topic)?;

        let path = self.segment_path(domain, topic);
        let label = format!("{}/{}", domain, topic);
        let layout = config.map(|c| c.layout()).transpose()?;
        let deadline = Instant::now() + self.creation_timeout;

        loop {
            if let Some(segment) = self.cached(&path) {
                if let Some(config) = config {
                    config.check_compatible(&label, segment.header())?;
                }
                if attach(&segment)? {
                    return Ok(SegmentHandle::new(segment));
                }
                self.forget(&path);
            }

            if let (Some(config), Some(layout)) = (config, layout) {
                if let Some(segment) = self.try_create(domain, topic, config, layout, &path)? {
                    return Ok(self.register(&path, segment));
                }
            }

            match self.inspect(domain, &path, &label, config)? {
                Attempt::Attached(segment) => {
                    debug!("Attached to segment {}", label);
                    return Ok(self.register(&path, segment));
                }
                Attempt::Missing if config.is_none() => {
                    return Err(SeuratError::invalid_parameter(
                        "topic",
                        format!("Segment {} does not exist", label),
                    ));
                }
                Attempt::Missing => continue,
                Attempt::Stale { inode } => {
                    warn!("Removing segment {} abandoned by its creator", label);
                    remove_if_same(&path, inode);
                    continue;
                }
                Attempt::Pending | Attempt::Destroying => {
                    if Instant::now() >= deadline {
                        return Err(SeuratError::timeout(
                            format!("waiting for segment {} to become ready", label),
                            self.creation_timeout,
                        ));
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// Segments currently mapped through this manager
    pub(crate) fn live_segments(&self) -> Vec<Arc<Segment>> {
        match self.segments.read() {
            Ok(segments) => segments
                .values()
                .filter_map(Weak::upgrade)
                .filter(|segment| segment.region_linked())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn cached(&self, path: &Path) -> Option<Arc<Segment>> {
        let segments = self.segments.read().ok()?;
        let segment = segments.get(path)?.upgrade()?;
        if segment.region_linked() {
            Some(segment)
        } else {
            None
        }
    }

    fn register(&self, path: &Path, segment: Arc<Segment>) -> SegmentHandle {
        if let Ok(mut segments) = self.segments.write() {
            segments.retain(|_, weak| weak.strong_count() > 0);
            segments.insert(path.to_path_buf(), Arc::downgrade(&segment));
        }
        SegmentHandle::new(segment)
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut segments) = self.segments.write() {
            segments.remove(path);
        }
    }

    fn prune(&self, path: &Path) {
        if let Ok(mut segments) = self.segments.write() {
            if segments.get(path).map_or(false, |weak| weak.strong_count() == 0) {
                segments.remove(path);
            }
        }
    }

    /// Exclusively create and initialize the segment; `None` when the file
    /// already exists
    fn try_create(
        &self,
        domain: &str,
        topic: &str,
        config: &SegmentConfig,
        layout: SegmentLayout,
        path: &Path,
    ) -> Result<Option<Arc<Segment>>> {
        let info = StaticInfo {
            domain: domain.to_string(),
            topic: topic.to_string(),
            type_descriptor: config.type_descriptor.clone(),
            created_by: current_pid(),
            created_at_nanos: now_nanos(),
            persistent: config.persistent,
        };
        let (info_bytes, info_crc) = info.encode()?;

        let dir = domain_dir(&self.root, domain);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SeuratError::from_io(e, "Failed to create domain directory"))?;

        let region = match SharedMemoryRegion::create(path, layout.total_size)? {
            Some(region) => region,
            None => return Ok(None),
        };

        let params = HeaderParams {
            pattern: config.pattern,
            flags: config.flags(),
            type_size: config.type_descriptor.size,
            type_align: config.type_descriptor.align,
            payload_size: config.payload_size as u32,
            schema_hash: config.type_descriptor.schema_hash,
            slot_count: config.slot_count as u32,
            max_publishers: config.max_publishers as u32,
            max_subscribers: config.max_subscribers as u32,
            queue_capacity: config.queue_capacity as u32,
            event_capacity: config.event_capacity as u32,
            total_size: layout.total_size as u64,
            created_at: info.created_at_nanos,
            static_info_len: info_bytes.len() as u32,
            static_info_crc: info_crc,
        };

        unsafe {
            let base = region.as_ptr();
            SegmentHeader::initialize(base as *mut SegmentHeader, &params);
            std::ptr::copy_nonoverlapping(
                info_bytes.as_ptr(),
                base.add(layout.static_info_offset),
                info_bytes.len(),
            );
        }

        let segment = match Segment::new(region, layout, info, dir) {
            Ok(segment) => segment,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };

        unsafe {
            segment.pool().init();
        }
        if config.queue_capacity > 0 {
            for sub in 0..config.max_subscribers {
                match segment.queue(sub) {
                    Ok(queue) => unsafe { queue.init() },
                    Err(e) => {
                        let _ = std::fs::remove_file(path);
                        return Err(e);
                    }
                }
            }
        }

        let header = segment.header();
        header.attached.store(1, Ordering::Relaxed);
        header
            .state
            .store(SegmentState::Ready.as_raw(), Ordering::Release);

        info!(
            "Created {} segment {} ({} bytes, {} slots of {} bytes)",
            config.pattern.name(),
            segment.name(),
            layout.total_size,
            config.slot_count,
            config.payload_size
        );
        Ok(Some(Arc::new(segment)))
    }

    /// Inspect the file at `path` once and attach when it is ready
    fn inspect(
        &self,
        domain: &str,
        path: &Path,
        label: &str,
        config: Option<&SegmentConfig>,
    ) -> Result<Attempt> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Attempt::Missing),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to stat segment file")),
        };

        let abandoned = metadata
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map_or(false, |age| age > self.creation_timeout);

        let region = match SharedMemoryRegion::open(path, size_of::<SegmentHeader>())? {
            Some(region) => region,
            None if abandoned => return Ok(Attempt::Stale { inode: metadata.ino() }),
            None => return Ok(Attempt::Pending),
        };

        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        match header.state() {
            SegmentState::Ready => {}
            SegmentState::Destroying => return Ok(Attempt::Destroying),
            SegmentState::Corrupted => {
                return Err(SeuratError::corrupted(format!(
                    "Segment {} is marked corrupted",
                    label
                )))
            }
            SegmentState::Uninitialized if abandoned => {
                return Ok(Attempt::Stale { inode: region.inode() })
            }
            SegmentState::Uninitialized => return Ok(Attempt::Pending),
            SegmentState::Initializing => {
                let creator = header.creator_pid;
                if creator != 0 && !process_alive(creator) {
                    return Ok(Attempt::Stale { inode: region.inode() });
                }
                return Ok(Attempt::Pending);
            }
        }

        if header.magic != SEGMENT_MAGIC || header.layout_version != LAYOUT_VERSION {
            return Err(SeuratError::incompatible(
                label,
                format!(
                    "Unknown segment format (magic {:#x}, version {})",
                    header.magic, header.layout_version
                ),
            ));
        }

        if let Some(config) = config {
            config.check_compatible(label, header)?;
        }

        let layout = SegmentLayout::from_header(header)?;
        let info = read_static_info(&region, header, &layout)?;
        let segment = Arc::new(Segment::new(
            region,
            layout,
            info,
            domain_dir(&self.root, domain),
        )?);

        if attach(&segment)? {
            Ok(Attempt::Attached(segment))
        } else {
            Ok(Attempt::Destroying)
        }
    }
}

impl Default for SegmentManager {
    fn default() -> Self {
        Self::new(default_root(), DEFAULT_CREATION_TIMEOUT)
    }
}

/// Count one more attachment. Returns `false` when the segment is being
/// destroyed and the caller must retry from the file system.
fn attach(segment: &Segment) -> Result<bool> {
    let header = segment.header();
    header.attached.fetch_add(1, Ordering::AcqRel);

    match header.state() {
        SegmentState::Ready => Ok(true),
        SegmentState::Corrupted => {
            header.attached.fetch_sub(1, Ordering::AcqRel);
            Err(SeuratError::corrupted(format!(
                "Segment {} is marked corrupted",
                segment.name()
            )))
        }
        _ => {
            header.attached.fetch_sub(1, Ordering::AcqRel);
            Ok(false)
        }
    }
}

fn read_static_info(
    region: &SharedMemoryRegion,
    header: &SegmentHeader,
    layout: &SegmentLayout,
) -> Result<StaticInfo> {
    let len = header.static_info_len as usize;
    if len > STATIC_INFO_CAPACITY || layout.static_info_offset + len > region.size() {
        return Err(SeuratError::corrupted("Static info length out of range"));
    }
    let bytes = unsafe {
        std::slice::from_raw_parts(region.as_ptr().add(layout.static_info_offset), len)
    };
    StaticInfo::decode(bytes, header.static_info_crc)
}

/// Remove `path` only if it still names the inode we inspected
fn remove_if_same(path: &Path, inode: u64) {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.ino() == inode => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove stale segment {}: {}", path.display(), e);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, layout::MessagingPattern, topic::TypeDescriptor};
    use tempfile::TempDir;

    fn config() -> SegmentConfig {
        SegmentConfig {
            pattern: MessagingPattern::PublishSubscribe,
            type_descriptor: TypeDescriptor::bytes(),
            payload_size: 128,
            slot_count: 4,
            max_publishers: 2,
            max_subscribers: 2,
            queue_capacity: 4,
            event_capacity: 0,
            persistent: false,
            checksum_payloads: false,
        }
    }

    fn manager(dir: &TempDir) -> SegmentManager {
        SegmentManager::new(dir.path(), Duration::from_millis(200))
    }

    #[test]
    fn test_create_then_attach() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.open_or_create("d", "t", &config()).unwrap();
        let second = manager.open_or_create("d", "t", &config()).unwrap();
        assert_eq!(first.header().attached.load(Ordering::Relaxed), 2);
        assert_eq!(first.header().state(), SegmentState::Ready);
        assert_eq!(second.info().topic, "t");
        assert_eq!(first.pool().stats().free, 4);
    }

    #[test]
    fn test_last_close_unlinks() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let handle = manager.open_or_create("d", "t", &config()).unwrap();
        let path = handle.path().to_path_buf();
        assert!(path.exists());

        manager.close(handle).unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("d").exists());
    }

    #[test]
    fn test_persistent_survives_and_can_be_removed() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let config = SegmentConfig {
            persistent: true,
            ..config()
        };

        let handle = manager.open_or_create("d", "t", &config).unwrap();
        let path = handle.path().to_path_buf();
        drop(handle);
        assert!(path.exists());

        let reopened = manager.open_existing("d", "t").unwrap();
        assert!(reopened.header().is_persistent());
        assert!(manager.remove("d", "t").is_err());
        drop(reopened);

        assert!(manager.remove("d", "t").unwrap());
        assert!(!path.exists());
        assert!(!manager.remove("d", "t").unwrap());
    }

    #[test]
    fn test_incompatible_layout() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let _handle = manager.open_or_create("d", "t", &config()).unwrap();

        let other = SegmentConfig {
            slot_count: 8,
            ..config()
        };
        let err = manager.open_or_create("d", "t", &other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);

        let other = SegmentConfig {
            type_descriptor: TypeDescriptor::custom("Pose", 8, 8),
            ..config()
        };
        let err = SegmentManager::new(dir.path(), Duration::from_millis(200))
            .open_or_create("d", "t", &other)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);
    }

    #[test]
    fn test_messaging_pattern_mismatch() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let _topic = manager.open_or_create("d", "t", &config()).unwrap();

        let event = SegmentConfig {
            pattern: MessagingPattern::Event,
            ..config()
        };
        let err = manager.open_or_create("d", "t", &event).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);
        assert!(err.to_string().contains("publish-subscribe"));
    }

    #[test]
    fn test_event_service_accepts_smaller_requests() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let event = SegmentConfig {
            pattern: MessagingPattern::Event,
            payload_size: 0,
            slot_count: 0,
            queue_capacity: 0,
            max_publishers: 4,
            max_subscribers: 4,
            event_capacity: 16,
            ..config()
        };
        let _created = manager.open_or_create("d", "e", &event).unwrap();

        let smaller = SegmentConfig {
            max_subscribers: 2,
            event_capacity: 8,
            ..event.clone()
        };
        assert!(manager.open_or_create("d", "e", &smaller).is_ok());

        let larger = SegmentConfig {
            max_publishers: 5,
            ..event
        };
        let err = manager.open_or_create("d", "e", &larger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);
    }

    #[test]
    fn test_open_existing_missing() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir).open_existing("d", "nothing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_corrupted_segment_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let handle = manager.open_or_create("d", "t", &config()).unwrap();
        handle.header().mark_corrupted();

        let err = SegmentManager::new(dir.path(), Duration::from_millis(200))
            .open_or_create("d", "t", &config())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);

        drop(handle);
        assert!(manager.remove("d", "t").unwrap());
        assert!(manager.open_or_create("d", "t", &config()).is_ok());
    }

    #[test]
    fn test_pending_creator_times_out() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), "d", "t");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        // Simulate a live creator stuck in initialization.
        let region = SharedMemoryRegion::create(&path, 4096).unwrap().unwrap();
        unsafe {
            std::ptr::addr_of_mut!((*(region.as_ptr() as *mut SegmentHeader)).creator_pid)
                .write(current_pid());
        }
        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        header
            .state
            .store(SegmentState::Initializing.as_raw(), Ordering::Release);

        let manager = SegmentManager::new(dir.path(), Duration::from_millis(50));
        let err = manager.open_or_create("d", "t", &config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_dead_creator_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), "d", "t");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let region = SharedMemoryRegion::create(&path, 4096).unwrap().unwrap();
        unsafe {
            std::ptr::addr_of_mut!((*(region.as_ptr() as *mut SegmentHeader)).creator_pid)
                .write(dead_pid);
        }
        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        header
            .state
            .store(SegmentState::Initializing.as_raw(), Ordering::Release);
        drop(region);

        let handle = manager(&dir).open_or_create("d", "t", &config()).unwrap();
        assert_eq!(handle.header().state(), SegmentState::Ready);
        assert_eq!(handle.header().creator_pid, current_pid());
    }

    #[test]
    fn test_concurrent_creation_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let manager = SegmentManager::new(root, Duration::from_secs(2));
                    barrier.wait();
                    let handle = manager.open_or_create("race", "t", &config()).unwrap();
                    let created_at = handle.header().created_at;
                    (manager, handle, created_at)
                })
            })
            .collect();
        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let first = handles[0].2;
        assert!(handles.iter().all(|(_, _, created)| *created == first));
        assert_eq!(handles[0].1.header().attached.load(Ordering::Relaxed), 8);
    }
}
