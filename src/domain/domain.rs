//! Domain handle: the entry point for endpoints, discovery and sweeps

use std::{path::Path, sync::Arc};

use log::{debug, info};

use crate::{
    discovery::{Discovery, TopicInfo},
    endpoint::{Publisher, Subscriber},
    error::{Result, SeuratError},
    event::{EventConfig, Listener, Notifier},
    liveness::{sweep_segment, LivenessMonitor, SweepReport},
    memory::{domain_dir, topic_from_path, SegmentManager},
    topic::{validate_name, TopicConfig},
};

use super::config::DomainConfig;

/// A named isolation boundary holding topics and event services.
///
/// Endpoints connected through one domain handle share segment mappings.
#[derive(Debug)]
pub struct Domain {
    config: DomainConfig,
    segments: Arc<SegmentManager>,
}

impl Domain {
    /// Open a domain; its directory is created with the first topic
    pub fn open(config: DomainConfig) -> Result<Self> {
        config.validate()?;
        let segments = Arc::new(SegmentManager::new(
            config.root_dir.clone(),
            config.creation_timeout,
        ));
        debug!(
            "Opened domain {} below {}",
            config.name,
            config.root_dir.display()
        );
        Ok(Self { config, segments })
    }

    /// Open `name` below the default root
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        Self::open(DomainConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root_dir
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    /// Connect a publisher to a topic of this domain
    pub fn publisher(&self, config: TopicConfig) -> Result<Publisher> {
        Publisher::connect(self, config)
    }

    /// Connect a subscriber to a topic of this domain
    pub fn subscriber(&self, config: TopicConfig) -> Result<Subscriber> {
        Subscriber::connect(self, config)
    }

    /// Connect a notifier to an event service of this domain
    pub fn notifier(&self, config: EventConfig) -> Result<Notifier> {
        Notifier::connect(self, config)
    }

    /// Connect a listener to an event service of this domain
    pub fn listener(&self, config: EventConfig) -> Result<Listener> {
        Listener::connect(self, config)
    }

    /// Discovery over this domain's root, using the domain's heartbeat
    /// threshold
    pub fn discovery(&self) -> Discovery {
        Discovery::new(self.config.root_dir.clone())
            .with_heartbeat_timeout(self.config.heartbeat_timeout)
    }

    /// Ready topics of this domain
    pub fn topics(&self) -> Result<Vec<TopicInfo>> {
        self.discovery().list_topics(&self.config.name)
    }

    /// Sweep every topic of the domain for endpoints of dead processes
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        let dir = domain_dir(&self.config.root_dir, &self.config.name);

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(total),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to list domain")),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let topic = match topic_from_path(&entry.path()) {
                Some(topic) => topic,
                None => continue,
            };
            match self.sweep_topic(&topic) {
                Ok(report) => total.merge(&report),
                Err(e) => debug!("Not sweeping {}/{}: {}", self.config.name, topic, e),
            }
        }

        if total.endpoints_reclaimed() > 0 {
            info!(
                "Sweep of domain {} reclaimed {} endpoints and {} slots",
                self.config.name,
                total.endpoints_reclaimed(),
                total.slots_reclaimed
            );
        }
        Ok(total)
    }

    /// Sweep one topic. Attaching briefly means a segment left behind only by
    /// dead processes is removed when the sweep detaches.
    pub fn sweep_topic(&self, topic: &str) -> Result<SweepReport> {
        validate_name("topic", topic)?;
        let handle = self.segments.open_existing(&self.config.name, topic)?;
        let report = sweep_segment(&handle, self.config.heartbeat_timeout);
        self.segments.close(handle)?;
        Ok(report)
    }

    /// Remove a topic nobody is attached to, e.g. a persistent one
    pub fn remove_topic(&self, topic: &str) -> Result<bool> {
        self.segments.remove(&self.config.name, topic)
    }

    /// Start the background heartbeat and sweep thread for the segments this
    /// domain handle has open
    pub fn spawn_liveness_monitor(&self) -> Result<LivenessMonitor> {
        LivenessMonitor::spawn(
            Arc::clone(&self.segments),
            self.config.monitor_interval,
            self.config.heartbeat_timeout,
        )
    }
}
