//! Per-connection configuration.

use std::sync::Arc;

use crate::codec::MAX_PACKET_COLLECTION;
use crate::logging::{ConnectionLogger, TracingLogger};
use crate::timer::TimerConfig;

/// Configuration for one [`crate::Connection`].
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Label used in log entries, usually the peer address.
    pub peer: Arc<str>,
    pub timer: TimerConfig,
    /// DATA frames gathered before the sequence engine runs. Capped at
    /// `MAX_PACKET_COLLECTION`.
    pub collection_limit: usize,
    pub logger: Option<Arc<dyn ConnectionLogger>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            peer: Arc::from("peer"),
            timer: TimerConfig::default(),
            collection_limit: MAX_PACKET_COLLECTION,
            logger: Some(Arc::new(TracingLogger)),
        }
    }
}

impl ConnectionConfig {
    pub fn with_peer(mut self, peer: impl Into<Arc<str>>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_timer(mut self, timer: TimerConfig) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_logger(mut self, logger: Option<Arc<dyn ConnectionLogger>>) -> Self {
        self.logger = logger;
        self
    }

    pub(crate) fn effective_collection_limit(&self) -> usize {
        self.collection_limit.clamp(1, MAX_PACKET_COLLECTION)
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("peer", &self.peer)
            .field("timer", &self.timer)
            .field("collection_limit", &self.collection_limit)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}
