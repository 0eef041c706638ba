//! Event bus for content, permission and interaction changes
//!
//! Services emit a [`StorageEvent`] after each successful mutation. Nothing
//! in the crate depends on delivery; the bus exists for audit logging and for
//! embedders that want to react to changes.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::models::{EventType, NodeStatus, NodeType, PermissionLevel, Principal};

/// Events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    // Content events
    NodeCreated {
        id: String,
        node_type: NodeType,
        owner_id: String,
    },
    NodeUpdated {
        id: String,
        status: NodeStatus,
    },
    ModulePublished {
        id: String,
        node_count: usize,
    },
    LessonsReplaced {
        module_id: String,
        archived: Vec<String>,
        created: Vec<String>,
    },

    // Permission events
    PermissionGranted {
        node_id: String,
        principal: Principal,
        level: PermissionLevel,
    },
    PermissionRevoked {
        node_id: String,
        principal: Principal,
    },
    PermissionUpdated {
        id: String,
        level: PermissionLevel,
    },
    SharingChanged {
        node_id: String,
        is_public: bool,
        default_permission: Option<PermissionLevel>,
    },

    // Group events
    GroupCreated {
        id: String,
        owner_id: String,
    },
    GroupDeleted {
        id: String,
    },
    MemberAdded {
        group_id: String,
        user_id: String,
    },
    MemberRemoved {
        group_id: String,
        user_id: String,
    },

    // Interaction events
    InteractionRecorded {
        node_id: String,
        user_id: String,
        event_type: EventType,
        log_len: usize,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &StorageEvent);
}

/// Broadcast channel for storage events
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: StorageEvent) {
        trace!(event = ?event, "Emitting storage event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes events to the trace log
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::NodeCreated { id, node_type, owner_id } => {
                debug!(id = %id, node_type = %node_type, owner = %owner_id, "Node created");
            }
            StorageEvent::ModulePublished { id, node_count } => {
                info!(id = %id, nodes = node_count, "Module published");
            }
            StorageEvent::PermissionGranted { node_id, principal, level } => {
                info!(node = %node_id, principal = %principal, level = %level, "Permission granted");
            }
            StorageEvent::PermissionRevoked { node_id, principal } => {
                info!(node = %node_id, principal = %principal, "Permission revoked");
            }
            StorageEvent::InteractionRecorded {
                node_id,
                user_id,
                event_type,
                log_len,
            } => {
                debug!(
                    node = %node_id,
                    user = %user_id,
                    event_type = %event_type,
                    log_len,
                    "Interaction recorded"
                );
            }
            _ => {
                trace!(event = ?event, "Storage event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
