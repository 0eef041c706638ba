//! Persisted model types
//!
//! Enumerations are stored as their SCREAMING_SNAKE_CASE names in TEXT
//! columns, timestamps as chrono `DateTime<Utc>`, JSON documents as TEXT.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::body::NodeBody;

/// Free-form node metadata
pub type Metadata = serde_json::Map<String, Value>;

/// Format version written into every interaction log
pub const INTERACTION_LOG_VERSION: &str = "1.0";

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum! {
    /// Kind of content node
    pub enum NodeType {
        Module => "MODULE",
        Lesson => "LESSON",
        Exercise => "EXERCISE",
    }
}

text_enum! {
    /// Lifecycle status. Ordered: DRAFT < CREATED < ARCHIVED.
    #[derive(PartialOrd, Ord)]
    pub enum NodeStatus {
        Draft => "DRAFT",
        Created => "CREATED",
        Archived => "ARCHIVED",
    }
}

text_enum! {
    pub enum LinkType {
        Dependency => "DEPENDENCY",
        Reference => "REFERENCE",
        RelatesTo => "RELATES_TO",
        Extends => "EXTENDS",
    }
}

text_enum! {
    /// Access level. Totally ordered: VIEW < INTERACT < EDIT < ADMIN.
    #[derive(PartialOrd, Ord)]
    pub enum PermissionLevel {
        View => "VIEW",
        Interact => "INTERACT",
        Edit => "EDIT",
        Admin => "ADMIN",
    }
}

text_enum! {
    pub enum PrincipalKind {
        User => "USER",
        Group => "GROUP",
    }
}

text_enum! {
    #[derive(PartialOrd, Ord)]
    pub enum GroupRole {
        Member => "MEMBER",
        Admin => "ADMIN",
    }
}

text_enum! {
    /// Interaction event types understood by the platform
    pub enum EventType {
        QuizAnswer => "QUIZ_ANSWER",
        QuestionSubmit => "QUESTION_SUBMIT",
    }
}

impl EventType {
    /// Payload key naming the content item an event targets
    pub fn target_key(&self) -> &'static str {
        match self {
            EventType::QuizAnswer => "quizId",
            EventType::QuestionSubmit => "questionId",
        }
    }
}

// ============================================================================
// Content graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub body: NodeBody,
    pub metadata: Metadata,
    pub owner_id: String,
    pub is_public: bool,
    pub default_permission: Option<PermissionLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentNode {
    /// Build a fresh DRAFT node owned by `owner_id`
    pub fn new(body: NodeBody, metadata: Metadata, owner_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_type: body.node_type(),
            status: NodeStatus::Draft,
            body,
            metadata,
            owner_id: owner_id.to_string(),
            is_public: false,
            default_permission: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Directed typed edge. `source_type` records the kind of `from_id`, so the
/// owning module and owning lesson of a node are told apart by type rather
/// than by link order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLink {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub link_type: LinkType,
    pub source_type: NodeType,
    pub created_at: DateTime<Utc>,
}

impl ContentLink {
    pub fn new(from: &ContentNode, to_id: &str, link_type: LinkType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_id: from.id.clone(),
            to_id: to_id.to_string(),
            link_type,
            source_type: from.node_type,
            created_at: Utc::now(),
        }
    }

    pub fn is_module_owner(&self) -> bool {
        self.link_type == LinkType::Dependency && self.source_type == NodeType::Module
    }

    pub fn is_lesson_owner(&self) -> bool {
        self.link_type == LinkType::Dependency && self.source_type == NodeType::Lesson
    }
}

// ============================================================================
// Permissions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Principal {
    User(String),
    Group(String),
}

impl Principal {
    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::User(_) => PrincipalKind::User,
            Principal::Group(_) => PrincipalKind::Group,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Principal::User(id) | Principal::Group(id) => id,
        }
    }

    pub fn from_parts(kind: PrincipalKind, id: String) -> Self {
        match kind {
            PrincipalKind::User => Principal::User(id),
            PrincipalKind::Group => Principal::Group(id),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Explicit grant on a content node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub content_node_id: String,
    pub principal: Principal,
    pub level: PermissionLevel,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Permission {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
}

// ============================================================================
// Interactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Content item id this event refers to
    pub fn target_item_id(&self) -> Option<&str> {
        self.payload
            .get(self.event_type.target_key())
            .and_then(Value::as_str)
    }
}

/// Append-only history of one user's interactions with one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionLog {
    #[serde(skip)]
    pub id: String,
    pub node_id: String,
    pub user_id: String,
    pub version: String,
    pub events: Vec<InteractionEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InteractionLog {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events_for_item<'a>(
        &'a self,
        item_id: &'a str,
    ) -> impl Iterator<Item = &'a InteractionEvent> + 'a {
        self.events
            .iter()
            .filter(move |event| event.target_item_id() == Some(item_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(PermissionLevel::View < PermissionLevel::Interact);
        assert!(PermissionLevel::Interact < PermissionLevel::Edit);
        assert!(PermissionLevel::Edit < PermissionLevel::Admin);
        assert_eq!(
            PermissionLevel::ALL.iter().max(),
            Some(&PermissionLevel::Admin)
        );
    }

    #[test]
    fn test_text_enum_round_trip() {
        for link_type in LinkType::ALL {
            assert_eq!(link_type.as_str().parse::<LinkType>().unwrap(), *link_type);
        }
        assert!("PUBLISHED".parse::<NodeStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&EventType::QuizAnswer).unwrap(),
            "\"QUIZ_ANSWER\""
        );
    }

    #[test]
    fn test_principal_serialization() {
        let principal = Principal::Group("g-1".into());
        assert_eq!(
            serde_json::to_value(&principal).unwrap(),
            serde_json::json!({"kind": "GROUP", "id": "g-1"})
        );
        assert_eq!(principal.to_string(), "GROUP:g-1");
    }

    #[test]
    fn test_permission_expiry() {
        let now = Utc::now();
        let mut grant = Permission {
            id: "p".into(),
            content_node_id: "n".into(),
            principal: Principal::User("u".into()),
            level: PermissionLevel::View,
            granted_by: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(grant.is_active_at(now));

        grant.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!grant.is_active_at(now));
    }

    #[test]
    fn test_events_for_item() {
        let now = Utc::now();
        let log = InteractionLog {
            id: "log".into(),
            node_id: "n".into(),
            user_id: "u".into(),
            version: INTERACTION_LOG_VERSION.into(),
            events: vec![
                InteractionEvent::new(EventType::QuizAnswer, serde_json::json!({"quizId": "q1"})),
                InteractionEvent::new(
                    EventType::QuestionSubmit,
                    serde_json::json!({"questionId": "q2"}),
                ),
                InteractionEvent::new(EventType::QuizAnswer, serde_json::json!({"quizId": "q1"})),
            ],
            created_at: now,
            updated_at: now,
        };

        assert_eq!(log.events_for_item("q1").count(), 2);
        assert_eq!(log.events_for_item("q2").count(), 1);
        assert_eq!(log.events_for_item("q3").count(), 0);
    }
}
