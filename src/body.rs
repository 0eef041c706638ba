//! Typed content bodies
//!
//! A node's body is a tagged union keyed by the node type. Lesson bodies are
//! an ordered list of chunks, each holding content items with stable ids;
//! interaction events refer to those ids.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::NodeType;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeBody {
    Module(ModuleBody),
    Lesson(LessonBody),
    Exercise(ExerciseBody),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lesson_refs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

/// Exercise bodies are open-ended; everything besides the description is
/// kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseBody {
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Note,
    Question,
    Flashcard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text(TextItem),
    Title(TitleItem),
    Quote(QuoteItem),
    Quiz(QuizItem),
    Question(QuestionItem),
    Flashcard(FlashcardItem),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub title_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteItem {
    pub id: String,
    pub quote_type: String,
    #[serde(default)]
    pub title: String,
    pub quote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizItem {
    pub id: String,
    pub question: String,
    pub options: Vec<QuizOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOption {
    pub option: String,
    pub is_answer: bool,
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub correction_criteria: Vec<CorrectionCriterion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionCriterion {
    pub answer: String,
    pub points: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardItem {
    pub id: String,
    pub front: String,
    pub back: String,
}

impl ContentItem {
    pub fn id(&self) -> &str {
        match self {
            ContentItem::Text(item) => &item.id,
            ContentItem::Title(item) => &item.id,
            ContentItem::Quote(item) => &item.id,
            ContentItem::Quiz(item) => &item.id,
            ContentItem::Question(item) => &item.id,
            ContentItem::Flashcard(item) => &item.id,
        }
    }
}

impl LessonBody {
    /// All content items across chunks, in document order
    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.chunks.iter().flat_map(|chunk| chunk.content.iter())
    }

    pub fn find_item(&self, item_id: &str) -> Option<&ContentItem> {
        self.items().find(|item| item.id() == item_id)
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.title.trim().is_empty() {
            return Err(StorageError::BadRequest("lesson title is required".into()));
        }

        let mut chunk_ids = HashSet::new();
        let mut item_ids = HashSet::new();
        for chunk in &self.chunks {
            if chunk.id.is_empty() {
                return Err(StorageError::BadRequest("chunk id is required".into()));
            }
            if !chunk_ids.insert(chunk.id.as_str()) {
                return Err(StorageError::BadRequest(format!(
                    "duplicate chunk id '{}'",
                    chunk.id
                )));
            }

            for item in &chunk.content {
                if item.id().is_empty() {
                    return Err(StorageError::BadRequest(format!(
                        "content item without id in chunk '{}'",
                        chunk.id
                    )));
                }
                if !item_ids.insert(item.id()) {
                    return Err(StorageError::BadRequest(format!(
                        "duplicate content item id '{}'",
                        item.id()
                    )));
                }
                if let ContentItem::Quiz(quiz) = item {
                    if quiz.options.is_empty() {
                        return Err(StorageError::BadRequest(format!(
                            "quiz '{}' has no options",
                            quiz.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

impl NodeBody {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeBody::Module(_) => NodeType::Module,
            NodeBody::Lesson(_) => NodeType::Lesson,
            NodeBody::Exercise(_) => NodeType::Exercise,
        }
    }

    pub fn as_lesson(&self) -> Option<&LessonBody> {
        match self {
            NodeBody::Lesson(lesson) => Some(lesson),
            _ => None,
        }
    }

    /// Check the body's structural constraints, failing on the first one violated
    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            NodeBody::Module(module) => {
                if module.title.trim().is_empty() {
                    return Err(StorageError::BadRequest("module title is required".into()));
                }
                Ok(())
            }
            NodeBody::Lesson(lesson) => lesson.validate(),
            NodeBody::Exercise(_) => Ok(()),
        }
    }

    /// Shallow-merge `patch` into this body: top-level keys in the patch
    /// replace existing ones. The body type cannot change.
    pub fn merge_patch(&self, patch: &Map<String, Value>) -> Result<NodeBody, StorageError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| StorageError::Internal(format!("Body encode failed: {}", e)))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| StorageError::Internal("Body is not a JSON object".into()))?;

        if let Some(tag) = patch.get("type") {
            if tag.as_str() != Some(self.node_type().as_str()) {
                return Err(StorageError::BadRequest(format!(
                    "body type cannot change from {}",
                    self.node_type()
                )));
            }
        }

        for (key, val) in patch {
            object.insert(key.clone(), val.clone());
        }

        let merged: NodeBody = serde_json::from_value(value)
            .map_err(|e| StorageError::BadRequest(format!("invalid body patch: {}", e)))?;
        merged.validate()?;
        Ok(merged)
    }
}

impl From<ModuleBody> for NodeBody {
    fn from(body: ModuleBody) -> Self {
        NodeBody::Module(body)
    }
}

impl From<LessonBody> for NodeBody {
    fn from(body: LessonBody) -> Self {
        NodeBody::Lesson(body)
    }
}

impl From<ExerciseBody> for NodeBody {
    fn from(body: ExerciseBody) -> Self {
        NodeBody::Exercise(body)
    }
}
