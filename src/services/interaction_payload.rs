//! Typed interaction payloads
//!
//! Incoming events arrive as `{type, payload}` with a free-form payload. They
//! are parsed into a typed [`EventPayload`] and checked before anything looks
//! at the content they target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::EventType;
use crate::error::StorageError;

/// Raw event as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventInput {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAnswerPayload {
    pub quiz_id: String,
    pub selected_option_index: usize,
    pub is_correct: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub is_correct: bool,
    pub explanation: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSubmitPayload {
    pub question_id: String,
    pub user_answer: String,
    pub score: f64,
    pub max_score: f64,
    pub is_correct: bool,
    #[serde(default)]
    pub feedback_items: Vec<FeedbackItem>,
    pub timestamp: DateTime<Utc>,
}

/// A structurally valid event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    QuizAnswer(QuizAnswerPayload),
    QuestionSubmit(QuestionSubmitPayload),
}

impl EventPayload {
    /// Parse and validate a raw event. Unknown types and malformed payloads
    /// are `BadRequest`.
    pub fn parse(input: &EventInput) -> Result<Self, StorageError> {
        let event_type: EventType = input.event_type.parse().map_err(|_| {
            StorageError::BadRequest(format!("unknown event type '{}'", input.event_type))
        })?;

        let payload = match event_type {
            EventType::QuizAnswer => EventPayload::QuizAnswer(decode(event_type, &input.payload)?),
            EventType::QuestionSubmit => {
                EventPayload::QuestionSubmit(decode(event_type, &input.payload)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::QuizAnswer(_) => EventType::QuizAnswer,
            EventPayload::QuestionSubmit(_) => EventType::QuestionSubmit,
        }
    }

    /// Id of the lesson content item the event refers to
    pub fn target_item_id(&self) -> &str {
        match self {
            EventPayload::QuizAnswer(p) => &p.quiz_id,
            EventPayload::QuestionSubmit(p) => &p.question_id,
        }
    }

    pub fn to_value(&self) -> Result<Value, StorageError> {
        let value = match self {
            EventPayload::QuizAnswer(p) => serde_json::to_value(p),
            EventPayload::QuestionSubmit(p) => serde_json::to_value(p),
        };
        value.map_err(|e| StorageError::Internal(format!("Payload encode failed: {}", e)))
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.target_item_id().trim().is_empty() {
            return Err(StorageError::BadRequest(format!(
                "{} payload is missing {}",
                self.event_type(),
                self.event_type().target_key()
            )));
        }

        if let EventPayload::QuestionSubmit(p) = self {
            let finite = p.score.is_finite()
                && p.max_score.is_finite()
                && p.feedback_items.iter().all(|item| item.points.is_finite());
            if !finite || p.score < 0.0 || p.max_score < 0.0 {
                return Err(StorageError::BadRequest(
                    "scores must be finite and non-negative".into(),
                ));
            }
            if p.score > p.max_score {
                return Err(StorageError::BadRequest(format!(
                    "score {} exceeds maxScore {}",
                    p.score, p.max_score
                )));
            }
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    event_type: EventType,
    payload: &Value,
) -> Result<T, StorageError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| StorageError::BadRequest(format!("invalid {} payload: {}", event_type, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quiz_answer() {
        let input = EventInput::new(
            "QUIZ_ANSWER",
            json!({
                "quizId": "q1",
                "selectedOptionIndex": 0,
                "isCorrect": true,
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        );

        let payload = EventPayload::parse(&input).unwrap();
        assert_eq!(payload.event_type(), EventType::QuizAnswer);
        assert_eq!(payload.target_item_id(), "q1");
        assert_eq!(payload.to_value().unwrap()["quizId"], json!("q1"));
    }

    #[test]
    fn test_parse_question_submit() {
        let input = EventInput::new(
            "QUESTION_SUBMIT",
            json!({
                "questionId": "q2",
                "userAnswer": "level by level",
                "score": 2.0,
                "maxScore": 3.0,
                "isCorrect": false,
                "feedbackItems": [
                    {"isCorrect": true, "explanation": "mentions levels", "points": 2.0}
                ],
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        );

        match EventPayload::parse(&input).unwrap() {
            EventPayload::QuestionSubmit(p) => {
                assert_eq!(p.question_id, "q2");
                assert_eq!(p.feedback_items.len(), 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let input = EventInput::new("FLASHCARD_FLIP", json!({}));
        let err = EventPayload::parse(&input).unwrap_err();
        assert_eq!(err, StorageError::BadRequest("unknown event type 'FLASHCARD_FLIP'".into()));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let missing_field = EventInput::new("QUIZ_ANSWER", json!({"quizId": "q1"}));
        assert_eq!(EventPayload::parse(&missing_field).unwrap_err().code(), "bad_request");

        let empty_id = EventInput::new(
            "QUIZ_ANSWER",
            json!({
                "quizId": "",
                "selectedOptionIndex": 0,
                "isCorrect": true,
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        );
        assert_eq!(EventPayload::parse(&empty_id).unwrap_err().code(), "bad_request");

        let over_max = EventInput::new(
            "QUESTION_SUBMIT",
            json!({
                "questionId": "q2",
                "userAnswer": "x",
                "score": 4.0,
                "maxScore": 3.0,
                "isCorrect": true,
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        );
        assert_eq!(EventPayload::parse(&over_max).unwrap_err().code(), "bad_request");
    }
}
