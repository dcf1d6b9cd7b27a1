use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound for text copied into the generation log.
pub const LOG_TEXT_LIMIT: usize = 500;

/// Lifecycle of a review as it moves through the reply pipeline.
///
/// Allowed transitions:
///
/// | from           | to                          |
/// |----------------|-----------------------------|
/// | `UNPROCESSED`  | `InQueue`                   |
/// | `InQueue`      | `PROCESSED`, `InQueueError` |
/// | `InQueueError` | `InQueue` (resend only)     |
///
/// `PROCESSED` is terminal. Reviews the marketplace already reports as
/// answered are ingested straight into `PROCESSED`. A claim into `InQueue`
/// whose message was never published is released back to where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewStatus {
    #[serde(rename = "UNPROCESSED")]
    Unprocessed,
    #[serde(rename = "InQueue")]
    InQueue,
    #[serde(rename = "InQueueError")]
    InQueueError,
    #[serde(rename = "PROCESSED")]
    Processed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Unprocessed => "UNPROCESSED",
            ReviewStatus::InQueue => "InQueue",
            ReviewStatus::InQueueError => "InQueueError",
            ReviewStatus::Processed => "PROCESSED",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "UNPROCESSED" => Some(ReviewStatus::Unprocessed),
            "InQueue" => Some(ReviewStatus::InQueue),
            "InQueueError" => Some(ReviewStatus::InQueueError),
            "PROCESSED" => Some(ReviewStatus::Processed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: ReviewStatus) -> bool {
        matches!(
            (self, next),
            (ReviewStatus::Unprocessed, ReviewStatus::InQueue)
                | (ReviewStatus::InQueue, ReviewStatus::Processed)
                | (ReviewStatus::InQueue, ReviewStatus::InQueueError)
                | (ReviewStatus::InQueueError, ReviewStatus::InQueue)
        )
    }

    pub fn transition(self, next: ReviewStatus) -> Result<ReviewStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal review status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ReviewStatus,
    pub to: ReviewStatus,
}

/// Resumable pagination position. Both halves move together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    last_id: Option<String>,
    last_timestamp: Option<String>,
}

impl Cursor {
    pub fn new(last_id: Option<String>, last_timestamp: Option<String>) -> Self {
        Self {
            last_id: last_id.filter(|v| !v.trim().is_empty()),
            last_timestamp: last_timestamp.filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn last_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    pub fn last_timestamp(&self) -> Option<&str> {
        self.last_timestamp.as_deref()
    }

    /// Returns the advanced cursor, or `None` when neither half changed.
    /// Empty inputs keep the previous value of that half.
    pub fn advance(&self, new_id: Option<&str>, new_timestamp: Option<&str>) -> Option<Cursor> {
        let pick = |current: &Option<String>, candidate: Option<&str>| {
            candidate
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| current.clone())
        };
        let next = Cursor {
            last_id: pick(&self.last_id, new_id),
            last_timestamp: pick(&self.last_timestamp, new_timestamp),
        };
        if next == *self { None } else { Some(next) }
    }
}

/// Time-bounded ownership of a credential. A live lease is the busy flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Marketplace seller (client) id; reviews are keyed by it.
    pub seller_id: String,
    pub ozon_api_key: Option<String>,
    pub gpt_api_key: Option<String>,
    pub gpt_folder: Option<String>,
    /// Cookie string used to read the seller web review list.
    pub session_cookies: Option<String>,
    /// Cookie string used to post replies through the seller web endpoints.
    pub reply_cookies: Option<String>,
    pub is_premium: bool,
    #[serde(default)]
    pub cursor: Cursor,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub disabled: bool,
}

impl Credential {
    pub fn is_busy(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.is_live(now))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub seller_id: String,
    pub sku: i64,
    pub text: String,
    pub rating: i32,
    pub status: ReviewStatus,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub is_rating_participant: Option<bool>,
}

impl Review {
    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub review_id: String,
    pub sku: i64,
    pub product_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub url: String,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub url: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub short_video_preview_url: Option<String>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    #[serde(default)]
    pub is_owner: Option<bool>,
    #[serde(default)]
    pub is_official: Option<bool>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Everything written for one newly ingested review, as one atomic unit.
#[derive(Debug, Clone, Serialize)]
pub struct NewReview {
    pub review: Review,
    pub product: ProductInfo,
    pub photos: Vec<Photo>,
    pub videos: Vec<Video>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedResponse {
    pub review_id: String,
    pub seller_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFilter {
    pub id: String,
    /// Exact rating to match; `None` matches any rating.
    pub rating: Option<i32>,
    /// `Some(true)` needs non-empty text, `Some(false)` needs empty text.
    pub has_text: Option<bool>,
    pub is_active: bool,
}

impl ResponseFilter {
    pub fn matches(&self, review: &Review) -> bool {
        if let Some(rating) = self.rating
            && review.rating != rating
        {
            return false;
        }
        match self.has_text {
            Some(wanted) => review.has_text() == wanted,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Success,
    Error,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessingLogEntry {
    Generation {
        status: GenerationStatus,
        review_text: String,
        response_text: String,
        created_at: DateTime<Utc>,
    },
    Event {
        status: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProcessingLogEntry {
    pub fn generation(status: GenerationStatus, review_text: &str, response_text: &str) -> Self {
        Self::Generation {
            status,
            review_text: truncate_chars(review_text, LOG_TEXT_LIMIT),
            response_text: truncate_chars(response_text, LOG_TEXT_LIMIT),
            created_at: Utc::now(),
        }
    }

    pub fn event(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Event {
            status: status.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub fn truncate_chars(input: &str, limit: usize) -> String {
    match input.char_indices().nth(limit) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(rating: i32, text: &str) -> Review {
        Review {
            id: "r1".into(),
            seller_id: "s1".into(),
            sku: 123,
            text: text.into(),
            rating,
            status: ReviewStatus::Unprocessed,
            published_at: Utc::now(),
            order_status: None,
            is_rating_participant: None,
        }
    }

    #[test]
    fn status_transition_table() {
        use ReviewStatus::*;
        assert!(Unprocessed.can_transition_to(InQueue));
        assert!(InQueue.can_transition_to(Processed));
        assert!(InQueue.can_transition_to(InQueueError));
        assert!(InQueueError.can_transition_to(InQueue));

        assert!(!Unprocessed.can_transition_to(Processed));
        assert!(!Unprocessed.can_transition_to(InQueueError));
        assert!(!Processed.can_transition_to(InQueue));
        assert!(!InQueueError.can_transition_to(Processed));
        assert!(!InQueue.can_transition_to(Unprocessed));

        let err = Processed.transition(Unprocessed).expect_err("terminal");
        assert_eq!(err.from, Processed);
        assert_eq!(err.to, Unprocessed);
    }

    #[test]
    fn status_wire_names_round_trip() {
        for status in [
            ReviewStatus::Unprocessed,
            ReviewStatus::InQueue,
            ReviewStatus::InQueueError,
            ReviewStatus::Processed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(ReviewStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReviewStatus::parse("processed"), None);
    }

    #[test]
    fn cursor_advance_is_all_or_nothing() {
        let cursor = Cursor::new(Some("a".into()), Some("100".into()));
        assert_eq!(cursor.advance(Some("a"), Some("100")), None);
        assert_eq!(cursor.advance(None, None), None);
        assert_eq!(cursor.advance(Some(""), Some("  ")), None);

        let next = cursor.advance(Some("b"), None).expect("id changed");
        assert_eq!(next.last_id(), Some("b"));
        assert_eq!(next.last_timestamp(), Some("100"));
        // the original value is untouched
        assert_eq!(cursor.last_id(), Some("a"));

        let both = cursor.advance(Some("c"), Some("200")).unwrap();
        assert_eq!(both.last_id(), Some("c"));
        assert_eq!(both.last_timestamp(), Some("200"));
    }

    #[test]
    fn cursor_new_drops_blank_halves() {
        let cursor = Cursor::new(Some(" ".into()), Some(String::new()));
        assert_eq!(cursor, Cursor::default());
    }

    #[test]
    fn filter_predicates() {
        let any = ResponseFilter {
            id: "f".into(),
            rating: None,
            has_text: None,
            is_active: true,
        };
        assert!(any.matches(&review(1, "")));

        let five_with_text = ResponseFilter {
            rating: Some(5),
            has_text: Some(true),
            ..any.clone()
        };
        assert!(five_with_text.matches(&review(5, "great")));
        assert!(!five_with_text.matches(&review(5, "")));
        assert!(!five_with_text.matches(&review(4, "great")));

        let silent = ResponseFilter {
            has_text: Some(false),
            ..any
        };
        assert!(silent.matches(&review(3, "")));
        assert!(!silent.matches(&review(3, "meh")));
    }

    #[test]
    fn lease_liveness() {
        let now = Utc::now();
        let lease = Lease {
            holder: Uuid::new_v4(),
            expires_at: now + chrono::Duration::seconds(5),
        };
        assert!(lease.is_live(now));
        assert!(!lease.is_live(now + chrono::Duration::seconds(6)));
    }

    #[test]
    fn generation_log_truncates_on_char_boundary() {
        let long = "ж".repeat(LOG_TEXT_LIMIT + 20);
        let entry = ProcessingLogEntry::generation(GenerationStatus::Success, &long, "ok");
        match entry {
            ProcessingLogEntry::Generation { review_text, .. } => {
                assert_eq!(review_text.chars().count(), LOG_TEXT_LIMIT);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }
}
