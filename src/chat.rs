//! Persisted chats: one per search, created before the result stream is opened.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::transport::ApiRequest;
use crate::types::{SearchFilters, SearchResult};

/// Body of the chat-creation call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateChatRequest {
    /// The query, stored as the chat's title.
    pub message: String,
    #[serde(flatten)]
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateChatResponse {
    id: String,
    #[serde(default)]
    created_at: Option<i64>,
}

/// A persisted chat correlating a query, its filters and its results.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    /// `None` while the chat is a draft that has not been persisted.
    pub chat_id: Option<String>,
    pub query: String,
    pub filters: SearchFilters,
    pub created_at: OffsetDateTime,
}

impl ChatSession {
    /// A draft chat that has not been persisted yet.
    pub fn draft(query: impl Into<String>, filters: SearchFilters) -> Self {
        Self {
            chat_id: None,
            query: query.into(),
            filters,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_draft(&self) -> bool {
        self.chat_id.is_none()
    }
}

/// A chat as stored by the server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatRecord {
    pub id: String,
    /// Stored messages in insertion order; the first is the query, the rest are results.
    #[serde(default)]
    pub messages: Vec<Map<String, Value>>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl ChatRecord {
    /// The query this chat was created for.
    pub fn title(&self) -> Option<&str> {
        self.messages
            .iter()
            .find_map(|m| m.get("title").and_then(Value::as_str))
    }

    /// The stored results, in the order they were persisted.
    ///
    /// Messages that are not search results are skipped; so are results that fail to decode.
    pub fn results(&self) -> Vec<SearchResult> {
        self.messages
            .iter()
            .filter(|m| m.contains_key("score"))
            .filter_map(|m| {
                match serde_json::from_value::<SearchResult>(Value::Object(m.clone())) {
                    Ok(result) => Some(result),
                    Err(err) => {
                        tracing::warn!(chat_id = %self.id, error = %err, "dropping stored result");
                        None
                    }
                }
            })
            .collect()
    }

    /// This record as a persisted chat session.
    pub fn session(&self) -> ChatSession {
        ChatSession {
            chat_id: Some(self.id.clone()),
            query: self.title().unwrap_or_default().to_string(),
            filters: SearchFilters::default(),
            created_at: unix_or_now(self.created_at),
        }
    }
}

/// One entry of the chat history listing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatHistoryItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// One page of the chat history.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatHistoryPage {
    #[serde(default)]
    pub chats: Vec<ChatHistoryItem>,
    /// Pass to the next `chat_history` call; `None` on the last page.
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

fn unix_or_now(seconds: Option<i64>) -> OffsetDateTime {
    seconds
        .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

impl Gateway {
    /// Persist a new chat for `query` and return it with its server-assigned id.
    pub async fn create_chat(&self, query: &str, filters: &SearchFilters) -> Result<ChatSession> {
        let body = CreateChatRequest {
            message: query.to_string(),
            filters: filters.clone(),
        };
        let created: CreateChatResponse = self
            .call_json(ApiRequest::post("chat").json(&body)?)
            .await?;
        if created.id.is_empty() {
            return Err(Error::serialization("chat was created without an id", None));
        }
        tracing::debug!(chat_id = %created.id, "chat created");
        Ok(ChatSession {
            chat_id: Some(created.id),
            query: query.to_string(),
            filters: filters.clone(),
            created_at: unix_or_now(created.created_at),
        })
    }

    /// Fetch a persisted chat.
    pub async fn get_chat(&self, chat_id: &str) -> Result<ChatRecord> {
        if chat_id.trim().is_empty() {
            return Err(Error::validation(
                "chat id must not be empty",
                Some("chat_id".to_string()),
            ));
        }
        self.call_json(ApiRequest::get(format!("chat/{}", chat_id.trim())))
            .await
    }

    /// Fetch one page of the member's chat history.
    pub async fn chat_history(&self, cursor: Option<&str>) -> Result<ChatHistoryPage> {
        let mut request = ApiRequest::get("chat/history");
        if let Some(cursor) = cursor {
            request = request.query("cursor", cursor);
        }
        self.call_json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ChatRecord {
        serde_json::from_value(json!({
            "id": "c1",
            "messages": [
                {"title": "find backend engineer"},
                {"score": 0.4, "user": {"_id": "u2", "name": "Bo"}, "description": "ok"},
                {"score": 0.9, "user": {"_id": "u1", "name": "Ada"}, "description": "great"},
                {"score": "broken"}
            ],
            "created_at": 1_700_000_000,
            "updated_at": 1_700_000_100
        }))
        .unwrap()
    }

    #[test]
    fn record_results_skip_non_results() {
        let results = record().results();
        let ids: Vec<_> = results.iter().map(|r| r.user.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u1"]);
    }

    #[test]
    fn record_session_uses_title() {
        let session = record().session();
        assert_eq!(session.chat_id.as_deref(), Some("c1"));
        assert_eq!(session.query, "find backend engineer");
        assert_eq!(session.created_at.unix_timestamp(), 1_700_000_000);
        assert!(!session.is_draft());
    }

    #[test]
    fn create_request_flattens_filters() {
        let request = CreateChatRequest {
            message: "q".to_string(),
            filters: SearchFilters::new().with_teams(["t1"]),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"message": "q", "teams": ["t1"], "levels": [], "locations": []})
        );
    }

    #[test]
    fn history_page_cursor() {
        let page: ChatHistoryPage = serde_json::from_value(json!({
            "chats": [{"id": "c1", "title": "q", "created_at": 1, "updated_at": 2}],
            "nextCursor": "abc"
        }))
        .unwrap();
        assert_eq!(page.chats.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));

        let last: ChatHistoryPage = serde_json::from_value(json!({"chats": []})).unwrap();
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn drafts_have_no_id() {
        assert!(ChatSession::draft("q", SearchFilters::new()).is_draft());
    }
}
