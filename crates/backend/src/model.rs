use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::ids::{ConversationId, RemoteMessageId};

pub const DEFAULT_HISTORY_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_CONVERSATION_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ConversationPage {
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteRole {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageRecord {
    pub id: RemoteMessageId,
    pub role: RemoteRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub conversation_title: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationQuery {
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl ConversationQuery {
    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = search
            .map(|search| search.trim().to_string())
            .filter(|search| !search.is_empty());
        self
    }
}

impl Default for ConversationQuery {
    fn default() -> Self {
        Self {
            search: None,
            limit: DEFAULT_CONVERSATION_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryBody<'a> {
    pub query: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct TitleBody<'a> {
    pub title: &'a str,
}

// Backends built on Python frequently emit naive ISO timestamps; those are read as UTC.
// Anything unparseable becomes `None` rather than failing the whole page.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timestamps_accept_offset_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-05-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:30:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn history_page_tolerates_sparse_payloads() {
        let page: HistoryPage = serde_json::from_str(
            r#"{
                "messages": [
                    {"id": 7, "role": "user", "content": "hi", "created_at": "2024-05-01T12:30:00"},
                    {"id": "8", "role": "assistant", "content": "hello", "created_at": null},
                    {"id": 9, "role": "tool", "created_at": "not a date"}
                ],
                "conversation_title": "Greetings"
            }"#,
        )
        .unwrap();

        assert_eq!(page.messages.len(), 3);
        assert_eq!(page.messages[0].id.as_str(), "7");
        assert_eq!(page.messages[1].created_at, None);
        assert_eq!(page.messages[2].role, RemoteRole::Other);
        assert_eq!(page.messages[2].content, "");
        assert_eq!(page.conversation_title, "Greetings");
        assert!(!page.has_more);
    }

    #[test]
    fn conversation_query_drops_blank_search() {
        let query = ConversationQuery::default().with_search(Some("  ".to_string()));
        assert_eq!(query.search, None);
        assert_eq!(query.limit, DEFAULT_CONVERSATION_PAGE_LIMIT);
    }
}
