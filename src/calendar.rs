use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;
use crate::google_client::GoogleClient;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// 作成する予定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub summary: String,
    pub description: Option<String>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// 参加者のメールアドレス
    pub attendees: Vec<String>,
    /// IANAタイムゾーン名（例: Asia/Kolkata）
    pub time_zone: Option<String>,
}

impl NewEvent {
    /// events.insert のリクエストボディ
    pub fn to_request_body(&self) -> Value {
        let mut start = json!({ "dateTime": self.start.to_rfc3339() });
        let mut end = json!({ "dateTime": self.end.to_rfc3339() });
        if let Some(tz) = &self.time_zone {
            start["timeZone"] = json!(tz);
            end["timeZone"] = json!(tz);
        }

        let mut body = json!({
            "summary": self.summary,
            "start": start,
            "end": end,
            "attendees": self
                .attendees
                .iter()
                .map(|email| json!({ "email": email }))
                .collect::<Vec<_>>(),
        });
        if let Some(description) = &self.description {
            body["description"] = json!(description);
        }
        body
    }
}

/// 作成された予定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedEvent {
    pub id: String,
    #[serde(rename = "htmlLink")]
    pub html_link: Option<String>,
}

/// カレンダーサービス
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn insert_event(&self, event: &NewEvent) -> Result<CreatedEvent, ServiceError>;
}

/// Google Calendar API v3 クライアント
pub struct GoogleCalendarClient {
    client: GoogleClient,
    calendar_id: String,
}

impl GoogleCalendarClient {
    pub fn new(client: GoogleClient, calendar_id: &str) -> Self {
        Self {
            client,
            calendar_id: calendar_id.to_string(),
        }
    }
}

#[async_trait]
impl CalendarService for GoogleCalendarClient {
    async fn insert_event(&self, event: &NewEvent) -> Result<CreatedEvent, ServiceError> {
        info!("Creating calendar event '{}' on {}", event.summary, self.calendar_id);

        let url = format!(
            "{}/calendars/{}/events",
            CALENDAR_API_BASE,
            urlencoding::encode(&self.calendar_id)
        );
        let response = self.client.post(&url, &event.to_request_body()).await?;

        serde_json::from_value(response)
            .map_err(|e| ServiceError::Malformed(format!("unexpected event response: {}", e)))
    }
}
