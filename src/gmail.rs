use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;
use crate::google_client::GoogleClient;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// 送信・下書き作成するメール
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMessage {
    /// RFC 2822 形式のメッセージ
    pub fn to_rfc2822(&self) -> String {
        [
            format!("To: {}", self.to),
            format!("Subject: {}", encode_header(&self.subject)),
            "MIME-Version: 1.0".to_string(),
            "Content-Type: text/plain; charset=UTF-8".to_string(),
            "Content-Transfer-Encoding: 8bit".to_string(),
            String::new(),
            self.body.clone(),
        ]
        .join("\r\n")
    }

    /// Gmail API の raw フィールド用に base64url でエンコードする
    pub fn to_raw(&self) -> String {
        URL_SAFE.encode(self.to_rfc2822().as_bytes())
    }
}

/// 非ASCIIのヘッダ値は RFC 2047 でエンコードする。改行は空白に畳む
fn encode_header(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value.is_ascii() {
        value
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// 送信済みメッセージ
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SentMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

/// 作成された下書き
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Draft {
    pub id: String,
}

/// messages.list が返すメッセージ参照
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageRef {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

/// 受信メールの概要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSnippet {
    pub subject: String,
    pub sender: String,
    pub snippet: String,
}

impl EmailSnippet {
    /// messages.get の応答から件名・送信者・スニペットを取り出す
    pub fn from_message(message: &Value) -> Self {
        let headers = message
            .pointer("/payload/headers")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let header = |name: &str| {
            headers
                .iter()
                .find(|h| {
                    h.get("name")
                        .and_then(Value::as_str)
                        .map_or(false, |n| n.eq_ignore_ascii_case(name))
                })
                .and_then(|h| h.get("value"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Self {
            subject: header("Subject").unwrap_or_else(|| "(No Subject)".to_string()),
            sender: header("From").unwrap_or_else(|| "(Unknown Sender)".to_string()),
            snippet: message
                .get("snippet")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// メールサービス
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MailService: Send + Sync {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, ServiceError>;

    async fn create_draft(&self, message: &OutgoingMessage) -> Result<Draft, ServiceError>;

    /// 検索クエリとラベルでメッセージを一覧する
    async fn list_messages(
        &self,
        query: Option<String>,
        label_ids: Vec<String>,
        max_results: usize,
    ) -> Result<Vec<MessageRef>, ServiceError>;

    async fn get_message(&self, id: &str) -> Result<EmailSnippet, ServiceError>;
}

/// Gmail API v1 クライアント
pub struct GmailClient {
    client: GoogleClient,
}

impl GmailClient {
    pub fn new(client: GoogleClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MailService for GmailClient {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, ServiceError> {
        info!("Sending Gmail message to {}", message.to);

        let url = format!("{}/users/me/messages/send", GMAIL_API_BASE);
        let response = self.client.post(&url, &json!({ "raw": message.to_raw() })).await?;

        serde_json::from_value(response)
            .map_err(|e| ServiceError::Malformed(format!("unexpected send response: {}", e)))
    }

    async fn create_draft(&self, message: &OutgoingMessage) -> Result<Draft, ServiceError> {
        info!("Creating Gmail draft to {}", message.to);

        let url = format!("{}/users/me/drafts", GMAIL_API_BASE);
        let body = json!({ "message": { "raw": message.to_raw() } });
        let response = self.client.post(&url, &body).await?;

        serde_json::from_value(response)
            .map_err(|e| ServiceError::Malformed(format!("unexpected draft response: {}", e)))
    }

    async fn list_messages(
        &self,
        query: Option<String>,
        label_ids: Vec<String>,
        max_results: usize,
    ) -> Result<Vec<MessageRef>, ServiceError> {
        let mut params = vec![("maxResults", max_results.to_string())];
        if let Some(q) = query {
            params.push(("q", q));
        }
        for label in label_ids {
            params.push(("labelIds", label));
        }

        let url = format!("{}/users/me/messages", GMAIL_API_BASE);
        let response = self.client.get(&url, &params).await?;

        // 該当なしの場合 messages フィールド自体が無い
        let messages = match response.get("messages") {
            Some(messages) => serde_json::from_value(messages.clone())
                .map_err(|e| ServiceError::Malformed(format!("unexpected list response: {}", e)))?,
            None => Vec::new(),
        };
        debug!("Listed {} messages", messages.len());
        Ok(messages)
    }

    async fn get_message(&self, id: &str) -> Result<EmailSnippet, ServiceError> {
        let url = format!("{}/users/me/messages/{}", GMAIL_API_BASE, urlencoding::encode(id));
        let params = [
            ("format", "metadata".to_string()),
            ("metadataHeaders", "Subject".to_string()),
            ("metadataHeaders", "From".to_string()),
        ];
        let message = self.client.get(&url, &params).await?;
        Ok(EmailSnippet::from_message(&message))
    }
}

/// 受信トレイの最新メールを取得
pub async fn read_recent_emails(
    mail: &dyn MailService,
    max_results: usize,
) -> Result<Vec<EmailSnippet>, ServiceError> {
    let refs = mail
        .list_messages(None, vec!["INBOX".to_string()], max_results)
        .await?;
    fetch_snippets(mail, &refs).await
}

/// Gmailの検索構文でメールを検索
pub async fn search_emails(
    mail: &dyn MailService,
    query: &str,
    max_results: usize,
) -> Result<Vec<EmailSnippet>, ServiceError> {
    let refs = mail
        .list_messages(Some(query.to_string()), Vec::new(), max_results)
        .await?;
    fetch_snippets(mail, &refs).await
}

async fn fetch_snippets(
    mail: &dyn MailService,
    refs: &[MessageRef],
) -> Result<Vec<EmailSnippet>, ServiceError> {
    let mut emails = Vec::with_capacity(refs.len());
    for message in refs {
        emails.push(mail.get_message(&message.id).await?);
    }
    Ok(emails)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_decodes_to_rfc2822() {
        let message = OutgoingMessage {
            to: "ana@example.com".into(),
            subject: "Invoice".into(),
            body: "Please find the invoice attached.".into(),
        };

        let decoded = String::from_utf8(URL_SAFE.decode(message.to_raw()).unwrap()).unwrap();
        assert!(decoded.starts_with("To: ana@example.com\r\nSubject: Invoice\r\n"));
        assert!(decoded.ends_with("\r\n\r\nPlease find the invoice attached."));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        assert_eq!(encode_header("Hello"), "Hello");
        assert_eq!(encode_header("請求書"), format!("=?UTF-8?B?{}?=", STANDARD.encode("請求書")));
    }

    #[test]
    fn line_breaks_in_subject_cannot_add_headers() {
        let message = OutgoingMessage {
            to: "ana@example.com".into(),
            subject: "Hi\r\nBcc: someone@example.net".into(),
            body: "Hello".into(),
        };

        let text = message.to_rfc2822();
        assert!(!text.contains("\r\nBcc:"));
        assert!(text.contains("Subject: Hi  Bcc: someone@example.net\r\n"));
    }

    #[test]
    fn snippet_defaults_when_headers_are_missing() {
        let full = json!({
            "snippet": "See you tomorrow",
            "payload": {"headers": [
                {"name": "From", "value": "Ana <ana@example.com>"},
                {"name": "subject", "value": "Lunch"}
            ]}
        });
        let snippet = EmailSnippet::from_message(&full);
        assert_eq!(snippet.subject, "Lunch");
        assert_eq!(snippet.sender, "Ana <ana@example.com>");
        assert_eq!(snippet.snippet, "See you tomorrow");

        let bare = EmailSnippet::from_message(&json!({"id": "1"}));
        assert_eq!(bare.subject, "(No Subject)");
        assert_eq!(bare.sender, "(Unknown Sender)");
        assert_eq!(bare.snippet, "");
    }

    #[tokio::test]
    async fn recent_emails_read_the_inbox_and_fetch_each_message() {
        let mut mail = MockMailService::new();
        mail.expect_list_messages()
            .withf(|query, labels, max| query.is_none() && labels == &vec!["INBOX".to_string()] && *max == 2)
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![
                    MessageRef { id: "m1".into(), thread_id: None },
                    MessageRef { id: "m2".into(), thread_id: None },
                ])
            });
        mail.expect_get_message().times(2).returning(|id| {
            Ok(EmailSnippet {
                subject: format!("subject {}", id),
                sender: "ana@example.com".into(),
                snippet: String::new(),
            })
        });

        let emails = read_recent_emails(&mail, 2).await.unwrap();
        assert_eq!(emails.len(), 2);
        assert_eq!(emails[1].subject, "subject m2");
    }

    #[tokio::test]
    async fn search_passes_the_query_through() {
        let mut mail = MockMailService::new();
        mail.expect_list_messages()
            .withf(|query, labels, _| query.as_deref() == Some("from:ana") && labels.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        mail.expect_get_message().times(0);

        let emails = search_emails(&mail, "from:ana", 5).await.unwrap();
        assert!(emails.is_empty());
    }
}
