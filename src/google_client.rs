use anyhow::{Context, Result};
use log::{debug, error, warn};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialStore;
use crate::error::ServiceError;

/// 認証済みのGoogle APIクライアント
///
/// リクエストごとに `CredentialStore` からアクセストークンを取得する。
#[derive(Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
}

impl GoogleClient {
    pub fn new(credentials: Arc<CredentialStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::with_http(http, credentials))
    }

    pub fn with_http(http: reqwest::Client, credentials: Arc<CredentialStore>) -> Self {
        Self { http, credentials }
    }

    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ServiceError> {
        self.api_request(Method::GET, url, query, None).await
    }

    pub async fn post(&self, url: &str, body: &Value) -> Result<Value, ServiceError> {
        self.api_request(Method::POST, url, &[], Some(body)).await
    }

    /// 共通のAPIリクエスト関数
    async fn api_request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ServiceError> {
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|e| ServiceError::Auth(format!("{:#}", e)))?;

        let mut req = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .query(query);

        if let Some(json_body) = body {
            req = req.json(json_body);
        }

        debug!("APIリクエスト送信: {} {}", method, url);

        let response = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let details = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection error"
                } else if e.is_request() {
                    "request error"
                } else {
                    "unknown error"
                };
                error!("Google API request failed ({}): {} - {}", url, details, e);
                return Err(if e.is_timeout() || e.is_connect() {
                    ServiceError::Transient(format!("{}: {}", details, e))
                } else {
                    ServiceError::Malformed(format!("{}: {}", details, e))
                });
            }
        };

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ServiceError::Transient(format!("failed to read response body: {}", e))
        })?;

        if status.is_success() {
            debug!("APIレスポンス成功: {}", status);
            if text.trim().is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            return serde_json::from_str(&text).map_err(|e| {
                error!("レスポンスのJSONパースに失敗: {} - {}", url, e);
                ServiceError::Malformed(format!("invalid JSON response: {}", e))
            });
        }

        let message = extract_error_message(&text).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_string()
        });
        error!("Google API error: HTTP {} - {}", status.as_u16(), message);

        if status == StatusCode::UNAUTHORIZED {
            // 次回の呼び出しでトークンを更新させる
            warn!("Access token rejected, marking credential as stale");
            self.credentials.mark_stale().await;
        }

        Err(classify_status(status, message))
    }
}

/// HTTPステータスを一時的なものとそれ以外に分類する
pub fn classify_status(status: StatusCode, message: String) -> ServiceError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ServiceError::Transient(format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        ServiceError::Remote {
            status: status.as_u16(),
            message,
        }
    }
}

/// Google API のエラーレスポンスからメッセージを取り出す
///
/// `{"error": {"code": 400, "message": "..."}}` の形式と、
/// OAuthエンドポイントの `{"error": "...", "error_description": "..."}` の形式がある。
pub fn extract_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let error = parsed.get("error")?;

    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| parsed.get("error_description").and_then(Value::as_str))
        .or_else(|| error.as_str())
        .map(str::to_string)
}
