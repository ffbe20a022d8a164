use thiserror::Error;

/// コア処理（抽出・適用）の失敗理由
///
/// `Display` の文字列は画面にそのまま表示される。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// 必須フィールドが存在しない
    #[error("missing field: {0}")]
    MissingField(String),

    /// 型変換・形式チェックに失敗したフィールド
    #[error("validation error: {0}")]
    Validation(String),

    /// 終了時刻が開始時刻以前
    #[error("invalid interval")]
    InvalidInterval,

    /// メールアドレスの形式が不正
    #[error("invalid address")]
    InvalidAddress,

    /// 補完プロバイダに到達できない、または応答を解釈できない
    #[error("provider error")]
    Provider,

    /// 外部サービスがエラーを返した
    #[error("external service error: {status} {detail}")]
    ExternalService { status: String, detail: String },

    /// 再試行で回復する可能性のあるエラー
    #[error("transient: {0}")]
    Transient(String),
}

/// 失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Provider,
    ExternalService,
    Transient,
}

impl Failure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Failure::MissingField(_)
            | Failure::Validation(_)
            | Failure::InvalidInterval
            | Failure::InvalidAddress => FailureKind::Validation,
            Failure::Provider => FailureKind::Provider,
            Failure::ExternalService { .. } => FailureKind::ExternalService,
            Failure::Transient(_) => FailureKind::Transient,
        }
    }

    /// 呼び出し側が再試行を検討してよいか
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Provider | FailureKind::Transient)
    }
}

/// 補完プロバイダのエラー
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("completion request failed: {0}")]
    Request(String),

    #[error("completion response was empty")]
    EmptyResponse,
}

/// Google API 呼び出しのエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// タイムアウト・接続失敗・429・5xx
    #[error("{0}")]
    Transient(String),

    /// 4xx などサービス側が拒否したもの
    #[error("HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// 認証情報を取得できなかった
    #[error("authentication failed: {0}")]
    Auth(String),

    /// リクエストの組み立てやレスポンスの解釈に失敗した
    #[error("{0}")]
    Malformed(String),
}

impl From<ServiceError> for Failure {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Transient(detail) => Failure::Transient(detail),
            ServiceError::Remote { status, message } => Failure::ExternalService {
                status: status.to_string(),
                detail: message,
            },
            ServiceError::Auth(detail) => Failure::ExternalService {
                status: "auth".to_string(),
                detail,
            },
            ServiceError::Malformed(detail) => Failure::ExternalService {
                status: "malformed".to_string(),
                detail,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_verbatim() {
        assert_eq!(Failure::MissingField("title".into()).to_string(), "missing field: title");
        assert_eq!(Failure::Validation("startTime".into()).to_string(), "validation error: startTime");
        assert_eq!(Failure::InvalidInterval.to_string(), "invalid interval");
        assert_eq!(Failure::InvalidAddress.to_string(), "invalid address");
        assert_eq!(Failure::Provider.to_string(), "provider error");
        assert_eq!(
            Failure::Transient("HTTP 503 Service Unavailable".into()).to_string(),
            "transient: HTTP 503 Service Unavailable"
        );
    }

    #[test]
    fn service_errors_keep_remote_status() {
        let failure: Failure = ServiceError::Remote {
            status: 403,
            message: "Insufficient Permission".into(),
        }
        .into();

        assert_eq!(failure.kind(), FailureKind::ExternalService);
        assert_eq!(failure.to_string(), "external service error: 403 Insufficient Permission");
        assert!(!failure.is_retryable());

        let transient: Failure = ServiceError::Transient("connection refused".into()).into();
        assert_eq!(transient.kind(), FailureKind::Transient);
        assert!(transient.is_retryable());
    }
}
