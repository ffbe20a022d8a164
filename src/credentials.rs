use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use url::Url;
use yup_oauth2::ApplicationSecret;

#[cfg(test)]
use mockall::automock;

/// 有効期限のこの秒数前から期限切れとして扱う
const EXPIRY_SKEW_SECS: i64 = 60;

/// 保存されるOAuth認証情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credential {
    /// トークンエンドポイントの応答から作る
    ///
    /// リフレッシュ時の応答には refresh_token が含まれないことが多いので、
    /// その場合は手元の値を引き継ぐ。
    pub fn from_response(
        response: TokenResponse,
        previous_refresh_token: Option<String>,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh_token),
            expires_at: now + Duration::seconds(response.expires_in),
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| scopes.to_vec()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now
    }

    /// 要求するスコープをすべて含んでいるか
    pub fn covers(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|s| self.scopes.contains(s))
    }
}

/// トークンエンドポイントの応答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// 同意フローとトークン更新を担う外部との境界
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// ユーザーの同意を得て新しいトークンを取得する
    async fn authorize(&self, scopes: &[String]) -> Result<TokenResponse>;

    /// リフレッシュトークンでアクセストークンを更新する
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// プロセス全体で共有するOAuth認証情報の保管庫
///
/// 最初に使われたときにファイルから読み込み、無ければ同意フローを実行する。
/// 期限切れなら更新し、更新に失敗したら破棄して同意からやり直す。
pub struct CredentialStore {
    path: PathBuf,
    scopes: Vec<String>,
    flow: Box<dyn OAuthFlow>,
    cached: Mutex<Option<Credential>>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, scopes: Vec<String>, flow: Box<dyn OAuthFlow>) -> Self {
        Self {
            path: path.into(),
            scopes,
            flow,
            cached: Mutex::new(None),
        }
    }

    /// credentials.json を読み込み、ブラウザ同意フローを使う保管庫を作る
    pub async fn installed(
        credentials_file: impl AsRef<Path>,
        token_file: impl Into<PathBuf>,
        scopes: Vec<String>,
    ) -> Result<Self> {
        let secret = yup_oauth2::read_application_secret(credentials_file.as_ref())
            .await
            .with_context(|| {
                format!(
                    "Failed to read client secrets from {:?}",
                    credentials_file.as_ref()
                )
            })?;

        Ok(Self::new(token_file, scopes, Box::new(InstalledFlow::new(secret))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 有効な認証情報を返す
    pub async fn get(&self) -> Result<Credential> {
        let mut cached = self.cached.lock().await;

        if cached.is_none() {
            *cached = self.load()?;
        }

        let now = Utc::now();
        match cached.take() {
            Some(credential) if !credential.covers(&self.scopes) => {
                info!("Stored credential lacks required scopes, requesting consent again");
            }
            Some(credential) if !credential.is_expired(now) => {
                *cached = Some(credential.clone());
                return Ok(credential);
            }
            Some(credential) => match credential.refresh_token.clone() {
                Some(refresh_token) => match self.refresh_with(&refresh_token).await {
                    Ok(fresh) => {
                        *cached = Some(fresh.clone());
                        return Ok(fresh);
                    }
                    Err(e) => {
                        warn!("Token refresh failed, discarding stored credential: {:#}", e);
                        self.remove_file()?;
                    }
                },
                None => {
                    debug!("Expired credential has no refresh token");
                }
            },
            None => {
                debug!("No stored credential at {:?}", self.path);
            }
        }

        let fresh = self.authorize().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// アクセストークンだけを返す
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.get().await?.access_token)
    }

    /// 期限に関係なく更新する
    pub async fn refresh(&self) -> Result<Credential> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = self.load()?;
        }

        let refresh_token = cached
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
            .ok_or_else(|| anyhow!("No refresh token available"))?;

        let fresh = self.refresh_with(&refresh_token).await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// 認証情報をファイルに保存する
    pub fn persist(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create token directory")?;
            }
        }

        let json = serde_json::to_string_pretty(credential).context("Failed to serialize credential")?;
        fs::write(&self.path, json).context("Failed to write token file")?;
        debug!("Credential persisted to {:?}", self.path);
        Ok(())
    }

    /// 手元の認証情報を破棄する。次の `get` で同意からやり直す
    pub async fn invalidate(&self) -> Result<()> {
        self.cached.lock().await.take();
        self.remove_file()
    }

    /// サーバーに拒否されたアクセストークンを期限切れ扱いにする
    pub async fn mark_stale(&self) {
        if let Some(credential) = self.cached.lock().await.as_mut() {
            credential.expires_at = Utc::now() - Duration::seconds(EXPIRY_SKEW_SECS);
        }
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<Credential> {
        info!("Refreshing access token");
        let response = self.flow.refresh(refresh_token).await?;
        let credential =
            Credential::from_response(response, Some(refresh_token.to_string()), &self.scopes, Utc::now());
        self.persist(&credential)?;
        Ok(credential)
    }

    async fn authorize(&self) -> Result<Credential> {
        info!("Requesting user consent for {} scopes", self.scopes.len());
        let response = self
            .flow
            .authorize(&self.scopes)
            .await
            .context("Failed to obtain access token")?;
        let credential = Credential::from_response(response, None, &self.scopes, Utc::now());
        self.persist(&credential)?;
        Ok(credential)
    }

    fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read_to_string(&self.path).context("Failed to read token file")?;
        match serde_json::from_str(&data) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!("Ignoring unreadable token file {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    fn remove_file(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove token file")?;
        }
        Ok(())
    }
}

/// ブラウザで同意を得て、ループバックでリダイレクトを受け取るフロー
pub struct InstalledFlow {
    secret: ApplicationSecret,
    client: reqwest::Client,
}

impl InstalledFlow {
    pub fn new(secret: ApplicationSecret) -> Self {
        Self {
            secret,
            client: reqwest::Client::new(),
        }
    }

    /// 認証URLを構築
    fn authorization_url(&self, redirect_uri: &str, scopes: &[String]) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&response_type=code&access_type=offline&prompt=consent",
            self.secret.auth_uri,
            urlencoding::encode(&self.secret.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" "))
        )
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.secret.token_uri)
            .form(form)
            .send()
            .await
            .context("Failed to send token request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(anyhow!("Token request failed with status {}: {}", status, error_text));
        }

        response
            .json::<TokenResponse>()
            .await
            .context("Failed to parse token response")
    }
}

#[async_trait]
impl OAuthFlow for InstalledFlow {
    async fn authorize(&self, scopes: &[String]) -> Result<TokenResponse> {
        // 空いているポートでリダイレクトを待つ
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to start local redirect listener")?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}", port);

        let auth_url = self.authorization_url(&redirect_uri, scopes);
        info!("Opening browser for Google consent");
        if let Err(e) = open::that(&auth_url) {
            warn!("Could not open browser automatically: {}", e);
            println!("Open this URL in your browser to authorize access:\n{}", auth_url);
        }

        let (mut stream, _) = listener
            .accept()
            .await
            .context("Failed while waiting for the OAuth redirect")?;

        let mut buffer = [0u8; 4096];
        let read = stream
            .read(&mut buffer)
            .await
            .context("Failed to read the OAuth redirect")?;
        let code = parse_redirect_code(&String::from_utf8_lossy(&buffer[..read]))?;

        let page = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
                    <html><body><h1>Authorization complete</h1><p>You can close this window.</p></body></html>";
        stream
            .write_all(page.as_bytes())
            .await
            .context("Failed to answer the OAuth redirect")?;

        self.post_token_form(&[
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        debug!("Sending token refresh request to {}", self.secret.token_uri);
        self.post_token_form(&[
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }
}

/// リダイレクトのHTTPリクエストから code パラメータを取り出す
fn parse_redirect_code(request: &str) -> Result<String> {
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow!("Malformed OAuth redirect request"))?;

    let url = Url::parse(&format!("http://127.0.0.1{}", target)).context("Malformed OAuth redirect URL")?;

    if let Some((_, error)) = url.query_pairs().find(|(key, _)| key == "error") {
        return Err(anyhow!("Authorization was denied: {}", error));
    }

    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| anyhow!("Authorization code not found in redirect"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scopes() -> Vec<String> {
        vec!["https://www.googleapis.com/auth/calendar".to_string()]
    }

    fn token(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            expires_in: 3600,
            refresh_token: refresh.map(str::to_string),
            scope: None,
        }
    }

    fn stored(access: &str, expires_at: DateTime<Utc>) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at,
            scopes: scopes(),
        }
    }

    #[tokio::test]
    async fn first_use_runs_consent_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth").join("token.json");

        let mut flow = MockOAuthFlow::new();
        flow.expect_authorize()
            .times(1)
            .returning(|_| Ok(token("access-1", Some("refresh-1"))));
        flow.expect_refresh().times(0);

        let store = CredentialStore::new(&path, scopes(), Box::new(flow));
        let first = store.get().await.unwrap();
        let second = store.get().await.unwrap();

        assert_eq!(first.access_token, "access-1");
        assert_eq!(first, second);
        let on_disk: Credential = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn valid_stored_credential_is_reused_without_network() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut flow = MockOAuthFlow::new();
        flow.expect_authorize().times(0);
        flow.expect_refresh().times(0);

        let store = CredentialStore::new(&path, scopes(), Box::new(flow));
        store.persist(&stored("cached", Utc::now() + Duration::hours(1))).unwrap();

        assert_eq!(store.access_token().await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_and_keeps_refresh_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut flow = MockOAuthFlow::new();
        flow.expect_refresh()
            .withf(|refresh_token| refresh_token == "refresh-1")
            .times(1)
            .returning(|_| Ok(token("access-2", None)));
        flow.expect_authorize().times(0);

        let store = CredentialStore::new(&path, scopes(), Box::new(flow));
        store.persist(&stored("old", Utc::now() - Duration::minutes(5))).unwrap();

        let fresh = store.get().await.unwrap();
        assert_eq!(fresh.access_token, "access-2");
        assert_eq!(fresh.refresh_token.as_deref(), Some("refresh-1"));
        assert!(!fresh.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_consent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut flow = MockOAuthFlow::new();
        flow.expect_refresh()
            .times(1)
            .returning(|_| Err(anyhow!("invalid_grant")));
        flow.expect_authorize()
            .times(1)
            .returning(|_| Ok(token("access-3", Some("refresh-3"))));

        let store = CredentialStore::new(&path, scopes(), Box::new(flow));
        store.persist(&stored("old", Utc::now() - Duration::minutes(5))).unwrap();

        let fresh = store.get().await.unwrap();
        assert_eq!(fresh.access_token, "access-3");
        assert_eq!(fresh.refresh_token.as_deref(), Some("refresh-3"));
    }

    #[tokio::test]
    async fn invalidate_removes_the_token_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let store = CredentialStore::new(&path, scopes(), Box::new(MockOAuthFlow::new()));
        store.persist(&stored("cached", Utc::now() + Duration::hours(1))).unwrap();
        store.invalidate().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_mark_forces_refresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut flow = MockOAuthFlow::new();
        flow.expect_refresh()
            .times(1)
            .returning(|_| Ok(token("access-2", None)));

        let store = CredentialStore::new(&path, scopes(), Box::new(flow));
        store.persist(&stored("cached", Utc::now() + Duration::hours(1))).unwrap();
        assert_eq!(store.access_token().await.unwrap(), "cached");

        store.mark_stale().await;
        assert_eq!(store.access_token().await.unwrap(), "access-2");
    }

    #[test]
    fn redirect_code_is_extracted() {
        let request = "GET /?code=4%2Fabc&scope=calendar HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        assert_eq!(parse_redirect_code(request).unwrap(), "4/abc");

        let denied = "GET /?error=access_denied HTTP/1.1\r\n\r\n";
        assert!(parse_redirect_code(denied).is_err());
    }

    #[test]
    fn scope_string_from_response_overrides_requested_scopes() {
        let response = TokenResponse {
            scope: Some("a b".to_string()),
            ..token("t", None)
        };
        let credential = Credential::from_response(response, None, &scopes(), Utc::now());
        assert_eq!(credential.scopes, vec!["a".to_string(), "b".to_string()]);
        assert!(!credential.covers(&scopes()));
    }
}
