use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 環境変数で設定を上書きするときの接頭辞（例: GSUITE_AGENT__COMPLETION__API_KEY）
const ENV_PREFIX: &str = "GSUITE_AGENT";

/// アプリケーション全体の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// アプリケーション全般の設定
    #[serde(default)]
    pub general: GeneralConfig,

    /// 補完プロバイダの設定
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Google API の設定
    #[serde(default)]
    pub google: GoogleConfig,

    /// Google Sheets の設定
    #[serde(default)]
    pub sheets: SheetsConfig,
}

/// 一般設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Google Cloud Console からダウンロードした credentials.json
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,

    /// 取得したトークンの保存先
    #[serde(default = "default_token_file")]
    pub token_file: String,

    /// 予定作成時のタイムゾーン（IANA名）
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// 抽出時にモデルへ指示するUTCオフセット
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

/// 補完プロバイダ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// APIキー
    #[serde(default)]
    pub api_key: String,

    /// 使用するモデル
    #[serde(default = "default_model")]
    pub model: String,

    /// OpenAI互換エンドポイントのURL（デフォルトはGemini、空文字ならOpenAI本家）
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u16,
}

/// Google API 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    /// 予定を作成するカレンダー
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,

    /// 要求するOAuthスコープ
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

/// Google Sheets 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetsConfig {
    /// スプレッドシートID
    #[serde(default)]
    pub spreadsheet_id: String,

    /// 質問応答で読み込むシート名
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,

    /// 変更を監視する列
    #[serde(default = "default_watch_range")]
    pub watch_range: String,

    /// 監視間隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_file: default_token_file(),
            time_zone: default_time_zone(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            api_base: default_api_base(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            calendar_id: default_calendar_id(),
            scopes: default_scopes(),
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            sheet_name: default_sheet_name(),
            watch_range: default_watch_range(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// デフォルト値
fn default_credentials_file() -> String {
    "credentials.json".to_string()
}

fn default_token_file() -> String {
    app_config_dir().join("token.json").to_string_lossy().into_owned()
}

fn default_time_zone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_utc_offset() -> String {
    "+05:30".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_max_tokens() -> u16 {
    1024
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "https://www.googleapis.com/auth/calendar",
        "https://www.googleapis.com/auth/gmail.modify",
        "https://www.googleapis.com/auth/spreadsheets.readonly",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

fn default_watch_range() -> String {
    "Sheet1!C1:C".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

/// XDG設定ディレクトリ配下のアプリ用ディレクトリ
pub fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gsuite_agent")
}

/// 設定ファイルを読み込み、環境変数で上書きする
///
/// ファイルが無くても環境変数とデフォルト値だけで動く。
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let settings = ::config::Config::builder()
        .add_source(
            ::config::File::from(path.as_ref())
                .format(::config::FileFormat::Toml)
                .required(false),
        )
        .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .context("Failed to read config file")?;

    let config: AppConfig = settings
        .try_deserialize()
        .context("Failed to parse config file")?;

    Ok(config)
}

impl CompletionConfig {
    /// 明示されたエンドポイント。空なら async-openai 既定の OpenAI を使う
    pub fn endpoint(&self) -> Option<&str> {
        let api_base = self.api_base.trim();
        (!api_base.is_empty()).then_some(api_base)
    }
}

impl AppConfig {
    /// 補完プロバイダを使う前の必須項目チェック
    pub fn require_completion(&self) -> Result<&CompletionConfig> {
        if self.completion.api_key.trim().is_empty() {
            bail!("completion.api_key is not set (config file or {}__COMPLETION__API_KEY)", ENV_PREFIX);
        }
        Ok(&self.completion)
    }

    /// スプレッドシートIDの必須チェック
    pub fn require_spreadsheet(&self) -> Result<&str> {
        if self.sheets.spreadsheet_id.trim().is_empty() {
            bail!("sheets.spreadsheet_id is not set");
        }
        Ok(&self.sheets.spreadsheet_id)
    }
}

/// デフォルトの設定を作成する
pub fn create_default_config() -> AppConfig {
    AppConfig {
        completion: CompletionConfig {
            api_key: "your_gemini_api_key".to_string(),
            ..CompletionConfig::default()
        },
        sheets: SheetsConfig {
            spreadsheet_id: "your_spreadsheet_id".to_string(),
            ..SheetsConfig::default()
        },
        ..AppConfig::default()
    }
}

/// サンプル設定ファイルを作成する
pub fn generate_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let config = create_default_config();
    let toml_str = toml::to_string_pretty(&config).context("Failed to serialize config")?;

    std::fs::write(path, toml_str).context("Failed to write sample config file")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[completion]\napi_key = \"k\"\nmodel = \"gpt-4o-mini\"\n\n[sheets]\nspreadsheet_id = \"abc\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.completion.api_key, "k");
        assert_eq!(config.completion.model, "gpt-4o-mini");
        assert_eq!(config.google.calendar_id, "primary");
        assert_eq!(config.sheets.spreadsheet_id, "abc");
        assert_eq!(config.sheets.poll_interval_secs, 10);
        assert_eq!(config.general.time_zone, "Asia/Kolkata");
        assert!(config.require_completion().is_ok());
    }

    #[test]
    fn sample_config_round_trips_through_loader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        generate_sample_config(&path).unwrap();
        let config = load_config(&path).unwrap();

        assert_eq!(config.completion.api_key, "your_gemini_api_key");
        assert_eq!(config.google.scopes, default_scopes());
        assert_eq!(config.sheets.watch_range, "Sheet1!C1:C");
    }

    #[test]
    fn empty_api_base_selects_the_openai_endpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[completion]\napi_base = \"\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.completion.endpoint(), None);
        assert_eq!(
            AppConfig::default().completion.endpoint(),
            Some("https://generativelanguage.googleapis.com/v1beta/openai")
        );
    }

    #[test]
    fn missing_api_key_is_reported() {
        let config = AppConfig::default();
        let err = config.require_completion().unwrap_err();
        assert!(err.to_string().contains("completion.api_key"));
        assert!(config.require_spreadsheet().is_err());
    }
}
