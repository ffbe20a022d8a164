use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, Utc};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use gsuite_agent::applier::{self, ActionRequest, ActionResult, Applier, Operation};
use gsuite_agent::calendar::GoogleCalendarClient;
use gsuite_agent::completion::OpenAiProvider;
use gsuite_agent::config::{self, AppConfig};
use gsuite_agent::credentials::CredentialStore;
use gsuite_agent::error::Failure;
use gsuite_agent::extractor::Extractor;
use gsuite_agent::gmail::{self, GmailClient, MailService};
use gsuite_agent::google_client::GoogleClient;
use gsuite_agent::poller::{ColumnPoller, SheetColumn};
use gsuite_agent::schema::parse_timestamp;
use gsuite_agent::sheets::{self, GoogleSheetsClient, SheetService};

/// Natural-language scheduling, mail and sheet Q&A on Google Workspace
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[clap(short, long, value_parser, default_value = "config.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a calendar event from a description
    Schedule { text: Vec<String> },

    /// Send an email described in natural language
    Send { text: Vec<String> },

    /// Create a Gmail draft described in natural language
    Draft { text: Vec<String> },

    /// Show the latest messages in the inbox
    Inbox {
        #[clap(long, default_value_t = 5)]
        max: usize,
    },

    /// Search mail with Gmail query syntax
    Search {
        query: String,
        #[clap(long, default_value_t = 5)]
        max: usize,
    },

    /// Ask a question about a sheet
    Ask {
        /// Sheet name (defaults to sheets.sheet_name)
        #[clap(long)]
        sheet: Option<String>,
        question: Vec<String>,
    },

    /// Watch a column and print every changed cell
    Watch {
        /// A1 range of the column (defaults to sheets.watch_range)
        #[clap(long)]
        range: Option<String>,
        /// Poll interval in seconds
        #[clap(long)]
        interval: Option<u64>,
    },

    /// Write a sample config file
    InitConfig,
}

/// アプリケーションのロギングを初期化
fn init_logging() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    info!("gsuite_agent v{} を起動しました", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// 設定から生成した各サービス
struct Services {
    google: GoogleClient,
    mail: Arc<dyn MailService>,
    sheets: Arc<dyn SheetService>,
}

async fn build_services(config: &AppConfig) -> Result<Services> {
    let store = CredentialStore::installed(
        &config.general.credentials_file,
        &config.general.token_file,
        config.google.scopes.clone(),
    )
    .await?;
    services_from_store(store)
}

/// Google側のサービスだけを組み立てる。補完プロバイダの設定は不要
fn services_from_store(store: CredentialStore) -> Result<Services> {
    let google = GoogleClient::new(Arc::new(store))?;

    let mail: Arc<dyn MailService> = Arc::new(GmailClient::new(google.clone()));
    let sheets: Arc<dyn SheetService> = Arc::new(GoogleSheetsClient::new(google.clone()));

    Ok(Services { google, mail, sheets })
}

impl Services {
    /// 抽出を伴うコマンド用。ここで初めてAPIキーを要求する
    fn applier(&self, config: &AppConfig) -> Result<Applier> {
        let provider = OpenAiProvider::new(config.require_completion()?);
        let calendar = Arc::new(GoogleCalendarClient::new(
            self.google.clone(),
            &config.google.calendar_id,
        ));

        Ok(Applier::new(
            Extractor::new(Arc::new(provider)),
            calendar,
            self.mail.clone(),
            Some(config.general.time_zone.clone()),
        ))
    }
}

/// 設定のUTCオフセットでの現在時刻。解釈できなければローカル時刻
fn now_in(utc_offset: &str) -> DateTime<FixedOffset> {
    match parse_timestamp(&format!("2000-01-01T00:00:00{}", utc_offset)) {
        Some(reference) => Utc::now().with_timezone(reference.offset()),
        None => {
            error!("Invalid utc_offset '{}', using local time", utc_offset);
            let now = Local::now();
            now.with_timezone(now.offset())
        }
    }
}

/// 結果を表示する。失敗は理由をそのまま出す
fn report(result: ActionResult) {
    match result {
        Ok(artifact) => println!("{}", artifact),
        Err(failure) => println!("{}", failure),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let args = Args::parse();

    if let Command::InitConfig = args.command {
        config::generate_sample_config(&args.config)?;
        println!("Sample config written to {}", args.config.display());
        return Ok(());
    }

    // 設定ファイルを読み込む
    let config = config::load_config(&args.config).context("Failed to load configuration")?;
    let services = build_services(&config).await?;

    match args.command {
        Command::Schedule { text } => {
            let now = now_in(&config.general.utc_offset);
            let instructions = applier::meeting_instructions(&config.general.utc_offset, now);
            let agent = services.applier(&config)?;
            report(
                agent
                    .run(Operation::CreateEvent, &text.join(" "), &instructions)
                    .await,
            );
        }
        Command::Send { text } => {
            let operation = Operation::SendEmail;
            let instructions = applier::email_instructions(&operation);
            let agent = services.applier(&config)?;
            report(agent.run(operation, &text.join(" "), &instructions).await);
        }
        Command::Draft { text } => {
            let operation = Operation::CreateDraft;
            let instructions = applier::email_instructions(&operation);
            let agent = services.applier(&config)?;
            report(agent.run(operation, &text.join(" "), &instructions).await);
        }
        Command::Inbox { max } => {
            match gmail::read_recent_emails(services.mail.as_ref(), max).await {
                Ok(emails) => print_emails(&emails),
                Err(e) => println!("{}", Failure::from(e)),
            }
        }
        Command::Search { query, max } => {
            match gmail::search_emails(services.mail.as_ref(), &query, max).await {
                Ok(emails) => print_emails(&emails),
                Err(e) => println!("{}", Failure::from(e)),
            }
        }
        Command::Ask { sheet, question } => {
            let agent = services.applier(&config)?;
            let spreadsheet_id = config.require_spreadsheet()?;
            let sheet_name = sheet.unwrap_or_else(|| config.sheets.sheet_name.clone());
            let table = match sheets::read_table(services.sheets.as_ref(), spreadsheet_id, &sheet_name).await {
                Ok(table) => table,
                Err(e) => {
                    println!("{}", Failure::from(e));
                    return Ok(());
                }
            };

            match ActionRequest::answer_question(table, &question.join(" ")) {
                Ok(request) => report(agent.apply(request).await),
                Err(failure) => println!("{}", failure),
            }
        }
        Command::Watch { range, interval } => {
            let spreadsheet_id = config.require_spreadsheet()?;
            let range = range.unwrap_or_else(|| config.sheets.watch_range.clone());
            let interval = Duration::from_secs(interval.unwrap_or(config.sheets.poll_interval_secs));
            watch(&services, spreadsheet_id, &range, interval).await;
        }
        Command::InitConfig => {}
    }

    Ok(())
}

fn print_emails(emails: &[gmail::EmailSnippet]) {
    if emails.is_empty() {
        println!("No messages found.");
        return;
    }
    for email in emails {
        println!("From: {}\nSubject: {}\n{}\n", email.sender, email.subject, email.snippet);
    }
}

/// Ctrl-C まで列を監視する
async fn watch(services: &Services, spreadsheet_id: &str, range: &str, interval: Duration) {
    let source = SheetColumn::new(services.sheets.clone(), spreadsheet_id, range);
    let mut poller = ColumnPoller::new(source, interval);

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    info!("Watching {} every {}s (Ctrl-C to stop)", range, interval.as_secs());
    let result = poller
        .run(cancel, |change| {
            println!(
                "Row {} changed: '{}' -> '{}'",
                change.row(),
                change.previous_value,
                change.current_value
            );
        })
        .await;

    // run が失敗するのは最初の取得だけ
    if let Err(e) = result {
        println!("{}", Failure::from(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use gsuite_agent::credentials::{OAuthFlow, TokenResponse};

    struct NoConsent;

    #[async_trait]
    impl OAuthFlow for NoConsent {
        async fn authorize(&self, _scopes: &[String]) -> Result<TokenResponse> {
            Err(anyhow!("consent is not available in tests"))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
            Err(anyhow!("refresh is not available in tests"))
        }
    }

    fn services() -> (tempfile::TempDir, Services) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.json"), Vec::new(), Box::new(NoConsent));
        (dir, services_from_store(store).unwrap())
    }

    #[test]
    fn mail_and_sheet_services_need_no_completion_key() {
        let config = AppConfig::default();
        assert!(config.completion.api_key.is_empty());

        let (_dir, services) = services();
        let err = services.applier(&config).err().unwrap();
        assert!(err.to_string().contains("completion.api_key"));
    }

    #[test]
    fn applier_is_built_once_a_key_is_configured() {
        let mut config = AppConfig::default();
        config.completion.api_key = "test-key".to_string();

        let (_dir, services) = services();
        assert!(services.applier(&config).is_ok());
    }
}
