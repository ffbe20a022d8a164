use chrono::{DateTime, FixedOffset};
use log::{info, warn};
use serde_json::json;
use std::fmt;
use std::sync::Arc;

use crate::calendar::{CalendarService, NewEvent};
use crate::error::Failure;
use crate::extractor::Extractor;
use crate::gmail::{MailService, OutgoingMessage};
use crate::schema::{Field, FieldType, Record, Schema};
use crate::sheets::Table;

/// 適用する操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateEvent,
    SendEmail,
    CreateDraft,
    /// 取得済みの表データに対する質問応答
    AnswerQuestion(Table),
}

impl Operation {
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::CreateEvent => "create-event",
            Operation::SendEmail => "send-email",
            Operation::CreateDraft => "create-draft",
            Operation::AnswerQuestion(_) => "answer-question",
        }
    }

    /// この操作が必要とするレコードのスキーマ
    pub fn schema(&self) -> Schema {
        match self {
            Operation::CreateEvent => meeting_schema(),
            Operation::SendEmail | Operation::CreateDraft => email_schema(),
            Operation::AnswerQuestion(_) => question_schema(),
        }
    }
}

/// 会議情報のスキーマ
pub fn meeting_schema() -> Schema {
    Schema::new("meeting")
        .field(Field::new("title", FieldType::String, "Title of the meeting"))
        .field(Field::new(
            "startTime",
            FieldType::Timestamp,
            "Start time of the meeting in ISO 8601 format with an explicit UTC offset",
        ))
        .field(Field::new(
            "endTime",
            FieldType::Timestamp,
            "End time of the meeting in ISO 8601 format with an explicit UTC offset",
        ))
        .field(Field::new("duration_minutes", FieldType::Integer, "Duration of the meeting in minutes").optional())
        .field(Field::new(
            "attendees",
            FieldType::StringList,
            "List of email addresses of attendees (empty if none are mentioned)",
        ))
        .field(Field::new("description", FieldType::String, "Agenda or notes for the meeting").optional())
}

/// メール内容のスキーマ
pub fn email_schema() -> Schema {
    Schema::new("email")
        .field(Field::new("to", FieldType::String, "Email address of the single recipient"))
        .field(Field::new("subject", FieldType::String, "Subject line of the email"))
        .field(Field::new("body", FieldType::String, "Plain-text body of the email"))
}

/// 質問のスキーマ
pub fn question_schema() -> Schema {
    Schema::new("question").field(Field::new("question", FieldType::String, "Question about the table"))
}

/// 質問応答の回答スキーマ
pub fn answer_schema() -> Schema {
    Schema::new("answer")
        .field(Field::new("answer", FieldType::String, "Direct answer to the question"))
        .field(Field::new("notes", FieldType::String, "Caveats or supporting details, empty if none").optional())
}

/// 会議抽出用の指示文
///
/// 相対的な日時（「明日」など）を解決できるよう現在時刻を含める。
pub fn meeting_instructions(utc_offset: &str, now: DateTime<FixedOffset>) -> String {
    format!(
        "You are an assistant that schedules meetings. Extract the meeting details from the input.\n\
         The current date and time is {}. Resolve relative dates against it.\n\
         Express startTime and endTime in ISO 8601 format with the UTC offset {}.\n\
         If no end time or duration is given, assume the meeting lasts one hour.",
        now.format("%Y-%m-%d %H:%M (%A)"),
        utc_offset
    )
}

/// メール抽出用の指示文
pub fn email_instructions(mode: &Operation) -> String {
    let purpose = match mode {
        Operation::CreateDraft => "draft",
        _ => "send",
    };
    format!(
        "You are an assistant that writes emails. Extract the recipient, subject and body of the email \
         the user wants to {} from the input. Write the body in full, ready to be sent.",
        purpose
    )
}

/// 操作の依頼
///
/// 検証済みの `Record` からしか作れない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    operation: Operation,
    record: Record,
}

impl ActionRequest {
    /// 操作に必要なフィールドが揃っているか確認して依頼を作る
    ///
    /// `operation.schema()` で検証したレコードなら必ず成功する。
    pub fn new(operation: Operation, record: Record) -> Result<Self, Failure> {
        for field in operation.schema().fields() {
            match record.get(&field.name) {
                Some(value) if !field.field_type.admits(value) => {
                    return Err(Failure::Validation(field.name.clone()));
                }
                None if field.required => {
                    return Err(Failure::MissingField(field.name.clone()));
                }
                _ => {}
            }
        }
        Ok(Self { operation, record })
    }

    /// 表と質問文から質問応答の依頼を作る
    pub fn answer_question(table: Table, question: &str) -> Result<Self, Failure> {
        if question.trim().is_empty() {
            return Err(Failure::Validation("question".to_string()));
        }
        let record = question_schema().validate(&json!({ "question": question }))?;
        Self::new(Operation::AnswerQuestion(table), record)
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// 操作の成果物
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// 作成した予定へのリンク
    EventLink(String),
    MessageId(String),
    DraftId(String),
    Answer { answer: String, notes: String },
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::EventLink(link) => write!(f, "{}", link),
            Artifact::MessageId(id) => write!(f, "message sent (id {})", id),
            Artifact::DraftId(id) => write!(f, "draft created (id {})", id),
            Artifact::Answer { answer, notes } if notes.is_empty() => write!(f, "{}", answer),
            Artifact::Answer { answer, notes } => write!(f, "{}\nNotes: {}", answer, notes),
        }
    }
}

/// 操作の結果
pub type ActionResult = Result<Artifact, Failure>;

/// 検証済みのレコードを外部サービスへ適用する
///
/// 呼び出しごとに独立しており状態を持たない。失敗しても再試行はしない。
#[derive(Clone)]
pub struct Applier {
    extractor: Extractor,
    calendar: Arc<dyn CalendarService>,
    mail: Arc<dyn MailService>,
    time_zone: Option<String>,
}

impl Applier {
    pub fn new(
        extractor: Extractor,
        calendar: Arc<dyn CalendarService>,
        mail: Arc<dyn MailService>,
        time_zone: Option<String>,
    ) -> Self {
        Self {
            extractor,
            calendar,
            mail,
            time_zone,
        }
    }

    /// 自然文から操作用のレコードを抽出し、そのまま適用する
    pub async fn run(&self, operation: Operation, raw_text: &str, instructions: &str) -> ActionResult {
        let schema = operation.schema();
        let record = self.extractor.extract(raw_text, &schema, instructions).await?;
        self.apply(ActionRequest::new(operation, record)?).await
    }

    pub async fn apply(&self, action: ActionRequest) -> ActionResult {
        let tag = action.operation.tag();
        info!("Applying {}", tag);

        let result = match &action.operation {
            Operation::CreateEvent => self.create_event(&action.record).await,
            Operation::SendEmail => self.deliver(&action.record, false).await,
            Operation::CreateDraft => self.deliver(&action.record, true).await,
            Operation::AnswerQuestion(table) => self.answer(table, &action.record).await,
        };

        match &result {
            Ok(artifact) => info!("{} succeeded: {}", tag, artifact),
            Err(failure) => warn!("{} failed: {}", tag, failure),
        }
        result
    }

    async fn create_event(&self, record: &Record) -> ActionResult {
        let start = record
            .timestamp("startTime")
            .ok_or_else(|| Failure::MissingField("startTime".to_string()))?;
        let end = record
            .timestamp("endTime")
            .ok_or_else(|| Failure::MissingField("endTime".to_string()))?;
        if end <= start {
            return Err(Failure::InvalidInterval);
        }

        let attendees = record.list("attendees").unwrap_or_default().to_vec();
        if let Some(bad) = attendees.iter().find(|a| !is_valid_address(a)) {
            warn!("Rejecting attendee address '{}'", bad);
            return Err(Failure::InvalidAddress);
        }

        let event = NewEvent {
            summary: required_text(record, "title")?.to_string(),
            description: record.text("description").map(str::to_string),
            start,
            end,
            attendees,
            time_zone: self.time_zone.clone(),
        };

        let created = self.calendar.insert_event(&event).await?;
        Ok(Artifact::EventLink(created.html_link.unwrap_or(created.id)))
    }

    async fn deliver(&self, record: &Record, draft: bool) -> ActionResult {
        let to = required_text(record, "to")?.trim();
        if !is_valid_address(to) {
            warn!("Rejecting recipient address '{}'", to);
            return Err(Failure::InvalidAddress);
        }

        // 改行を含む件名はヘッダを追加できてしまう
        let subject = required_text(record, "subject")?;
        if subject.contains(['\r', '\n']) {
            warn!("Rejecting subject containing a line break");
            return Err(Failure::Validation("subject".to_string()));
        }

        let message = OutgoingMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            body: required_text(record, "body")?.to_string(),
        };

        if draft {
            let created = self.mail.create_draft(&message).await?;
            Ok(Artifact::DraftId(created.id))
        } else {
            let sent = self.mail.send_message(&message).await?;
            Ok(Artifact::MessageId(sent.id))
        }
    }

    /// 表データへの質問は、別スキーマでの抽出として実装する
    async fn answer(&self, table: &Table, record: &Record) -> ActionResult {
        if table.is_empty() {
            return Err(Failure::Validation("table".to_string()));
        }
        let question = required_text(record, "question")?;

        let instructions = format!(
            "You are an assistant that helps analyze tabular data. \
             Answer the question using only the table given as input.\n\nQuestion:\n{}",
            question
        );
        let answer = self
            .extractor
            .extract(&table.render(), &answer_schema(), &instructions)
            .await?;

        Ok(Artifact::Answer {
            answer: required_text(&answer, "answer")?.to_string(),
            notes: answer.text("notes").unwrap_or_default().to_string(),
        })
    }
}

fn required_text<'a>(record: &'a Record, name: &str) -> Result<&'a str, Failure> {
    record
        .text(name)
        .ok_or_else(|| Failure::MissingField(name.to_string()))
}

/// メールアドレスとして最低限の形をしているか
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }

    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels
            .iter()
            .all(|label| !label.is_empty() && !label.starts_with('-') && !label.ends_with('-'))
}
