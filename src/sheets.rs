use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;
use crate::google_client::GoogleClient;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";

/// 表の1列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub values: Vec<String>,
}

/// 列名から行の値への対応として持つ表データ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// 先頭行を見出しとして表を組み立てる
    ///
    /// 見出しより短い行は空文字で埋め、長い行は見出しの幅で切る。
    /// データ行が無ければ空の表になる。
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let Some((header, data)) = rows.split_first() else {
            return Self::default();
        };
        if data.is_empty() {
            return Self::default();
        }

        let overflowing = data.iter().filter(|row| row.len() > header.len()).count();
        if overflowing > 0 {
            warn!(
                "{} rows have more cells than the {} header columns; extra cells are ignored",
                overflowing,
                header.len()
            );
        }

        let columns = header
            .iter()
            .enumerate()
            .map(|(i, name)| Column {
                name: name.clone(),
                values: data
                    .iter()
                    .map(|row| row.get(i).cloned().unwrap_or_default())
                    .collect(),
            })
            .collect();

        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[String]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn row_count(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() || self.row_count() == 0
    }

    /// プロンプトに埋め込むためのパイプ区切りテキスト
    pub fn render(&self) -> String {
        let mut out = String::new();
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        out.push_str(&names.join(" | "));
        out.push('\n');

        for row in 0..self.row_count() {
            let cells: Vec<&str> = self
                .columns
                .iter()
                .map(|c| c.values.get(row).map(String::as_str).unwrap_or(""))
                .collect();
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
        out
    }
}

/// スプレッドシートサービス
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SheetService: Send + Sync {
    /// 範囲のセル値を行ごとに返す
    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Vec<Vec<String>>, ServiceError>;
}

/// Google Sheets API v4 クライアント
pub struct GoogleSheetsClient {
    client: GoogleClient,
}

impl GoogleSheetsClient {
    pub fn new(client: GoogleClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SheetService for GoogleSheetsClient {
    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Vec<Vec<String>>, ServiceError> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}",
            SHEETS_API_BASE,
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(range)
        );
        let response = self.client.get(&url, &[]).await?;
        let rows = parse_values(&response);
        debug!("Fetched {} rows from {}", rows.len(), range);
        Ok(rows)
    }
}

/// values.get の応答を文字列の行列にする。空の範囲では values が省略される
fn parse_values(response: &Value) -> Vec<Vec<String>> {
    response
        .get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// シート全体を表として読み込む
pub async fn read_table(
    sheets: &dyn SheetService,
    spreadsheet_id: &str,
    sheet_name: &str,
) -> Result<Table, ServiceError> {
    let range = format!("{}!A1:Z1000", sheet_name);
    let rows = sheets.get_values(spreadsheet_id, &range).await?;
    Ok(Table::from_rows(&rows))
}

/// 1列分の値を取得する。空行は空文字になる
pub async fn fetch_column(
    sheets: &dyn SheetService,
    spreadsheet_id: &str,
    range: &str,
) -> Result<Vec<String>, ServiceError> {
    let rows = sheets.get_values(spreadsheet_id, range).await?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().next().unwrap_or_default())
        .collect())
}
