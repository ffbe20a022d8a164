use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;
use crate::sheets::{fetch_column, SheetService};

/// 列内のセルの変化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// 0始まりの位置
    pub index: usize,
    pub previous_value: String,
    pub current_value: String,
}

impl ChangeNotification {
    /// シート上の行番号（1始まり）
    pub fn row(&self) -> usize {
        self.index + 1
    }
}

/// 監視の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    /// 最後に取得した列の内容を基準値として持つ
    Watching { baseline: Vec<String> },
}

/// 2つの列を位置ごとに比較する
///
/// 短い方は空文字で埋めて比較するので、追加・削除された行も変化として報告される。
/// 結果は位置の昇順。
pub fn positional_diff(previous: &[String], current: &[String]) -> Vec<ChangeNotification> {
    let len = previous.len().max(current.len());
    (0..len)
        .filter_map(|index| {
            let before = previous.get(index).map(String::as_str).unwrap_or("");
            let after = current.get(index).map(String::as_str).unwrap_or("");
            (before != after).then(|| ChangeNotification {
                index,
                previous_value: before.to_string(),
                current_value: after.to_string(),
            })
        })
        .collect()
}

/// 監視対象の列
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ColumnSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<String>, ServiceError>;
}

/// スプレッドシートの1列
pub struct SheetColumn {
    sheets: Arc<dyn SheetService>,
    spreadsheet_id: String,
    range: String,
}

impl SheetColumn {
    pub fn new(sheets: Arc<dyn SheetService>, spreadsheet_id: &str, range: &str) -> Self {
        Self {
            sheets,
            spreadsheet_id: spreadsheet_id.to_string(),
            range: range.to_string(),
        }
    }
}

#[async_trait]
impl ColumnSource for SheetColumn {
    async fn fetch(&self) -> Result<Vec<String>, ServiceError> {
        fetch_column(self.sheets.as_ref(), &self.spreadsheet_id, &self.range).await
    }
}

/// 列を一定間隔で取得し、前回との差分を通知する
pub struct ColumnPoller<S: ColumnSource> {
    source: S,
    interval: Duration,
    state: PollerState,
}

impl<S: ColumnSource> ColumnPoller<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            interval,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// 最初の取得結果を基準値にして監視を始める。この時点では通知しない
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        let baseline = self.source.fetch().await?;
        info!("Watching column with {} rows", baseline.len());
        self.state = PollerState::Watching { baseline };
        Ok(())
    }

    /// 1回分の取得と比較
    ///
    /// 取得に失敗した場合は基準値を変えずにエラーを返す。
    /// 監視開始前に呼ばれた場合は `start` と同じ動作をして空の差分を返す。
    pub async fn tick(&mut self) -> Result<Vec<ChangeNotification>, ServiceError> {
        if self.state == PollerState::Idle {
            self.start().await?;
            return Ok(Vec::new());
        }

        let current = self.source.fetch().await?;
        let changes = match &self.state {
            PollerState::Watching { baseline } => positional_diff(baseline, &current),
            PollerState::Idle => Vec::new(),
        };
        if !changes.is_empty() {
            debug!("Detected {} changed cells", changes.len());
        }

        self.state = PollerState::Watching { baseline: current };
        Ok(changes)
    }

    /// キャンセルされるまで監視を続ける
    ///
    /// 通知は検出順にコールバックへ渡す。取得の失敗はログに残して次の周期へ進む。
    /// 待機中にキャンセルされると `Idle` に戻って終了する。
    pub async fn run<F>(&mut self, cancel: CancellationToken, mut on_change: F) -> Result<(), ServiceError>
    where
        F: FnMut(&ChangeNotification),
    {
        if matches!(self.state, PollerState::Idle) {
            self.start().await?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Column watch cancelled");
                    self.state = PollerState::Idle;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.tick().await {
                Ok(changes) => changes.iter().for_each(&mut on_change),
                Err(e) => warn!("Failed to fetch watched column: {}", e),
            }
        }
    }
}
