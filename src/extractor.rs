use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::completion::{CompletionProvider, CompletionRequest};
use crate::error::Failure;
use crate::schema::{Record, Schema};

/// 抽出結果。成功時は検証済みのレコード
pub type ExtractionResult = Result<Record, Failure>;

/// 1回の抽出に必要な入力
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub raw_text: &'a str,
    pub schema: &'a Schema,
    pub instructions: &'a str,
}

impl<'a> ExtractionRequest<'a> {
    pub fn new(raw_text: &'a str, schema: &'a Schema, instructions: &'a str) -> Self {
        Self {
            raw_text,
            schema,
            instructions,
        }
    }

    /// 入力が前提条件を満たしているか確認する
    fn check(&self) -> Result<(), Failure> {
        if self.raw_text.trim().is_empty() {
            return Err(Failure::Validation("raw_text".to_string()));
        }
        if self.schema.is_empty() {
            return Err(Failure::Validation("schema".to_string()));
        }
        Ok(())
    }

    /// 抽出用のプロンプトを構築
    pub fn build_prompt(&self) -> String {
        let mut prompt = String::new();

        let instructions = self.instructions.trim();
        if !instructions.is_empty() {
            prompt.push_str(instructions);
            prompt.push_str("\n\n");
        }

        prompt.push_str("### Fields ###\n");
        prompt.push_str(&self.schema.describe());

        prompt.push_str("\n### Input ###\n");
        prompt.push_str(self.raw_text.trim());
        prompt.push('\n');

        // 出力形式の指定
        prompt.push_str("\nRespond with a single JSON object in the following format:\n");
        prompt.push_str(&self.schema.hint());
        prompt.push('\n');

        prompt
    }

    pub fn completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            prompt: self.build_prompt(),
            schema_hint: self.schema.hint(),
        }
    }
}

/// 自然文からスキーマに沿ったレコードを取り出す
///
/// 再試行はしない。失敗時にプロンプトを変えて呼び直すかは呼び出し側が決める。
#[derive(Clone)]
pub struct Extractor {
    provider: Arc<dyn CompletionProvider>,
}

impl Extractor {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    pub async fn extract(&self, raw_text: &str, schema: &Schema, instructions: &str) -> ExtractionResult {
        self.run(&ExtractionRequest::new(raw_text, schema, instructions)).await
    }

    pub async fn run(&self, request: &ExtractionRequest<'_>) -> ExtractionResult {
        request.check()?;

        let completion = request.completion_request();
        debug!("Extraction prompt for '{}': {}", request.schema.name(), completion.prompt);

        let response = match self.provider.complete(&completion).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Completion provider failed: {}", e);
                return Err(Failure::Provider);
            }
        };

        let object = parse_object(&response).ok_or_else(|| {
            warn!("Could not find a JSON object in provider response: {}", response);
            Failure::Provider
        })?;

        let record = request.schema.validate(&Value::Object(object))?;
        info!(
            "Extracted '{}' record with {} fields",
            record.schema(),
            record.field_names().count()
        );
        Ok(record)
    }
}

/// 応答テキストから最も外側の `{ ... }` を取り出してパースする
///
/// コードフェンスや前置きの文章が付いていても読めるようにする。
pub fn parse_object(response: &str) -> Option<Map<String, Value>> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }

    match serde_json::from_str(&response[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}
