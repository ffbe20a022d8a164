use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionResponseFormat,
        ChatCompletionResponseFormatType, CreateChatCompletionRequest,
    },
    Client,
};
use async_trait::async_trait;
use log::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::CompletionConfig;
use crate::error::ProviderError;

/// 補完プロバイダへのリクエスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// 指示・スキーマ説明・入力文を含むプロンプト
    pub prompt: String,

    /// 期待するJSONオブジェクトの骨組み
    pub schema_hint: String,
}

/// テキスト補完プロバイダ
///
/// 応答は単一のJSONオブジェクトを含むテキストであることを期待する。
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

const SYSTEM_PROMPT: &str = "You are a smart assistant that extracts structured data from text \
and responds in structured format. Respond with exactly one JSON object and nothing else. \
The object must have this shape:";

/// OpenAI互換のチャット補完APIを使うプロバイダ
///
/// `api_base` を差し替えれば Gemini の OpenAI 互換エンドポイントでも動く。
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u16,
}

impl OpenAiProvider {
    pub fn new(config: &CompletionConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(config.api_key.clone());
        if let Some(api_base) = config.endpoint() {
            openai_config = openai_config.with_api_base(api_base);
        }

        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(format!("{}\n{}", SYSTEM_PROMPT, request.schema_hint))
                    .build()
                    .map_err(|e| ProviderError::Request(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(request.prompt.clone())
                    .build()
                    .map_err(|e| ProviderError::Request(e.to_string()))?,
            ),
        ];

        // 同じ入力には同じ出力を返させる
        let chat_request = CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            response_format: Some(ChatCompletionResponseFormat {
                r#type: ChatCompletionResponseFormatType::JsonObject,
            }),
            ..Default::default()
        };

        debug!("Sending completion request to model {}", self.model);
        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or(ProviderError::EmptyResponse)?;

        debug!("Completion response: {}", content);
        Ok(content)
    }
}
