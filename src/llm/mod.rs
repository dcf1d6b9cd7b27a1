pub mod yandexgpt;

pub use yandexgpt::{LlmClient, LlmConfig, LlmError, LlmMessage};

use async_trait::async_trait;

/// Per-call key and folder come from the seller's credential.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        api_key: Option<&str>,
        folder: Option<&str>,
        messages: &[LlmMessage],
    ) -> Result<String, LlmError>;
}
