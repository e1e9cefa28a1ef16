pub mod http;
pub mod openai_compat;

use async_trait::async_trait;

pub use http::{HttpConfig, RetryRecord, UpstreamError, UpstreamErrorKind};
pub use openai_compat::OpenAiChatClient;

use crate::types::Message;

/// Chat-completion backend. Implementations classify their own failures;
/// an [`UpstreamError`] is the only error the agent loop lets escape to its
/// caller, so a higher layer can fail over to another model profile.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, UpstreamError>;
}
