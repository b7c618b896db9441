use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The message or its channel is gone; retrying cannot help.
    #[error("message not found")]
    NotFound,
    #[error("rate limited by chat platform")]
    RateLimited,
    #[error("chat platform unavailable: {0}")]
    Transient(String),
}

/// Outbound edit of an already posted poll message.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn update_message(
        &self,
        guild_id: i64,
        channel_id: i64,
        message_id: i64,
        text: String,
    ) -> Result<(), GatewayError>;
}

/// Gateway that only logs the edits it would send.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogGateway;

#[async_trait]
impl Gateway for LogGateway {
    async fn update_message(
        &self,
        guild_id: i64,
        channel_id: i64,
        message_id: i64,
        text: String,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            guild_id,
            channel_id,
            message_id,
            chars = text.chars().count(),
            "poll message update"
        );
        tracing::debug!(message_id, "{text}");
        Ok(())
    }
}
