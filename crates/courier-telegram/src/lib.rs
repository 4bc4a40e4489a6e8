//! Telegram Bot API relay producer (teloxide).
//!
//! The relay bot uploads media into the staging channel; agents then pull the
//! staged message back out and re-send it into a secret chat. The same bot
//! alerts the operator chat about items the retry queue gave up on.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{ChatId, InputFile, Message},
};

use tracing::debug;

use courier_core::{
    domain::{ChannelId, MediaItem, MediaKind, MessageId},
    errors::Error,
    formatting,
    ports::RelayProducer,
    retry::{with_retry, RetryPolicy},
    retry_queue::FailureNotifier,
    store::PendingRetry,
    Result,
};

/// Bot API calls get one retry; rate-limit waits above the policy ceiling fail at once.
fn bot_retry_policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_secs(1))
}

#[derive(Clone)]
pub struct BotRelayProducer {
    bot: Bot,
    username: String,
    retry: RetryPolicy,
}

impl BotRelayProducer {
    /// Build the producer and look up the bot's username.
    pub async fn connect(token: impl Into<String>) -> Result<Self> {
        let bot = Bot::new(token);
        let me = bot.get_me().await.map_err(Self::map_err)?;
        let username = me
            .user
            .username
            .clone()
            .ok_or_else(|| Error::Config("relay bot has no username".to_string()))?;
        debug!(bot = %username, "relay bot ready");
        Ok(Self {
            bot,
            username,
            retry: bot_retry_policy(),
        })
    }

    /// Used for uploads; its `max_wait` bounds how long a rate limit may stall a relay.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Alerts for abandoned items, sent by this bot to `admin_chat_id`.
    pub fn admin_notifier(&self, admin_chat_id: i64) -> BotAdminNotifier {
        BotAdminNotifier {
            bot: self.bot.clone(),
            chat: ChatId(admin_chat_id),
            retry: self.retry,
        }
    }

    fn tg_chat(channel: ChannelId) -> ChatId {
        ChatId(channel.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        match e {
            teloxide::RequestError::RetryAfter(d) => Error::TransientSend {
                reason: "telegram rate limit".to_string(),
                retry_after: Some(d),
            },
            teloxide::RequestError::Network(e) => {
                Error::transient(format!("telegram network error: {e}"))
            }
            other => Error::External(format!("telegram error: {other}")),
        }
    }

    fn input_file(item: &MediaItem) -> InputFile {
        InputFile::memory(item.data.clone()).file_name(item.filename.clone())
    }
}

#[async_trait]
impl RelayProducer for BotRelayProducer {
    fn account(&self) -> &str {
        &self.username
    }

    async fn upload(&self, channel: ChannelId, item: &MediaItem) -> Result<MessageId> {
        let chat = Self::tg_chat(channel);
        let bot = &self.bot;
        let msg: Message = match item.kind {
            MediaKind::Photo => {
                with_retry(self.retry, "relay photo upload", move |_| async move {
                    bot.send_photo(chat, Self::input_file(item))
                        .await
                        .map_err(Self::map_err)
                })
                .await?
            }
            MediaKind::Video => {
                with_retry(self.retry, "relay video upload", move |_| async move {
                    bot.send_video(chat, Self::input_file(item))
                        .supports_streaming(true)
                        .await
                        .map_err(Self::map_err)
                })
                .await?
            }
            MediaKind::Document => {
                with_retry(self.retry, "relay document upload", move |_| async move {
                    bot.send_document(chat, Self::input_file(item))
                        .await
                        .map_err(Self::map_err)
                })
                .await?
            }
        };
        debug!(channel = channel.0, message = msg.id.0, kind = %item.kind, "media staged by relay bot");
        Ok(MessageId(i64::from(msg.id.0)))
    }
}

/// Operator alerts through the relay bot.
#[derive(Clone)]
pub struct BotAdminNotifier {
    bot: Bot,
    chat: ChatId,
    retry: RetryPolicy,
}

#[async_trait]
impl FailureNotifier for BotAdminNotifier {
    async fn delivery_abandoned(&self, retry: &PendingRetry) -> Result<()> {
        let text = formatting::delivery_abandoned(retry);
        let (bot, chat, text) = (&self.bot, self.chat, text.as_str());
        with_retry(self.retry, "admin alert", move |_| async move {
            bot.send_message(chat, text)
                .await
                .map(|_| ())
                .map_err(BotRelayProducer::map_err)
        })
        .await?;
        debug!(chat = chat.0, retry_id = retry.id, "operator alerted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::errors::ErrorKind;

    #[test]
    fn rate_limits_map_to_transient_with_delay() {
        let err = BotRelayProducer::map_err(teloxide::RequestError::RetryAfter(
            Duration::from_secs(3),
        ));
        assert_eq!(err.kind(), ErrorKind::TransientSendFailure);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn flood_wait_above_ceiling_fails_without_sleeping() {
        let started = std::time::Instant::now();
        let mut calls = 0;
        let err = with_retry(bot_retry_policy(), "relay photo upload", |_| {
            calls += 1;
            async {
                Err::<(), _>(BotRelayProducer::map_err(
                    teloxide::RequestError::RetryAfter(Duration::from_secs(86_400)),
                ))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.root().kind(), ErrorKind::TransientSendFailure);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn short_rate_limit_is_retried_once() {
        let policy = bot_retry_policy().with_max_wait(Duration::from_millis(50));
        let mut calls = 0;
        let result = with_retry(policy, "relay photo upload", |attempt| {
            calls += 1;
            async move {
                if attempt == 1 {
                    Err(BotRelayProducer::map_err(
                        teloxide::RequestError::RetryAfter(Duration::from_millis(10)),
                    ))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn channel_ids_pass_through() {
        assert_eq!(
            BotRelayProducer::tg_chat(ChannelId(-1001234567890)),
            ChatId(-1001234567890)
        );
    }
}
