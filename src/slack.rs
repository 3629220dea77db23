//! Slack socket-mode adapter using slack-morphism.

use crate::error::Result;
use crate::{ChannelId, InboundEvent, InboundEventKind};

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Stream of channel events produced by the socket-mode listener.
pub type InboundStream = std::pin::Pin<Box<dyn futures::Stream<Item = InboundEvent> + Send>>;

/// Resolved display names keyed by Slack user id, so each user costs one
/// users.info call per process lifetime.
#[derive(Default)]
pub struct UserCache {
    names: RwLock<HashMap<String, String>>,
}

impl UserCache {
    pub async fn get(&self, user_id: &str) -> Option<String> {
        self.names.read().await.get(user_id).cloned()
    }

    pub async fn insert(&self, user_id: impl Into<String>, name: impl Into<String>) {
        self.names.write().await.insert(user_id.into(), name.into());
    }
}

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct SlackAdapterState {
    event_tx: mpsc::Sender<InboundEvent>,
    bot_token: String,
    bot_user_id: String,
    users: UserCache,
}

/// Slack adapter state.
pub struct SlackAdapter {
    bot_token: String,
    app_token: String,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            app_token: app_token.into(),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a session for making API calls.
    fn create_session(&self) -> anyhow::Result<(Arc<SlackHyperClient>, SlackApiToken)> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(self.bot_token.clone()));
        Ok((client, token))
    }

    /// Connect the socket-mode listener and return the inbound event stream.
    pub async fn start(&self) -> Result<InboundStream> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack connector")?,
        ));

        // Fetch the bot's own user ID so self-messages can be filtered out
        let bot_token = SlackApiToken::new(SlackApiTokenValue(self.bot_token.clone()));
        let session = client.open_session(&bot_token);
        let auth_response = session
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")?;
        let bot_user_id = auth_response.user_id.0.clone();
        tracing::info!(bot_user_id = %bot_user_id, "slack bot user ID resolved");

        let adapter_state = Arc::new(SlackAdapterState {
            event_tx,
            bot_token: self.bot_token.clone(),
            bot_user_id,
            users: UserCache::default(),
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(client.clone())
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }

            tracing::info!("slack socket mode connected");

            tokio::select! {
                exit_code = listener.serve() => {
                    tracing::info!(exit_code, "slack socket mode listener stopped");
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("slack socket mode shutting down");
                    listener.shutdown().await;
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(event_rx);
        Ok(Box::pin(stream))
    }

    /// Post a plain text message to a channel.
    pub async fn post_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        let (client, token) = self.create_session()?;
        let session = client.open_session(&token);

        let req = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        );

        session
            .chat_post_message(&req)
            .await
            .context("failed to send slack message")?;

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }

        tracing::info!("slack adapter shut down");
        Ok(())
    }
}

/// Socket mode push event handler. Must be a `fn` pointer (not a closure)
/// because slack-morphism requires `UserCallbackFunction` which is a fn pointer type.
async fn handle_push_event(
    event: SlackPushEventCallback,
    client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let state_guard = states.read().await;
    let state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    match event.event {
        SlackEventCallbackBody::Message(message) => {
            // Skip message edits/deletes
            if message.subtype.is_some() {
                return Ok(());
            }

            // Skip messages with no user (system messages)
            let Some(user_id) = message.sender.user.as_ref().map(|u| u.0.clone()) else {
                return Ok(());
            };

            // Skip messages from the bot itself
            if user_id == state.bot_user_id {
                return Ok(());
            }

            let Some(channel) = message.origin.channel.as_ref().map(|c| c.0.clone()) else {
                return Ok(());
            };

            let text = message
                .content
                .as_ref()
                .and_then(|c| c.text.clone())
                .unwrap_or_default();

            let sender = resolve_sender(state, &client, &user_id).await;

            forward(
                state,
                InboundEvent {
                    channel: ChannelId::from(channel.as_str()),
                    kind: InboundEventKind::Message { sender, text },
                },
            )
            .await;
        }
        SlackEventCallbackBody::MemberJoinedChannel(joined) => {
            if joined.user.0 == state.bot_user_id {
                forward(
                    state,
                    InboundEvent {
                        channel: ChannelId::from(joined.channel.0.as_str()),
                        kind: InboundEventKind::BotJoined,
                    },
                )
                .await;
            }
        }
        SlackEventCallbackBody::MemberLeftChannel(left) => {
            if left.user.0 == state.bot_user_id {
                forward(
                    state,
                    InboundEvent {
                        channel: ChannelId::from(left.channel.0.as_str()),
                        kind: InboundEventKind::BotRemoved,
                    },
                )
                .await;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Resolve a user id to a display name, preferring the profile real name.
async fn resolve_sender(
    state: &SlackAdapterState,
    client: &SlackHyperClient,
    user_id: &str,
) -> String {
    resolve_with_cache(&state.users, user_id, || async {
        let token = SlackApiToken::new(SlackApiTokenValue(state.bot_token.clone()));
        let session = client.open_session(&token);

        let response = session
            .users_info(&SlackApiUsersInfoRequest::new(SlackUserId(
                user_id.to_string(),
            )))
            .await
            .context("users.info failed")?;

        Ok(response
            .user
            .profile
            .as_ref()
            .and_then(|p| p.real_name.clone())
            .or_else(|| response.user.name.clone())
            .unwrap_or_else(|| user_id.to_string()))
    })
    .await
}

/// Cached name lookup. Only successful lookups are cached; a transient
/// lookup failure falls back to the raw id and is retried on the next
/// message from that user.
async fn resolve_with_cache<F, Fut>(cache: &UserCache, user_id: &str, lookup: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    if let Some(name) = cache.get(user_id).await {
        return name;
    }

    match lookup().await {
        Ok(name) => {
            cache.insert(user_id, name.clone()).await;
            name
        }
        Err(error) => {
            tracing::warn!(%error, user_id = %user_id, "user lookup failed, using raw id");
            user_id.to_string()
        }
    }
}

async fn forward(state: &SlackAdapterState, event: InboundEvent) {
    if let Err(error) = state.event_tx.send(event).await {
        tracing::warn!(%error, "failed to forward slack event");
    }
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_cache_returns_inserted_names() {
        let cache = UserCache::default();
        assert_eq!(cache.get("U1").await, None);

        cache.insert("U1", "Alice").await;
        assert_eq!(cache.get("U1").await.as_deref(), Some("Alice"));

        // Re-insert overwrites
        cache.insert("U1", "Alice Smith").await;
        assert_eq!(cache.get("U1").await.as_deref(), Some("Alice Smith"));
    }

    #[tokio::test]
    async fn failed_lookups_are_not_cached() {
        let cache = UserCache::default();

        let name = resolve_with_cache(&cache, "U1", || async {
            Err(crate::Error::BackendUnavailable("users.info timed out".into()))
        })
        .await;
        assert_eq!(name, "U1");
        assert_eq!(cache.get("U1").await, None);

        // A later successful lookup still lands in the cache.
        let name = resolve_with_cache(&cache, "U1", || async { Ok("Alice".to_string()) }).await;
        assert_eq!(name, "Alice");
        assert_eq!(cache.get("U1").await.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn cached_names_skip_the_lookup() {
        let cache = UserCache::default();
        cache.insert("U1", "Alice").await;

        let name = resolve_with_cache(&cache, "U1", || async {
            panic!("lookup must not run for a cached user");
        })
        .await;
        assert_eq!(name, "Alice");
    }
}
