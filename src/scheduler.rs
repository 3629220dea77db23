//! The completion loop: ingests channel events, bootstraps new incidents,
//! and sweeps pending inboxes through the model.

use crate::conversation::ConversationStore;
use crate::docs::{DocMutator, DocsApi};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionBackend, ToolDefinition};
use crate::tools::ToolRegistry;
use crate::{ChannelId, InboundEvent, InboundEventKind, OutboundNotice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// System instruction injected ahead of every channel's history.
const SYSTEM_INSTRUCTIONS: &str = r#"
- You are a chat bot in charge of updating a live google document with the ongoing updates of an event being managed in a channel.
- You should be very concise and stay out of the way.
- All your input should reflect accurately what's being said in the channel you're monitoring, and you should not input any judgment or opinion.
- You should ignore irrelevant conversations.
- You don't have the capability to send messages to the chat, only to call the tools provided to you. Error messages and such copied info should be relayed verbatim, unless overly verbose.
- You must always translate everything to English, even if participants use other languages.
- You will receive the following types of input (between quotes, <something> is a placeholder, the "<>" are not literal):
  - "New channel" (when joining a new channel. assume nothing has been changed until this point, so update the title and other settings as soon as you get any info-)
  - "<user>: <message>" (when a message is received, replace <user> with the user name, and <message> with the message)
  - "<user> joined" (when a user joins the channel)
"#;

/// Synthetic first inbox item for a freshly bootstrapped channel.
const BOOTSTRAP_EVENT: &str = "New channel";

/// Drives all incident conversations on a single task.
///
/// Owns the conversation store exclusively; the Slack adapter only talks to it
/// through the event channel, so there is no shared mutable state.
pub struct Scheduler<C, A> {
    store: ConversationStore,
    completion: C,
    registry: ToolRegistry<A>,
    mutator: Arc<DocMutator<A>>,
    events: mpsc::Receiver<InboundEvent>,
    outbound: mpsc::Sender<OutboundNotice>,
    sweep_interval: Duration,
}

impl<C: CompletionBackend, A: DocsApi> Scheduler<C, A> {
    pub fn new(
        completion: C,
        mutator: Arc<DocMutator<A>>,
        events: mpsc::Receiver<InboundEvent>,
        outbound: mpsc::Sender<OutboundNotice>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store: ConversationStore::new(),
            completion,
            registry: ToolRegistry::new(mutator.clone()),
            mutator,
            events,
            outbound,
            sweep_interval,
        }
    }

    /// Main loop: drain pending events, sweep every inbox, idle briefly.
    ///
    /// Any error from ingestion, the model, or tool dispatch aborts the loop
    /// and propagates to the caller; nothing here retries.
    pub async fn run(mut self) -> Result<()> {
        loop {
            loop {
                match self.events.try_recv() {
                    Ok(event) => self.ingest(event).await?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::info!("event source closed, stopping scheduler");
                        return Ok(());
                    }
                }
            }

            self.sweep().await?;
            tokio::time::sleep(self.sweep_interval).await;
        }
    }

    async fn ingest(&mut self, event: InboundEvent) -> Result<()> {
        match event.kind {
            InboundEventKind::Message { sender, text } => {
                if !self.store.contains(&event.channel) {
                    self.bootstrap(&event.channel).await?;
                }
                self.store
                    .enqueue(&event.channel, format!("{sender}: {text}"));
            }
            InboundEventKind::BotJoined => {
                // Provisioning waits for the first message, so joining an
                // idle channel does not spawn a document.
                tracing::info!(channel_id = %event.channel, "joined channel");
            }
            InboundEventKind::BotRemoved => {
                tracing::info!(
                    channel_id = %event.channel,
                    "removed from channel, conversation retained"
                );
            }
        }
        Ok(())
    }

    /// First contact with a channel: provision a report, register the
    /// conversation, greet the channel, and set the initial title and
    /// priority synchronously.
    async fn bootstrap(&mut self, channel: &ChannelId) -> Result<()> {
        tracing::info!(channel_id = %channel, "bootstrapping new incident channel");

        let document_id = self.mutator.provision_document().await?;
        self.store.create(channel.clone(), document_id.clone());
        self.store.enqueue(channel, BOOTSTRAP_EVENT);

        let notice = OutboundNotice {
            channel: channel.clone(),
            text: format!(
                "Hi! I'll be keeping this report updated: \
                 https://docs.google.com/document/d/{document_id}"
            ),
        };
        // Greeting delivery is part of bootstrap: an undeliverable greeting
        // fails ingestion, like any other error on this path.
        self.outbound.send(notice).await.map_err(|_| {
            Error::Other(anyhow::anyhow!(
                "outbound notice channel closed, cannot greet {channel}"
            ))
        })?;

        self.registry
            .dispatch(&document_id, "update_title", r#"{"title": "Untitled"}"#)
            .await?;
        self.registry
            .dispatch(&document_id, "update_priority", r#"{"priority": 5}"#)
            .await?;

        Ok(())
    }

    /// Process every pending inbox item of every channel to completion.
    async fn sweep(&mut self) -> Result<()> {
        let tools = ToolRegistry::<A>::definitions();

        for channel in self.store.channel_ids() {
            while let Some(text) = self.store.pop(&channel) {
                self.process(&channel, text, &tools).await?;
            }
        }

        Ok(())
    }

    /// One inbox item: extend history, run the model, execute tool calls.
    async fn process(
        &mut self,
        channel: &ChannelId,
        text: String,
        tools: &[ToolDefinition],
    ) -> Result<()> {
        let document_id = self
            .store
            .document_id(channel)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Other(anyhow::anyhow!("channel {channel} has no bound document"))
            })?;

        self.store.append_history(channel, ChatMessage::user(text));

        let history = self.store.history(channel).unwrap_or(&[]).to_vec();
        tracing::debug!(channel_id = %channel, history_len = history.len(), "running model");

        let replies = self
            .completion
            .complete(SYSTEM_INSTRUCTIONS, &history, tools)
            .await?;

        for reply in replies {
            let calls = reply.tool_calls.clone();
            self.store.append_history(channel, reply);

            for call in calls {
                self.registry
                    .dispatch(&document_id, &call.function.name, &call.function.arguments)
                    .await?;
                self.store
                    .append_history(channel, ChatMessage::tool_result(call.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::testing::{template_document, RecordingDocsApi};
    use crate::llm::{Role, ToolCall, ToolFunction};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Completion backend that replays scripted replies and records the
    /// history snapshot of every call.
    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Vec<ChatMessage>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedBackend {
        fn with_replies(replies: Vec<Vec<ChatMessage>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            }
        }
    }

    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _system_prompt: &str,
            history: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<Vec<ChatMessage>> {
            self.seen.lock().unwrap().push(history.to_vec());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![assistant_text("noted")]))
        }
    }

    fn assistant_text(text: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn assistant_tool_call(id: &str, name: &str, arguments: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                kind: "function".to_string(),
                function: ToolFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }],
            tool_call_id: None,
        }
    }

    fn message(channel: &ChannelId, sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            channel: channel.clone(),
            kind: InboundEventKind::Message {
                sender: sender.to_string(),
                text: text.to_string(),
            },
        }
    }

    struct Fixture {
        scheduler: Scheduler<ScriptedBackend, RecordingDocsApi>,
        mutator: Arc<DocMutator<RecordingDocsApi>>,
        outbound_rx: mpsc::Receiver<OutboundNotice>,
        _event_tx: mpsc::Sender<InboundEvent>,
    }

    fn fixture(backend: ScriptedBackend) -> Fixture {
        let api = RecordingDocsApi::with_document(template_document());
        let mutator = Arc::new(DocMutator::new(api, "tpl-1", "folder-1"));
        let (event_tx, event_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let scheduler = Scheduler::new(
            backend,
            mutator.clone(),
            event_rx,
            outbound_tx,
            Duration::from_millis(1),
        );
        Fixture {
            scheduler,
            mutator,
            outbound_rx,
            _event_tx: event_tx,
        }
    }

    #[tokio::test]
    async fn first_message_bootstraps_the_channel() {
        let mut fx = fixture(ScriptedBackend::default());
        let channel = ChannelId::from("C1");

        fx.scheduler
            .ingest(message(&channel, "Alice", "service is down"))
            .await
            .unwrap();

        let api = fx.mutator.api();
        assert_eq!(api.copies.lock().unwrap().as_slice(), ["Incident Report"]);

        let greeting = fx.outbound_rx.try_recv().unwrap();
        assert_eq!(greeting.channel, channel);
        assert!(greeting
            .text
            .contains("https://docs.google.com/document/d/doc-copy-1"));

        // Initial title and priority are applied before any model call.
        let renames = api.renames.lock().unwrap();
        assert!(renames
            .iter()
            .any(|(_, name)| name == "Incident Report - Untitled"));
        let updates = api.updates.lock().unwrap();
        let applied: Vec<String> = updates
            .iter()
            .flat_map(|(_, reqs)| reqs.iter())
            .filter_map(|r| r["replaceNamedRangeContent"]["text"].as_str())
            .map(str::to_string)
            .collect();
        assert!(applied.contains(&"Untitled".to_string()));
        assert!(applied.contains(&"P5".to_string()));

        // Inbox drains most-recent-first, so the message precedes the marker.
        assert_eq!(
            fx.scheduler.store.pop(&channel).as_deref(),
            Some("Alice: service is down")
        );
        assert_eq!(fx.scheduler.store.pop(&channel).as_deref(), Some("New channel"));
    }

    #[tokio::test]
    async fn bootstrap_fails_when_the_greeting_cannot_be_posted() {
        let mut fx = fixture(ScriptedBackend::default());
        let channel = ChannelId::from("C1");

        // Nobody is listening for notices, so the greeting is undeliverable.
        drop(fx.outbound_rx);

        let error = fx
            .scheduler
            .ingest(message(&channel, "Alice", "service is down"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Other(_)));
    }

    #[tokio::test]
    async fn later_messages_do_not_reprovision() {
        let mut fx = fixture(ScriptedBackend::default());
        let channel = ChannelId::from("C1");

        fx.scheduler
            .ingest(message(&channel, "Alice", "first"))
            .await
            .unwrap();
        fx.scheduler
            .ingest(message(&channel, "Bob", "second"))
            .await
            .unwrap();

        assert_eq!(fx.mutator.api().copies.lock().unwrap().len(), 1);
        assert_eq!(fx.outbound_rx.try_recv().unwrap().channel, channel);
        assert!(fx.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_processes_most_recent_arrivals_first() {
        let mut fx = fixture(ScriptedBackend::default());
        let channel = ChannelId::from("C1");

        fx.scheduler
            .ingest(message(&channel, "Alice", "service is down"))
            .await
            .unwrap();
        fx.scheduler
            .ingest(message(&channel, "Bob", "we see 500s"))
            .await
            .unwrap();

        fx.scheduler.sweep().await.unwrap();

        let seen = fx.scheduler.completion.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let last_user = |snapshot: &[ChatMessage]| {
            snapshot
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.content.clone())
                .unwrap()
        };
        assert_eq!(last_user(&seen[0]), "Bob: we see 500s");
        assert_eq!(last_user(&seen[1]), "Alice: service is down");
        assert_eq!(last_user(&seen[2]), "New channel");
    }

    #[tokio::test]
    async fn tool_calls_are_executed_and_acknowledged_in_history() {
        let backend = ScriptedBackend::with_replies(vec![vec![assistant_tool_call(
            "call_7",
            "update_priority",
            r#"{"priority": 2}"#,
        )]]);
        let mut fx = fixture(backend);
        let channel = ChannelId::from("C1");

        fx.scheduler
            .ingest(message(&channel, "Alice", "major outage"))
            .await
            .unwrap();
        fx.scheduler.sweep().await.unwrap();

        let applied: Vec<String> = fx
            .mutator
            .api()
            .updates
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, reqs)| reqs.iter())
            .filter_map(|r| r["replaceNamedRangeContent"]["text"].as_str())
            .map(str::to_string)
            .collect();
        assert!(applied.contains(&"P2".to_string()));

        let history = fx.scheduler.store.history(&channel).unwrap();
        let call_index = history
            .iter()
            .position(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
            .unwrap();
        let result = &history[call_index + 1];
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(result.content.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn unknown_tool_aborts_the_sweep() {
        let backend = ScriptedBackend::with_replies(vec![vec![assistant_tool_call(
            "call_1",
            "resolve_incident",
            "{}",
        )]]);
        let mut fx = fixture(backend);
        let channel = ChannelId::from("C1");

        fx.scheduler
            .ingest(message(&channel, "Alice", "hello"))
            .await
            .unwrap();
        let mutations_after_bootstrap = fx.mutator.api().mutation_count();

        let error = fx.scheduler.sweep().await.unwrap_err();
        assert!(matches!(error, Error::UnknownTool(name) if name == "resolve_incident"));
        assert_eq!(fx.mutator.api().mutation_count(), mutations_after_bootstrap);
    }

    #[tokio::test]
    async fn run_stops_when_the_event_source_closes() {
        let fx = fixture(ScriptedBackend::default());
        drop(fx._event_tx);
        fx.scheduler.run().await.unwrap();
    }
}
