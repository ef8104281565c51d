//! Holds the conversation, invokes the router, executes tool calls, and surfaces
//! streaming progress, per SPEC_FULL §4.12. The turn-serialization and idempotent-abort
//! design mirrors `IngestionController`'s `cancelled: AtomicBool` + checkpoint pattern
//! rather than inventing a second cancellation mechanism.

use crate::chat::data_source::ChatDataSource;
use crate::errors::{ReverieError, Result};
use crate::event::{ChatEvent, EventHandler};
use crate::functions::FunctionRegistry;
use crate::model::{Conversation, ConversationMessage};
use crate::provider::adapter::{AdapterConfig, AdapterProgress, AdapterResponse, ProviderAuth};
use crate::provider::router::ProviderRouter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Caps the tool-call round trip so a misbehaving model can't wedge a turn forever.
const MAX_TOOL_ITERATIONS: usize = 8;

pub struct ChatOrchestrator {
    conversation: Mutex<Conversation>,
    /// Serializes turns: a second `send_user_message` while one is in flight is
    /// rejected rather than interleaved, per the ordering guarantee in §5.
    turn_permit: Semaphore,
    active_cancel: Mutex<Option<Arc<AtomicBool>>>,
    system_prompt: String,
    router: Arc<ProviderRouter>,
    functions: Arc<FunctionRegistry>,
    data_source: Arc<dyn ChatDataSource>,
    events: Arc<dyn EventHandler>,
    auth: ProviderAuth,
    adapter_config: AdapterConfig,
}

impl ChatOrchestrator {
    pub fn new(
        system_prompt: impl Into<String>,
        router: Arc<ProviderRouter>,
        functions: Arc<FunctionRegistry>,
        data_source: Arc<dyn ChatDataSource>,
        events: Arc<dyn EventHandler>,
        auth: ProviderAuth,
        adapter_config: AdapterConfig,
    ) -> Self {
        ChatOrchestrator {
            conversation: Mutex::new(Conversation::default()),
            turn_permit: Semaphore::new(1),
            active_cancel: Mutex::new(None),
            system_prompt: system_prompt.into(),
            router,
            functions,
            data_source,
            events,
            auth,
            adapter_config,
        }
    }

    pub async fn conversation_snapshot(&self) -> Vec<ConversationMessage> {
        self.conversation.lock().await.messages.clone()
    }

    /// Step 1-5 of §4.12: append the user message, hide suggestions (an embedder
    /// concern signalled by `TurnStarted`), then run the request/tool loop to
    /// completion.
    pub async fn send_user_message(&self, content: impl Into<String>) -> Result<()> {
        {
            let mut conversation = self.conversation.lock().await;
            conversation.push(ConversationMessage::user(content.into()));
        }
        self.run_turn().await
    }

    /// Truncates at `index` (dropping the target message and everything after), then
    /// re-runs from step 2 with the transcript as it now stands.
    pub async fn edit_message(&self, index: usize, new_content: impl Into<String>) -> Result<()> {
        {
            let mut conversation = self.conversation.lock().await;
            conversation.truncate_from(index);
            conversation.push(ConversationMessage::user(new_content.into()));
        }
        self.run_turn().await
    }

    /// Truncates at `index` and re-runs without appending a new user message, so the
    /// prior user turn is replayed against a fresh assistant response.
    pub async fn regenerate_from(&self, index: usize) -> Result<()> {
        {
            let mut conversation = self.conversation.lock().await;
            conversation.truncate_from(index);
        }
        self.run_turn().await
    }

    /// Per §3's data-model invariants: deleting a user message truncates the transcript
    /// from that index onward rather than leaving its replies stranded; deleting an
    /// assistant/tool message removes just that one (plus any trailing tool results an
    /// assistant's removed `tool_calls` would otherwise orphan).
    pub async fn delete_message(&self, index: usize) {
        let mut conversation = self.conversation.lock().await;
        conversation.delete_message(index);
    }

    /// Idempotent: aborting with no turn in flight is a no-op.
    pub async fn abort(&self) {
        if let Some(cancel) = self.active_cancel.lock().await.as_ref() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn run_turn(&self) -> Result<()> {
        let _permit = self
            .turn_permit
            .try_acquire()
            .map_err(|_| ReverieError::lock_acquisition("chat_turn"))?;

        let cancel = Arc::new(AtomicBool::new(false));
        *self.active_cancel.lock().await = Some(cancel.clone());
        self.events.on_chat_event(ChatEvent::TurnStarted).await;

        let result = self.tool_loop(&cancel).await;

        *self.active_cancel.lock().await = None;
        self.events.on_chat_event(ChatEvent::TurnCompleted).await;
        result
    }

    async fn tool_loop(&self, cancel: &Arc<AtomicBool>) -> Result<()> {
        let tools = self.functions.get_enabled_schemas();

        for _ in 0..=MAX_TOOL_ITERATIONS {
            if cancel.load(Ordering::SeqCst) {
                return Err(ReverieError::validation("turn aborted"));
            }

            let messages = self.build_request_messages().await;
            let response = self.call_with_abort(cancel, &messages, &tools).await?;

            if response.message.tool_calls.is_empty() {
                let mut conversation = self.conversation.lock().await;
                conversation.push(ConversationMessage::assistant(response.message.content.clone(), vec![]));
                return Ok(());
            }

            let tool_calls = response.message.tool_calls.clone();
            {
                let mut conversation = self.conversation.lock().await;
                conversation.push(ConversationMessage::assistant(
                    response.message.content.clone(),
                    tool_calls.clone(),
                ));
            }

            for call in &tool_calls {
                if cancel.load(Ordering::SeqCst) {
                    return Err(ReverieError::validation("turn aborted"));
                }
                self.events
                    .on_chat_event(ChatEvent::ToolCallDetected {
                        call_id: call.id.clone(),
                        function_name: call.function_name.clone(),
                    })
                    .await;

                let result_text = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                    Ok(args) => {
                        let streams = self.data_source.streams();
                        let streams_opt = if streams.is_empty() { None } else { Some(streams) };
                        match self.functions.execute(&call.function_name, &args, streams_opt).await {
                            Ok(value) => value.to_string(),
                            Err(err) => format!("{{\"error\": {:?}}}", err.to_string()),
                        }
                    }
                    Err(err) => format!("{{\"error\": \"malformed tool arguments: {err}\"}}"),
                };

                {
                    let mut conversation = self.conversation.lock().await;
                    conversation.push(ConversationMessage::tool_result(call.id.clone(), result_text));
                }
                self.events
                    .on_chat_event(ChatEvent::ToolCallCompleted { call_id: call.id.clone() })
                    .await;
            }
        }

        Err(ReverieError::validation("exceeded maximum tool-call iterations for one turn"))
    }

    async fn build_request_messages(&self) -> Vec<ConversationMessage> {
        let conversation = self.conversation.lock().await;
        let mut messages = vec![
            ConversationMessage::system(self.system_prompt.clone()),
            ConversationMessage::system(self.data_source.data_summary()),
        ];
        messages.extend(conversation.messages.iter().cloned());
        messages
    }

    /// Races the router call against a cancellation poll so `abort()` can interrupt an
    /// in-flight request rather than only suppressing its result.
    async fn call_with_abort(
        &self,
        cancel: &Arc<AtomicBool>,
        messages: &[ConversationMessage],
        tools: &[crate::functions::FunctionSchema],
    ) -> Result<AdapterResponse> {
        let (tx, mut rx) = mpsc::channel::<AdapterProgress>(64);
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                match progress {
                    AdapterProgress::Token(token) => events.on_chat_event(ChatEvent::Token { token }).await,
                    AdapterProgress::Thinking(content) => events.on_chat_event(ChatEvent::Thinking { content }).await,
                }
            }
        });

        let call_future = self
            .router
            .call_provider(&self.auth, &self.adapter_config, messages, tools, Some(tx));
        tokio::pin!(call_future);

        let result = loop {
            tokio::select! {
                outcome = &mut call_future => break outcome,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    if cancel.load(Ordering::SeqCst) {
                        break Err(ReverieError::validation("turn aborted"));
                    }
                }
            }
        };

        let _ = forwarder.await;
        result
    }
}
