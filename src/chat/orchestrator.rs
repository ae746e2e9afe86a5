//! Chat turn orchestration.
//!
//! A turn moves through context building, one or more model steps (with tool
//! execution between them) and finally the persistence gate. `ChatService::begin`
//! does everything that can still fail with an HTTP error: the credential
//! check, prompt assembly and opening the first model stream. The returned
//! `ActiveTurn` is then driven to completion while its text is streamed out.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::persistence::{PersistOutcome, PersistenceGate};
use crate::chat::request::ChatTurn;
use crate::context::TurnContext;
use crate::error::{ApiError, LlmError};
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionStream, LlmProvider, StreamEvent, ToolCall,
};
use crate::prompt::build_system_prompt;
use crate::retrieval::{DocumentRetriever, format_documents};
use crate::roadmap::UserSettings;
use crate::store::Database;
use crate::tools::ToolRegistry;

/// Default cap on model round trips per turn.
pub const DEFAULT_MAX_STEPS: usize = 5;

/// Name of the credential reported when no provider is configured.
pub const PROVIDER_CREDENTIAL: &str = "OPENAI_API_KEY";

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model finished. Holds every text delta of every step, in order.
    Completed { assistant_text: String },
    /// The client went away before the model finished.
    Cancelled,
    /// The provider failed after streaming began.
    Failed(LlmError),
}

/// Entry point for chat turns. Shared across requests.
pub struct ChatService {
    provider: Option<Arc<dyn LlmProvider>>,
    store: Arc<dyn Database>,
    retriever: Option<Arc<dyn DocumentRetriever>>,
    tools: Arc<ToolRegistry>,
    gate: PersistenceGate,
    max_steps: usize,
}

impl ChatService {
    pub fn new(store: Arc<dyn Database>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider: None,
            gate: PersistenceGate::new(Arc::clone(&store)),
            store,
            retriever: None,
            tools,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// `None` leaves the service running but failing every turn with a
    /// configuration error.
    pub fn with_provider(mut self, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn DocumentRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Build context and open the first model stream.
    pub async fn begin(&self, turn: ChatTurn) -> Result<ActiveTurn, ApiError> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| ApiError::missing_config(PROVIDER_CREDENTIAL))?;

        let ctx = TurnContext::new(turn.user_id.clone());
        let user_message = turn.last_user_message().map(str::to_string);
        info!(
            turn_id = %ctx.turn_id,
            authenticated = ctx.authenticated_user().is_some(),
            messages = turn.messages.len(),
            "Chat turn started"
        );

        let settings = self.resolve_settings(&ctx, turn.user_settings).await;
        let docs = match user_message.as_deref() {
            Some(query) => self.retrieve(&ctx, query).await,
            None => String::new(),
        };
        let system_prompt = build_system_prompt(Some(&docs), settings.as_ref());

        let mut messages = Vec::with_capacity(turn.messages.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(turn.messages);

        let request =
            CompletionRequest::new(messages).with_tools(self.tools.tool_definitions().await);
        let stream = provider.stream_completion(request.clone()).await?;

        Ok(ActiveTurn {
            ctx,
            provider,
            tools: Arc::clone(&self.tools),
            gate: self.gate.clone(),
            request,
            stream,
            step: 1,
            max_steps: self.max_steps,
            user_message,
        })
    }

    /// Settings from the request win; otherwise a signed-in user's stored
    /// settings are used when they can be read.
    async fn resolve_settings(
        &self,
        ctx: &TurnContext,
        from_request: Option<UserSettings>,
    ) -> Option<UserSettings> {
        if from_request.is_some() {
            return from_request;
        }
        let user_id = ctx.authenticated_user()?;
        match self.store.get_user_settings(user_id).await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(turn_id = %ctx.turn_id, error = %e, "Could not load stored settings");
                None
            }
        }
    }

    /// Best-effort documentation lookup. Failures degrade to no docs.
    async fn retrieve(&self, ctx: &TurnContext, query: &str) -> String {
        let Some(retriever) = &self.retriever else {
            return String::new();
        };
        match retriever.search(query).await {
            Ok(hits) => {
                debug!(turn_id = %ctx.turn_id, hits = hits.len(), "Retrieved documentation");
                format_documents(&hits)
            }
            Err(e) => {
                warn!(turn_id = %ctx.turn_id, error = %e, "Retrieval failed, continuing without docs");
                String::new()
            }
        }
    }
}

/// A turn whose first model stream is open.
pub struct ActiveTurn {
    ctx: TurnContext,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    gate: PersistenceGate,
    request: CompletionRequest,
    stream: CompletionStream,
    step: usize,
    max_steps: usize,
    user_message: Option<String>,
}

impl ActiveTurn {
    /// Drive the turn, sending text deltas to `tx` as they arrive.
    ///
    /// A closed receiver cancels the turn. On completion the persistence
    /// gate runs before `tx` is dropped, so the client's stream only ends
    /// once the exchange is stored.
    pub async fn run(mut self, tx: mpsc::Sender<String>) -> TurnOutcome {
        let outcome = self.drive(&tx).await;
        match &outcome {
            TurnOutcome::Completed { assistant_text } => {
                info!(
                    turn_id = %self.ctx.turn_id,
                    steps = self.step,
                    chars = assistant_text.len(),
                    elapsed_ms = self.ctx.elapsed_ms(),
                    "Chat turn completed"
                );
                match &self.user_message {
                    Some(user_message) => {
                        let outcome = self
                            .gate
                            .maybe_persist(self.ctx.user_id.as_deref(), user_message, assistant_text)
                            .await;
                        debug!(turn_id = %self.ctx.turn_id, ?outcome, "Persistence gate");
                    }
                    None => {
                        let outcome = PersistOutcome::Skipped;
                        debug!(turn_id = %self.ctx.turn_id, ?outcome, "No user message to persist");
                    }
                }
            }
            TurnOutcome::Cancelled => {
                info!(
                    turn_id = %self.ctx.turn_id,
                    step = self.step,
                    elapsed_ms = self.ctx.elapsed_ms(),
                    "Client disconnected, turn cancelled"
                );
            }
            TurnOutcome::Failed(e) => {
                tracing::error!(turn_id = %self.ctx.turn_id, step = self.step, error = %e, "Model stream failed");
            }
        }
        outcome
    }

    async fn drive(&mut self, tx: &mpsc::Sender<String>) -> TurnOutcome {
        let mut assistant_text = String::new();
        loop {
            let (step_text, calls) = match self.stream_step(tx).await {
                Ok(step) => step,
                Err(outcome) => return outcome,
            };
            assistant_text.push_str(&step_text);

            if calls.is_empty() {
                return TurnOutcome::Completed { assistant_text };
            }

            self.request
                .messages
                .push(ChatMessage::assistant_with_tool_calls(step_text, calls.clone()));
            for call in &calls {
                debug!(turn_id = %self.ctx.turn_id, step = self.step, tool = %call.name, "Executing tool");
                let result = self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &self.ctx)
                    .await;
                self.request
                    .messages
                    .push(ChatMessage::tool_result(&call.id, &call.name, result));
            }

            if self.step >= self.max_steps {
                warn!(
                    turn_id = %self.ctx.turn_id,
                    max_steps = self.max_steps,
                    "Step budget exhausted, ending turn"
                );
                return TurnOutcome::Completed { assistant_text };
            }

            self.step += 1;
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return TurnOutcome::Cancelled,
                next = self.provider.stream_completion(self.request.clone()) => next,
            };
            match next {
                Ok(stream) => self.stream = stream,
                Err(e) => return TurnOutcome::Failed(e),
            }
        }
    }

    /// Consume the current model stream. Returns the step's text and any tool
    /// calls, or the outcome that ends the turn early.
    async fn stream_step(
        &mut self,
        tx: &mpsc::Sender<String>,
    ) -> Result<(String, Vec<ToolCall>), TurnOutcome> {
        let mut text = String::new();
        let mut calls = Vec::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = tx.closed() => return Err(TurnOutcome::Cancelled),
                event = self.stream.next() => event,
            };
            match event {
                None => break,
                Some(Err(e)) => return Err(TurnOutcome::Failed(e)),
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    text.push_str(&delta);
                    if tx.send(delta).await.is_err() {
                        return Err(TurnOutcome::Cancelled);
                    }
                }
                Some(Ok(StreamEvent::ToolCall(call))) => calls.push(call),
                Some(Ok(StreamEvent::Usage(usage))) => {
                    debug!(
                        turn_id = %self.ctx.turn_id,
                        step = self.step,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Token usage"
                    );
                }
                Some(Ok(StreamEvent::Finish(reason))) => {
                    debug!(turn_id = %self.ctx.turn_id, step = self.step, ?reason, "Model step finished");
                    break;
                }
            }
        }
        Ok((text, calls))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::llm::{FinishReason, Role};
    use crate::roadmap::{ResidencyStatus, StepId};
    use crate::error::RetrievalError;
    use crate::retrieval::ScoredDocument;
    use crate::testing::{RecordingDatabase, Script, ScriptedLlm};
    use crate::tools::ModifyRoadmapTool;

    fn text(s: &str) -> StreamEvent {
        StreamEvent::TextDelta(s.to_string())
    }

    fn finish() -> StreamEvent {
        StreamEvent::Finish(FinishReason::Stop)
    }

    fn tool_call(id: &str, args: serde_json::Value) -> StreamEvent {
        StreamEvent::ToolCall(ToolCall {
            id: id.to_string(),
            name: "modifyRoadmap".to_string(),
            arguments: args,
        })
    }

    fn tool_finish() -> StreamEvent {
        StreamEvent::Finish(FinishReason::ToolUse)
    }

    struct Harness {
        db: Arc<RecordingDatabase>,
        llm: Arc<ScriptedLlm>,
        service: ChatService,
    }

    async fn harness(scripts: Vec<Script>) -> Harness {
        let db = Arc::new(RecordingDatabase::new().await);
        let llm = Arc::new(ScriptedLlm::new(scripts));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(ModifyRoadmapTool::new(db.clone()))).await;
        let service = ChatService::new(db.clone(), tools).with_provider(Some(llm.clone() as Arc<dyn LlmProvider>));
        Harness { db, llm, service }
    }

    fn turn(user_id: Option<&str>, content: &str) -> ChatTurn {
        ChatTurn {
            messages: vec![ChatMessage::user(content)],
            user_id: user_id.map(str::to_string),
            user_settings: None,
        }
    }

    /// Run a turn to the end, collecting everything streamed.
    async fn run_collect(active: ActiveTurn) -> (TurnOutcome, String) {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(active.run(tx));
        let mut streamed = String::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push_str(&chunk);
        }
        (handle.await.unwrap(), streamed)
    }

    #[tokio::test]
    async fn missing_provider_is_configuration_error() {
        let db = Arc::new(RecordingDatabase::new().await);
        let service = ChatService::new(db, Arc::new(ToolRegistry::new()));
        let err = service.begin(turn(None, "hej")).await.err().unwrap();
        assert_eq!(err.client_message(), "OPENAI_API_KEY not configured");
    }

    #[tokio::test]
    async fn provider_failure_before_streaming_is_an_error() {
        let h = harness(vec![]).await;
        let err = h.service.begin(turn(None, "hej")).await.err().unwrap();
        assert!(matches!(err, ApiError::Provider(_)));
    }

    #[tokio::test]
    async fn streams_text_and_persists_for_signed_in_user() {
        let h = harness(vec![Script::events(vec![text("Go to "), text("Borgerservice."), finish()])]).await;
        let active = h.service.begin(turn(Some("u1"), "Where do I get a CPR?")).await.unwrap();
        let (outcome, streamed) = run_collect(active).await;

        assert_eq!(streamed, "Go to Borgerservice.");
        assert!(matches!(outcome, TurnOutcome::Completed { ref assistant_text } if assistant_text == "Go to Borgerservice."));
        assert_eq!(
            h.db.saved_pairs(),
            vec![(
                "u1".to_string(),
                "Where do I get a CPR?".to_string(),
                "Go to Borgerservice.".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn guest_turn_is_not_persisted() {
        for user in [None, Some(""), Some("  ")] {
            let h = harness(vec![Script::events(vec![text("Hej!"), finish()])]).await;
            let active = h.service.begin(turn(user, "hi")).await.unwrap();
            let (outcome, _) = run_collect(active).await;
            assert!(matches!(outcome, TurnOutcome::Completed { .. }));
            assert!(h.db.saved_pairs().is_empty());
        }
    }

    #[tokio::test]
    async fn system_prompt_leads_and_carries_context() {
        let h = harness(vec![Script::events(vec![text("ok"), finish()])]).await;
        let mut t = turn(None, "hi");
        t.user_settings = Some(UserSettings {
            display_name: Some("Ana".to_string()),
            residency_status: Some(ResidencyStatus::NonEuCitizen),
            ..Default::default()
        });
        let active = h.service.begin(t).await.unwrap();
        run_collect(active).await;

        let requests = h.llm.requests();
        let first = &requests[0];
        assert_eq!(first.messages[0].role, Role::System);
        assert!(first.messages[0].content.contains("- Name: Ana"));
        assert_eq!(first.messages[1], ChatMessage::user("hi"));
        assert_eq!(first.tools.len(), 1);
        assert_eq!(first.tools[0].name, "modifyRoadmap");
    }

    #[tokio::test]
    async fn stored_settings_used_when_request_has_none() {
        let h = harness(vec![Script::events(vec![text("ok"), finish()])]).await;
        h.db.update_user_settings(
            "u1",
            &crate::roadmap::SettingsPatch {
                display_name: Some(Some("Bo".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let active = h.service.begin(turn(Some("u1"), "hi")).await.unwrap();
        run_collect(active).await;
        assert!(h.llm.requests()[0].messages[0].content.contains("- Name: Bo"));
    }

    /// Retriever returning canned documents, or failing, and recording queries.
    struct StubRetriever {
        docs: Option<Vec<ScoredDocument>>,
        queries: std::sync::Mutex<Vec<String>>,
    }

    impl StubRetriever {
        fn new(docs: Option<Vec<ScoredDocument>>) -> Arc<Self> {
            Arc::new(Self {
                docs,
                queries: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl DocumentRetriever for StubRetriever {
        async fn search(&self, query: &str) -> Result<Vec<ScoredDocument>, RetrievalError> {
            self.queries.lock().unwrap().push(query.to_string());
            self.docs.clone().ok_or_else(|| RetrievalError::SearchFailed {
                reason: "embedding endpoint unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn retrieved_docs_reach_the_system_prompt() {
        let Harness { llm, service, .. } =
            harness(vec![Script::events(vec![text("ok"), finish()])]).await;
        let retriever = StubRetriever::new(Some(vec![ScoredDocument {
            id: "d1".to_string(),
            content: "Book a CPR appointment at International House.".to_string(),
            similarity: 0.91,
        }]));
        let service = service.with_retriever(retriever.clone());

        let active = service.begin(turn(None, "How do I get a CPR number?")).await.unwrap();
        let (outcome, _) = run_collect(active).await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        assert_eq!(
            *retriever.queries.lock().unwrap(),
            vec!["How do I get a CPR number?".to_string()]
        );
        let system = &llm.requests()[0].messages[0].content;
        assert!(system.contains(
            "RELEVANT DOCUMENTATION:\nBook a CPR appointment at International House."
        ));
    }

    #[tokio::test]
    async fn failing_retriever_still_completes_the_turn() {
        let Harness { llm, service, .. } =
            harness(vec![Script::events(vec![text("Try Borgerservice."), finish()])]).await;
        let service = service.with_retriever(StubRetriever::new(None));

        let active = service.begin(turn(None, "CPR?")).await.unwrap();
        let (outcome, streamed) = run_collect(active).await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(streamed, "Try Borgerservice.");
        assert!(!llm.requests()[0].messages[0].content.contains("RELEVANT DOCUMENTATION"));
    }

    #[tokio::test]
    async fn tool_round_trip_mutates_settings_and_continues() {
        let h = harness(vec![
            Script::events(vec![
                text("Let me update that. "),
                tool_call("call_1", json!({ "action": "mark_complete", "stepId": "housing" })),
                tool_finish(),
            ]),
            Script::events(vec![text("Done!"), finish()]),
        ])
        .await;
        let active = h.service.begin(turn(Some("u1"), "I found an apartment")).await.unwrap();
        let (outcome, streamed) = run_collect(active).await;

        assert_eq!(streamed, "Let me update that. Done!");
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let settings = h.db.get_user_settings("u1").await.unwrap();
        assert!(settings.is_completed(StepId::Housing));

        let requests = h.llm.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.tool_calls.len(), 1);
        let tool_msg = second.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("Marked 'housing' as complete."));

        let saved = h.db.saved_pairs();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].2, "Let me update that. Done!");
    }

    #[tokio::test]
    async fn guest_tool_call_gets_sign_in_message() {
        let h = harness(vec![
            Script::events(vec![
                tool_call("c", json!({ "action": "hide", "stepId": "health" })),
                tool_finish(),
            ]),
            Script::events(vec![text("Please sign in."), finish()]),
        ])
        .await;
        let active = h.service.begin(turn(None, "hide health")).await.unwrap();
        run_collect(active).await;
        let requests = h.llm.requests();
        let tool_msg = requests[1].messages.last().unwrap();
        assert!(tool_msg.content.contains("not signed in"));
    }

    #[tokio::test]
    async fn step_budget_caps_model_calls() {
        let looping = |id: &str| {
            Script::events(vec![
                tool_call(id, json!({ "action": "show", "stepId": "visa" })),
                tool_finish(),
            ])
        };
        let db = Arc::new(RecordingDatabase::new().await);
        let llm = Arc::new(ScriptedLlm::new(vec![
            looping("a"),
            looping("b"),
            looping("c"),
            looping("d"),
        ]));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(ModifyRoadmapTool::new(db.clone()))).await;
        let service = ChatService::new(db.clone(), tools)
            .with_provider(Some(llm.clone() as Arc<dyn LlmProvider>))
            .with_max_steps(2);

        let active = service.begin(turn(Some("u1"), "loop")).await.unwrap();
        let (outcome, _) = run_collect(active).await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn mid_stream_error_skips_persistence() {
        let h = harness(vec![Script {
            events: vec![
                Ok(text("partial")),
                Err(LlmError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason: "connection reset".to_string(),
                }),
            ],
            hang: false,
        }])
        .await;
        let active = h.service.begin(turn(Some("u1"), "hi")).await.unwrap();
        let (outcome, streamed) = run_collect(active).await;
        assert_eq!(streamed, "partial");
        assert!(matches!(outcome, TurnOutcome::Failed(_)));
        assert!(h.db.saved_pairs().is_empty());
    }

    #[tokio::test]
    async fn disconnect_cancels_and_skips_persistence() {
        let h = harness(vec![Script::events(vec![text("first")]).then_hang()]).await;
        let active = h.service.begin(turn(Some("u1"), "hi")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(active.run(tx));
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("turn should stop after disconnect")
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert!(h.db.saved_pairs().is_empty());
    }
}
