//! Agent runtime tests: turn flow, function dispatch, stage progression, and
//! per-client serialization, all against scripted collaborators.

use async_trait::async_trait;
use lib::agent::{AgentLimits, AgentRuntime, Stage, TurnRequest};
use lib::cache::ManualClock;
use lib::functions::{FunctionExecutor, FunctionOutcome};
use lib::llm::{Classification, CompletionBackend, CompletionError, Composition, FunctionCall};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct MockCompletion {
    classify_calls: AtomicUsize,
    compose_calls: AtomicUsize,
    fail_classify: AtomicBool,
    intent: String,
    function_calls: Vec<FunctionCall>,
    extracted_info: HashMap<String, String>,
}

impl MockCompletion {
    fn with_intent(intent: &str) -> Self {
        Self {
            classify_calls: AtomicUsize::new(0),
            compose_calls: AtomicUsize::new(0),
            fail_classify: AtomicBool::new(false),
            intent: intent.to_string(),
            function_calls: Vec::new(),
            extracted_info: HashMap::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for MockCompletion {
    async fn classify(
        &self,
        _context: &lib::agent::ConversationContext,
    ) -> Result<Classification, CompletionError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_classify.load(Ordering::SeqCst) {
            return Err(CompletionError::Api("503 overloaded".to_string()));
        }
        Ok(Classification {
            intent: self.intent.clone(),
            reply: "Draft reply".to_string(),
            function_calls: self.function_calls.clone(),
            extracted_info: self.extracted_info.clone(),
            tokens_used: 10,
        })
    }

    async fn compose(
        &self,
        _context: &lib::agent::ConversationContext,
        _intent: &str,
        results: &[FunctionOutcome],
    ) -> Result<Composition, CompletionError> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Composition {
            reply: format!("Composed from {} result(s)", results.len()),
            tokens_used: 5,
        })
    }
}

struct MockFunctions {
    invocations: AtomicUsize,
}

#[async_trait]
impl FunctionExecutor for MockFunctions {
    async fn invoke(
        &self,
        _tenant_id: &str,
        name: &str,
        _args: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match name {
            "search_properties" => Ok(serde_json::json!({
                "results": [{ "id": "apt-12", "rent": 2400 }]
            })),
            other => Err(format!("unknown function {}", other)),
        }
    }
}

fn runtime(
    completion: Arc<MockCompletion>,
    functions: Option<Arc<MockFunctions>>,
) -> AgentRuntime {
    let clock = Arc::new(ManualClock::new());
    AgentRuntime::new(
        completion,
        functions.map(|f| f as Arc<dyn FunctionExecutor>),
        Duration::from_secs(300),
        clock,
        AgentLimits {
            completion_timeout: Duration::from_secs(2),
            context_idle: Duration::from_secs(7200),
            max_contexts: 100,
        },
    )
}

fn turn(text: &str, message_id: Option<&str>) -> TurnRequest {
    TurnRequest {
        tenant_id: "t1".to_string(),
        client_key: "+5511999990000".to_string(),
        text: text.to_string(),
        message_id: message_id.map(String::from),
        already_deduped: false,
    }
}

#[tokio::test]
async fn plain_turn_uses_draft_reply_and_records_context() {
    let completion = Arc::new(MockCompletion::with_intent("greeting"));
    let rt = runtime(completion.clone(), None);

    let result = rt.process_message(turn("Oi, tudo bem?", Some("m1"))).await;
    assert_eq!(result.reply, "Draft reply");
    assert_eq!(result.intent, "greeting");
    assert_eq!(completion.compose_calls.load(Ordering::SeqCst), 0);

    let ctx = rt
        .context_snapshot("t1", "+5511999990000")
        .await
        .expect("context exists");
    assert_eq!(ctx.messages.len(), 2);
    assert_eq!(ctx.messages[0].role, "user");
    assert_eq!(ctx.messages[1].role, "assistant");
    assert_eq!(ctx.stage, Stage::Initial);
}

#[tokio::test]
async fn function_turn_composes_from_results_and_advances_stage() {
    let mut completion = MockCompletion::with_intent("search");
    completion.function_calls = vec![FunctionCall {
        name: "search_properties".to_string(),
        arguments: serde_json::json!({ "bedrooms": 2 }),
    }];
    completion
        .extracted_info
        .insert("bedrooms".to_string(), "2".to_string());
    let completion = Arc::new(completion);
    let functions = Arc::new(MockFunctions {
        invocations: AtomicUsize::new(0),
    });
    let rt = runtime(completion.clone(), Some(functions.clone()));

    let result = rt
        .process_message(turn("Tem apartamento de 2 quartos?", Some("m2")))
        .await;
    assert_eq!(result.reply, "Composed from 1 result(s)");
    assert_eq!(result.functions_executed, vec!["search_properties"]);
    assert_eq!(result.tokens_used, 15);
    assert_eq!(functions.invocations.load(Ordering::SeqCst), 1);

    let ctx = rt
        .context_snapshot("t1", "+5511999990000")
        .await
        .expect("context exists");
    assert_eq!(ctx.stage, Stage::Discovery);
    assert_eq!(ctx.extracted_info.get("bedrooms").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn function_requested_without_gateway_still_replies() {
    let mut completion = MockCompletion::with_intent("search");
    completion.function_calls = vec![FunctionCall {
        name: "search_properties".to_string(),
        arguments: serde_json::Value::Null,
    }];
    let completion = Arc::new(completion);
    let rt = runtime(completion.clone(), None);

    let result = rt.process_message(turn("Procuro um apartamento", Some("m3"))).await;
    // The failure outcome still goes through compose; the client gets a reply.
    assert!(!result.reply.is_empty());
    assert!(result.functions_executed.is_empty());
    assert_eq!(completion.compose_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completion_failure_yields_safe_reply() {
    let completion = Arc::new(MockCompletion::with_intent("greeting"));
    completion.fail_classify.store(true, Ordering::SeqCst);
    let rt = runtime(completion.clone(), None);

    let result = rt.process_message(turn("Oi", Some("m4"))).await;
    assert_eq!(result.intent, "unavailable");
    assert!(!result.reply.is_empty());
    assert!(!result.reply.contains("503"));

    let ctx = rt
        .context_snapshot("t1", "+5511999990000")
        .await
        .expect("context exists");
    // The user message and the safe reply are both on record.
    assert_eq!(ctx.messages.len(), 2);
}

#[tokio::test]
async fn duplicate_message_id_is_silent() {
    let completion = Arc::new(MockCompletion::with_intent("greeting"));
    let rt = runtime(completion.clone(), None);

    let first = rt.process_message(turn("Oi", Some("m5"))).await;
    assert!(!first.reply.is_empty());
    let second = rt.process_message(turn("Oi", Some("m5"))).await;
    assert!(second.reply.is_empty());
    assert_eq!(completion.classify_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_turns_for_one_client_never_interleave() {
    let completion = Arc::new(MockCompletion::with_intent("greeting"));
    let rt = Arc::new(runtime(completion, None));

    let mut handles = Vec::new();
    for i in 0..8 {
        let rt = rt.clone();
        handles.push(tokio::spawn(async move {
            rt.process_message(turn(&format!("msg {}", i), Some(&format!("m-{}", i))))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("turn task");
    }

    let ctx = rt
        .context_snapshot("t1", "+5511999990000")
        .await
        .expect("context exists");
    // Each turn appends exactly a user message and a reply, atomically.
    assert_eq!(ctx.messages.len(), 16);
    for pair in ctx.messages.chunks(2) {
        assert_eq!(pair[0].role, "user");
        assert_eq!(pair[1].role, "assistant");
    }
}

#[tokio::test]
async fn clear_context_starts_over() {
    let completion = Arc::new(MockCompletion::with_intent("pricing"));
    let rt = runtime(completion, None);

    let _ = rt.process_message(turn("Quanto custa?", Some("m6"))).await;
    assert!(rt.clear_context("t1", "+5511999990000").await);
    assert!(rt.context_snapshot("t1", "+5511999990000").await.is_none());
    assert!(!rt.clear_context("t1", "+5511999990000").await);
}
