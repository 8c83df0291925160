//! 对话服务集成测试：完整历史提交、会话记忆、门店追问、并发轮次策略

use std::sync::Arc;
use std::time::Duration;

use chat_planner::config::{AppConfig, TurnPolicy};
use chat_planner::core::{PlannerError, ServiceBuilder, TurnRequest};
use chat_planner::llm::ScriptedLlmClient;
use chat_planner::memory::Message;
use chat_planner::planner::Terminal;
use chat_planner::tools::{ActionKind, OutletRecord, SqliteOutletStore, ToolName};

fn outlet_store() -> SqliteOutletStore {
    let store = SqliteOutletStore::open_in_memory().unwrap();
    for (name, city, open, close) in [
        ("ZUS Coffee SS 2", "Petaling Jaya", "08:00", "22:00"),
        ("ZUS Coffee KLCC", "Kuala Lumpur", "09:00", "22:00"),
    ] {
        store
            .insert(&OutletRecord {
                name: name.to_string(),
                city: Some(city.to_string()),
                open_time: Some(open.to_string()),
                close_time: Some(close.to_string()),
                ..Default::default()
            })
            .unwrap();
    }
    store
}

async fn service(cfg: AppConfig) -> chat_planner::core::ChatService {
    ServiceBuilder::new(cfg)
        .with_outlet_store(Arc::new(outlet_store()))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_calc_turn_returns_response_actions_and_memory() {
    let service = service(AppConfig::default()).await;
    let outcome = service
        .handle_turn(TurnRequest::new("calc", vec![Message::user("/calc 5 + 10")]))
        .await
        .unwrap();

    assert_eq!(outcome.response.content, "The result for `5 + 10` is **15**.");
    assert_eq!(outcome.terminal, Terminal::Synthesize);
    assert!(outcome.actions.iter().any(|a| a.kind == ActionKind::ToolResult));
    assert_eq!(outcome.memory["intent"], "calculation");
    assert!(service.registry().contains("calc"));
}

#[tokio::test]
async fn test_outlet_follow_up_across_turns() {
    let service = service(AppConfig::default()).await;
    let first = service
        .handle_turn(TurnRequest::new(
            "outlets",
            vec![Message::user("Is there an outlet in SS 2?")],
        ))
        .await
        .unwrap();
    assert!(first.response.content.contains("ZUS Coffee SS 2"));

    let history = vec![
        Message::user("Is there an outlet in SS 2?"),
        first.response.clone(),
        Message::user("What time does it close?"),
    ];
    let second = service
        .handle_turn(TurnRequest::new("outlets", history))
        .await
        .unwrap();
    assert!(second.response.content.contains("22:00"));
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_turn() {
    let service = service(AppConfig::default()).await;
    let err = service
        .handle_turn(TurnRequest::new("bad", vec![Message::assistant("hello")]))
        .await
        .unwrap_err();
    assert!(matches!(err, PlannerError::InvalidRequest(_)));
    assert!(!service.registry().contains("bad"));
}

#[tokio::test]
async fn test_reset_clears_memory() {
    let service = service(AppConfig::default()).await;
    let question = Message::user("Is there an outlet in SS 2?");
    let first = service
        .handle_turn(TurnRequest::new("r", vec![question.clone()]))
        .await
        .unwrap();
    assert!(!first.memory["lastActions"].as_array().unwrap().is_empty());

    assert!(service.reset_session("r").await);
    assert!(!service.reset_session("never-seen").await);
    {
        let slot = service.registry().get_or_create("r");
        let state = slot.lock().await;
        assert!(state.last_actions.is_empty());
        assert!(state.outlets_context.snapshots.is_empty());
        assert!(state.messages.is_empty());
    }

    let second = service
        .handle_turn(TurnRequest::new("r", vec![Message::user("/calc 1+1")]))
        .await
        .unwrap();
    let actions = serde_json::to_value(&second.actions).unwrap();
    assert_eq!(second.memory["lastActions"], actions);
    assert_eq!(second.memory["lastTool"], "calc");
    assert!(second.memory["outletsContext"]["lastRawQuestion"].is_null());
    assert!(second.actions.iter().all(|a| a.tool != Some(ToolName::Outlets)));

    // 清空后同一段历史不再带出之前的门店上下文
    let third = service
        .handle_turn(TurnRequest::new(
            "r",
            vec![question, first.response, Message::user("What time does it close?")],
        ))
        .await
        .unwrap();
    assert!(!serde_json::to_string(&third.actions)
        .unwrap()
        .contains("Previous outlets question"));
}

#[tokio::test]
async fn test_identical_history_yields_identical_actions() {
    let service = service(AppConfig::default()).await;
    let opening = vec![Message::user("Any outlets in KL?")];
    let a = service
        .handle_turn(TurnRequest::new("d", opening.clone()))
        .await
        .unwrap();
    let b = service
        .handle_turn(TurnRequest::new("d", opening.clone()))
        .await
        .unwrap();
    assert_eq!(a.response, b.response);
    assert_eq!(
        serde_json::to_string(&a.actions).unwrap(),
        serde_json::to_string(&b.actions).unwrap()
    );

    let follow_up = vec![
        opening[0].clone(),
        a.response.clone(),
        Message::user("What time does it close?"),
    ];
    let c = service
        .handle_turn(TurnRequest::new("d", follow_up.clone()))
        .await
        .unwrap();
    let d = service
        .handle_turn(TurnRequest::new("d", follow_up))
        .await
        .unwrap();
    assert_eq!(c.response, d.response);
    assert_eq!(
        serde_json::to_string(&c.actions).unwrap(),
        serde_json::to_string(&d.actions).unwrap()
    );
}

#[tokio::test]
async fn test_reject_policy_reports_busy_session() {
    let mut cfg = AppConfig::default();
    cfg.planner.turn_policy = TurnPolicy::Reject;
    let llm = Arc::new(
        ScriptedLlmClient::new([r#"{"intent": "small_talk"}"#, r#"{"message": "Hi!"}"#])
            .with_delay(Duration::from_millis(200)),
    );
    let service = Arc::new(
        ServiceBuilder::new(cfg)
            .with_llm(llm)
            .with_outlet_store(Arc::new(outlet_store()))
            .build()
            .await
            .unwrap(),
    );

    let slow = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .handle_turn(TurnRequest::new("busy", vec![Message::user("hi")]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = service
        .handle_turn(TurnRequest::new("busy", vec![Message::user("hello")]))
        .await
        .unwrap_err();
    assert_eq!(err, PlannerError::SessionBusy("busy".to_string()));
    assert_eq!(slow.await.unwrap().unwrap().response.content, "Hi!");
}

#[tokio::test]
async fn test_queue_policy_serializes_turns() {
    let service = Arc::new(service(AppConfig::default()).await);
    let mut handles = Vec::new();
    for expr in ["1+1", "2+2", "3+3"] {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .handle_turn(TurnRequest::new(
                    "queued",
                    vec![Message::user(format!("/calc {expr}"))],
                ))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}
