mod common;

use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::NaiveDate;
use serde_json::json;

use common::{
    acquire_db_lock, body_to_json, expect_status, sse_events, ScriptedRound, TestApp,
};
use vitalog::chat::ChatService;
use vitalog::error::AppError;
use vitalog::llm::ChatEvent;

fn service_err(err: AppError) -> anyhow::Error {
    anyhow::anyhow!("service error: {err:?}")
}

#[tokio::test]
async fn session_crud_and_cascade_delete() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;

    let response = app
        .post_json("/api/v1/chat/sessions", &json!({ "user_id": user_id }))
        .await?;
    expect_status(&response, StatusCode::CREATED)?;
    let session = body_to_json(response.into_body()).await?;
    let session_id = session["id"].as_str().unwrap().to_string();
    assert!(session["title"].is_null());

    // One exchange so the session has a message row.
    app.llm().script_rounds(vec![ScriptedRound::Round {
        deltas: vec!["hello!"],
        tool_calls: vec![],
    }]);
    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{session_id}/messages"),
            &json!({ "content": "hi" }),
        )
        .await?;
    expect_status(&response, StatusCode::OK)?;
    let _ = sse_events(response.into_body()).await?;

    let response = app.get(&format!("/api/v1/chat/sessions/{session_id}")).await?;
    expect_status(&response, StatusCode::OK)?;
    let detail = body_to_json(response.into_body()).await?;
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    // First user message auto-fills the title.
    assert_eq!(detail["title"], "hi");

    let response = app.delete(&format!("/api/v1/chat/sessions/{session_id}")).await?;
    expect_status(&response, StatusCode::NO_CONTENT)?;

    let response = app.get(&format!("/api/v1/chat/sessions/{session_id}")).await?;
    expect_status(&response, StatusCode::NOT_FOUND)?;

    let orphaned: i64 = app
        .with_conn(move |conn| {
            use diesel::dsl::count_star;
            use diesel::prelude::*;
            use vitalog::schema::chat_messages::dsl::*;
            chat_messages
                .select(count_star())
                .first(conn)
                .map_err(Into::into)
        })
        .await?;
    assert_eq!(orphaned, 0, "messages must cascade with the session");

    Ok(())
}

#[tokio::test]
async fn tool_grounded_answer_round_trip() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;
    app.seed_lab(
        user_id,
        "HbA1c",
        None,
        "5.8",
        "%",
        Some("normal"),
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
    )
    .await?;

    let response = app
        .post_json("/api/v1/chat/sessions", &json!({ "user_id": user_id }))
        .await?;
    let session = body_to_json(response.into_body()).await?;
    let session_id = session["id"].as_str().unwrap().to_string();

    app.llm().script_rounds(vec![
        ScriptedRound::Round {
            deltas: vec![],
            tool_calls: vec![("get_recent_labs", json!({"test_name": "HbA1c", "days": 600}))],
        },
        ScriptedRound::Round {
            deltas: vec!["Your most recent HbA1c was ", "5.8 % on 2025-03-01 (normal)."],
            tool_calls: vec![],
        },
    ]);

    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{session_id}/messages"),
            &json!({ "content": "What was my last HbA1c?" }),
        )
        .await?;
    expect_status(&response, StatusCode::OK)?;
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/event-stream"));

    let events = sse_events(response.into_body()).await?;

    let tool_calls: Vec<_> = events
        .iter()
        .filter(|e| e["type"] == "tool_call")
        .collect();
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0]["name"], "get_recent_labs");

    let tool_results: Vec<_> = events
        .iter()
        .filter(|e| e["type"] == "tool_result")
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert!(tool_results[0]["result"].as_str().unwrap().contains("5.8"));

    let content: String = events
        .iter()
        .filter(|e| e["type"] == "content")
        .map(|e| e["content"].as_str().unwrap())
        .collect();
    assert!(content.contains("5.8"));

    let done_count = events.iter().filter(|e| e["type"] == "done").count();
    assert_eq!(done_count, 1);
    assert_eq!(events.last().unwrap()["type"], "done");

    // Read the session back: one user turn, one assistant turn whose
    // metadata records the call with arguments and result.
    let response = app.get(&format!("/api/v1/chat/sessions/{session_id}")).await?;
    let detail = body_to_json(response.into_body()).await?;
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert!(messages[1]["content"].as_str().unwrap().contains("5.8"));

    let recorded = &messages[1]["metadata"]["tool_calls"][0];
    assert_eq!(recorded["tool"], "get_recent_labs");
    assert_eq!(recorded["arguments"]["test_name"], "HbA1c");
    assert!(recorded["result"].as_str().unwrap().contains("5.8"));

    Ok(())
}

#[tokio::test]
async fn concurrent_stream_is_rejected_without_perturbing_the_first() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;

    let service = ChatService::new(app.state.clone());
    let session = service.create_session(user_id, None).map_err(service_err)?;

    app.llm().script_rounds(vec![ScriptedRound::Drip("tick ")]);
    let mut first = service
        .send_message(&session, "stream one".to_string())
        .await
        .map_err(service_err)?;

    // The first stream is live.
    let event = first.recv().await.expect("first stream yields events");
    assert!(matches!(event, ChatEvent::Content { .. }));

    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{}/messages", session.id),
            &json!({ "content": "stream two" }),
        )
        .await?;
    expect_status(&response, StatusCode::CONFLICT)?;

    // Still streaming after the rejected request.
    let event = first.recv().await.expect("first stream still yields events");
    assert!(matches!(event, ChatEvent::Content { .. }));

    drop(first);
    Ok(())
}

#[tokio::test]
async fn gateway_error_persists_no_assistant_turn() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;

    let response = app
        .post_json("/api/v1/chat/sessions", &json!({ "user_id": user_id }))
        .await?;
    let session = body_to_json(response.into_body()).await?;
    let session_id = session["id"].as_str().unwrap().to_string();

    app.llm()
        .script_rounds(vec![ScriptedRound::Fail("inference server unreachable")]);
    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{session_id}/messages"),
            &json!({ "content": "hello?" }),
        )
        .await?;
    let events = sse_events(response.into_body()).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");

    let response = app.get(&format!("/api/v1/chat/sessions/{session_id}")).await?;
    let detail = body_to_json(response.into_body()).await?;
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1, "only the user turn survives an error");
    assert_eq!(messages[0]["role"], "user");

    // The stream guard is released; a retry can start immediately.
    app.llm().script_rounds(vec![ScriptedRound::Round {
        deltas: vec!["recovered"],
        tool_calls: vec![],
    }]);
    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{session_id}/messages"),
            &json!({ "content": "retry" }),
        )
        .await?;
    let events = sse_events(response.into_body()).await?;
    assert_eq!(events.last().unwrap()["type"], "done");

    Ok(())
}

#[tokio::test]
async fn client_disconnect_cancels_without_persisting() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;

    let service = ChatService::new(app.state.clone());
    let session = service.create_session(user_id, None).map_err(service_err)?;

    app.llm().script_rounds(vec![ScriptedRound::Drip("partial ")]);
    let mut events = service
        .send_message(&session, "tell me everything".to_string())
        .await
        .map_err(service_err)?;

    let first = events.recv().await.expect("stream yields a content event");
    assert!(matches!(first, ChatEvent::Content { .. }));

    // Client goes away mid-stream.
    drop(events);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(app.llm().was_cancelled(), "gateway must observe cancellation");

    let session_id = session.id;
    let messages = service.get_messages(session_id).map_err(service_err)?;
    assert_eq!(messages.len(), 1, "no assistant row after cancellation");
    assert_eq!(messages[0].role, "user");

    // Guard released: the next message streams normally.
    app.llm().script_rounds(vec![ScriptedRound::Round {
        deltas: vec!["fresh answer"],
        tool_calls: vec![],
    }]);
    let mut retry = service
        .send_message(&session, "again".to_string())
        .await
        .map_err(service_err)?;
    let mut saw_done = false;
    while let Some(event) = retry.recv().await {
        if matches!(event, ChatEvent::Done) {
            saw_done = true;
        }
    }
    assert!(saw_done);

    Ok(())
}

#[tokio::test]
async fn rejects_empty_content_and_unknown_session() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app.insert_user("casey").await?;

    let response = app
        .post_json("/api/v1/chat/sessions", &json!({ "user_id": user_id }))
        .await?;
    let session = body_to_json(response.into_body()).await?;
    let session_id = session["id"].as_str().unwrap();

    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{session_id}/messages"),
            &json!({ "content": "   " }),
        )
        .await?;
    expect_status(&response, StatusCode::BAD_REQUEST)?;

    let response = app
        .post_json(
            &format!("/api/v1/chat/sessions/{}/messages", uuid::Uuid::new_v4()),
            &json!({ "content": "hello" }),
        )
        .await?;
    expect_status(&response, StatusCode::NOT_FOUND)?;

    Ok(())
}
