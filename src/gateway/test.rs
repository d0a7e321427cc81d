use super::*;
use crate::testing::{create_test_store, MockEngine};
use actix_web::{test, web, App};
use tempfile::TempDir;

const SELF_ADDR: &str = "http://127.0.0.1:8081";
const PEER_B: &str = "http://127.0.0.1:8082";
const PEER_C: &str = "http://127.0.0.1:8083";

fn create_test_router(
    engine: MockEngine,
    ack_policy: AckPolicy,
) -> (CommandRouter, Arc<MockEngine>, Arc<KvStore>, TempDir) {
    let engine = Arc::new(engine);
    let (store, temp_dir) = create_test_store();
    let router = CommandRouter::new(engine.clone(), store.clone(), ack_policy);
    (router, engine, store, temp_dir)
}

fn rejection_kind(reply: &CommandReply) -> Option<RejectionKind> {
    match reply {
        CommandReply::Error(rejection) => Some(rejection.kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_set_rejected_on_every_non_leader_role() {
    for role in [NodeRole::Follower, NodeRole::Candidate, NodeRole::Child] {
        let (router, engine, store, _temp_dir) =
            create_test_router(MockEngine::new(SELF_ADDR, role), AckPolicy::OnBroadcast);

        let reply = router.dispatch(CommandEnvelope::set("1", "x")).await;

        assert_eq!(rejection_kind(&reply), Some(RejectionKind::NotLeader));
        assert!(store.get("1").unwrap().is_none());
        assert_eq!(engine.message_count(), 0);
    }
}

#[tokio::test]
async fn test_leader_set_applies_and_broadcasts_to_children() {
    let (router, engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader).with_peers(&[PEER_B]),
        AckPolicy::OnBroadcast,
    );

    let reply = router.dispatch(CommandEnvelope::set("7", "v7")).await;

    assert_eq!(
        reply,
        CommandReply::Ack(SetAck {
            policy: AckPolicy::OnBroadcast,
            delivered: 1,
            failed: 0,
        })
    );
    assert_eq!(store.get("7").unwrap().as_deref(), Some("v7"));
    assert_eq!(
        engine.messages.lock().unwrap().clone(),
        vec![(
            MessageTarget::Role(NodeRole::Child),
            DataRecord::new("7", "v7")
        )]
    );
}

#[tokio::test]
async fn test_on_broadcast_acks_despite_failures() {
    let (router, _engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader)
            .with_peers(&[PEER_B, PEER_C])
            .with_unreachable(PEER_B)
            .with_unreachable(PEER_C),
        AckPolicy::OnBroadcast,
    );

    let reply = router.dispatch(CommandEnvelope::set("k", "v")).await;

    assert_eq!(
        reply,
        CommandReply::Ack(SetAck {
            policy: AckPolicy::OnBroadcast,
            delivered: 0,
            failed: 2,
        })
    );
}

#[tokio::test]
async fn test_on_quorum_requires_majority() {
    let (router, _engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader)
            .with_peers(&[PEER_B, PEER_C])
            .with_unreachable(PEER_B)
            .with_unreachable(PEER_C),
        AckPolicy::OnQuorum,
    );

    let reply = router.dispatch(CommandEnvelope::set("k", "v")).await;

    assert_eq!(rejection_kind(&reply), Some(RejectionKind::Unconfirmed));
    // The leader's own copy is not rolled back
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn test_on_quorum_acks_with_majority() {
    let (router, _engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader)
            .with_peers(&[PEER_B, PEER_C])
            .with_unreachable(PEER_C),
        AckPolicy::OnQuorum,
    );

    let reply = router.dispatch(CommandEnvelope::set("k", "v")).await;

    assert_eq!(
        reply,
        CommandReply::Ack(SetAck {
            policy: AckPolicy::OnQuorum,
            delivered: 1,
            failed: 1,
        })
    );
}

#[tokio::test]
async fn test_set_without_value_is_rejected() {
    let (router, engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader),
        AckPolicy::OnBroadcast,
    );

    let envelope = CommandEnvelope {
        task: "SET".to_string(),
        key: Some("k".to_string()),
        value: None,
    };
    let reply = router.dispatch(envelope).await;

    assert_eq!(rejection_kind(&reply), Some(RejectionKind::MissingValue));
    assert!(store.get("k").unwrap().is_none());
    assert_eq!(engine.message_count(), 0);
}

#[tokio::test]
async fn test_unknown_task_does_not_mutate_store() {
    let (router, engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader),
        AckPolicy::OnBroadcast,
    );

    for task in ["DELETE", "set", "", "PUT"] {
        let envelope = CommandEnvelope {
            task: task.to_string(),
            key: Some("k".to_string()),
            value: Some("v".to_string()),
        };
        let reply = router.dispatch(envelope).await;
        assert_eq!(rejection_kind(&reply), Some(RejectionKind::UnknownTask));
    }

    assert!(store.get("k").unwrap().is_none());
    assert_eq!(engine.message_count(), 0);
}

#[tokio::test]
async fn test_get_reads_local_store_on_any_role() {
    for role in [NodeRole::Follower, NodeRole::Candidate, NodeRole::Leader] {
        let (router, _engine, store, _temp_dir) =
            create_test_router(MockEngine::new(SELF_ADDR, role), AckPolicy::OnBroadcast);
        store.set("7", "v7").unwrap();
        store.set("7", "v8").unwrap();

        let reply = router.dispatch(CommandEnvelope::get("7")).await;
        assert_eq!(reply, CommandReply::Value(Some("v8".to_string())));
    }
}

#[tokio::test]
async fn test_get_missing_key_is_absent_not_error() {
    let (router, _engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader),
        AckPolicy::OnBroadcast,
    );

    let reply = router.dispatch(CommandEnvelope::get("never-set")).await;
    assert_eq!(reply, CommandReply::Value(None));
    assert!(!reply.is_error());
}

#[tokio::test]
async fn test_store_failure_is_a_distinct_rejection() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = Arc::new(KvStore::open(temp_dir.path().join("db"), 16, 16).unwrap());
    let engine = Arc::new(MockEngine::new(SELF_ADDR, NodeRole::Leader).with_peers(&[PEER_B]));
    let router = CommandRouter::new(engine.clone(), store, AckPolicy::OnBroadcast);

    let reply = router
        .dispatch(CommandEnvelope::set("big", "x".repeat(64)))
        .await;

    assert_eq!(rejection_kind(&reply), Some(RejectionKind::Store));
    assert_eq!(engine.message_count(), 0);
}

#[test]
fn test_reply_wire_format() {
    let value = serde_json::to_value(CommandReply::Value(Some("v".to_string()))).unwrap();
    assert_eq!(value, serde_json::json!({"value": "v"}));

    let absent = serde_json::to_value(CommandReply::Value(None)).unwrap();
    assert_eq!(absent, serde_json::json!({"value": null}));

    let ack = serde_json::to_value(CommandReply::Ack(SetAck {
        policy: AckPolicy::OnQuorum,
        delivered: 2,
        failed: 0,
    }))
    .unwrap();
    assert_eq!(
        ack,
        serde_json::json!({"ack": {"policy": "on_quorum", "delivered": 2, "failed": 0}})
    );

    let error =
        serde_json::to_value(CommandReply::reject(RejectionKind::NotLeader, "no")).unwrap();
    assert_eq!(error["error"]["marker"], ERROR_MARKER);
    assert_eq!(error["error"]["kind"], "not_leader");
}

#[test]
fn test_envelope_decoding() {
    let set: CommandEnvelope =
        serde_json::from_str(r#"{"task":"SET","key":"7","value":"v7"}"#).unwrap();
    assert_eq!(set, CommandEnvelope::set("7", "v7"));

    let get: CommandEnvelope = serde_json::from_str(r#"{"task":"GET","key":"7"}"#).unwrap();
    assert_eq!(get, CommandEnvelope::get("7"));

    let unknown: CommandEnvelope = serde_json::from_str(r#"{"task":"PING"}"#).unwrap();
    assert_eq!(unknown.task, "PING");
    assert!(unknown.key.is_none());

    let empty: CommandEnvelope = serde_json::from_str("{}").unwrap();
    assert_eq!(empty.task, "");
}

#[tokio::test]
async fn test_commands_without_key_are_rejected() {
    let (router, engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader).with_peers(&[PEER_B]),
        AckPolicy::OnBroadcast,
    );

    let get = router
        .dispatch_json(serde_json::json!({"task": "GET"}))
        .await;
    assert_eq!(rejection_kind(&get), Some(RejectionKind::MissingKey));

    let set = router
        .dispatch_json(serde_json::json!({"task": "SET", "value": "v"}))
        .await;
    assert_eq!(rejection_kind(&set), Some(RejectionKind::MissingKey));
    assert_eq!(engine.message_count(), 0);
}

#[tokio::test]
async fn test_any_json_body_gets_a_marker_reply() {
    let (router, engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader).with_peers(&[PEER_B]),
        AckPolicy::OnBroadcast,
    );

    let ping = router
        .dispatch_json(serde_json::json!({"task": "PING"}))
        .await;
    assert_eq!(rejection_kind(&ping), Some(RejectionKind::UnknownTask));

    let empty = router.dispatch_json(serde_json::json!({})).await;
    assert_eq!(rejection_kind(&empty), Some(RejectionKind::UnknownTask));

    let numeric_value = router
        .dispatch_json(serde_json::json!({"task": "SET", "key": "1", "value": 5}))
        .await;
    assert_eq!(rejection_kind(&numeric_value), Some(RejectionKind::Malformed));

    let not_an_object = router.dispatch_json(serde_json::json!([1, 2])).await;
    assert_eq!(rejection_kind(&not_an_object), Some(RejectionKind::Malformed));

    assert!(store.get("1").unwrap().is_none());
    assert_eq!(engine.message_count(), 0);
}

#[actix_web::test]
async fn test_command_endpoint() {
    let (router, _engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader).with_peers(&[PEER_B]),
        AckPolicy::OnBroadcast,
    );
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(router))
            .configure(http::configure_gateway),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/command")
        .set_json(CommandEnvelope::set("7", "v7"))
        .to_request();
    let reply: CommandReply = test::call_and_read_body_json(&app, req).await;
    assert!(matches!(reply, CommandReply::Ack(_)));

    let req = test::TestRequest::post()
        .uri("/command")
        .set_json(CommandEnvelope::get("7"))
        .to_request();
    let reply: CommandReply = test::call_and_read_body_json(&app, req).await;
    assert_eq!(reply, CommandReply::Value(Some("v7".to_string())));
}

#[actix_web::test]
async fn test_status_endpoint() {
    let (router, engine, _store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Follower),
        AckPolicy::OnBroadcast,
    );
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(router))
            .configure(http::configure_gateway),
    )
    .await;

    let req = test::TestRequest::get().uri("/status").to_request();
    let status: NodeStatus = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status.role, NodeRole::Follower);
    assert_eq!(status.term, 3);
    assert!(status.leader.is_none());

    engine.set_role(NodeRole::Leader);
    let req = test::TestRequest::get().uri("/status").to_request();
    let status: NodeStatus = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status.role, NodeRole::Leader);
    assert_eq!(status.leader, Some(SELF_ADDR.parse().unwrap()));

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn test_command_endpoint_answers_unknown_task_with_marker() {
    let (router, _engine, store, _temp_dir) = create_test_router(
        MockEngine::new(SELF_ADDR, NodeRole::Leader),
        AckPolicy::OnBroadcast,
    );
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(router))
            .configure(http::configure_gateway),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/command")
        .set_json(serde_json::json!({"task": "PING"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["marker"], ERROR_MARKER);
    assert_eq!(body["error"]["kind"], "unknown_task");

    let req = test::TestRequest::post()
        .uri("/command")
        .insert_header(("content-type", "application/json"))
        .set_payload("not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["marker"], ERROR_MARKER);
    assert_eq!(body["error"]["kind"], "malformed");

    assert!(store.get("PING").unwrap().is_none());
}
