//! End-to-end scenarios through the full pipeline: policy, tunnels, the
//! approval gate, forwarding, and the audit trail.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;

use common::{base_config, connections, count_events, harness, postgres_connection, spawn_echo_backend};

#[tokio::test]
async fn connect_without_role_overlap_is_403_and_creates_no_tunnel() {
    // GIVEN: db-prod allows only dba
    let mut config = base_config();
    config.connections = connections(vec![(
        "db-prod",
        postgres_connection("db:5432", &["dba"], false, &["select *"]),
    )]);
    let h = harness(config).await;

    // WHEN: eve (intern) requests a tunnel
    let token = h.login("eve", "eve-pw").await;
    let (status, _) = h
        .request("POST", "/api/connect/db-prod", Some(&token), None)
        .await;

    // THEN: 403, zero tunnels, and a denial in the audit trail
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(h.state.registry.active_count(), 0);

    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "tunnel.denied"), 1);
    assert_eq!(count_events(&records, "tunnel.created"), 0);
}

#[tokio::test]
async fn unknown_connection_is_404() {
    let h = harness(base_config()).await;
    let token = h.login("alice", "alice-pw").await;
    let (status, _) = h
        .request("POST", "/api/connect/no-such-db", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approved_operation_is_forwarded_with_pending_and_allowed_records() {
    // GIVEN: an approval-gated connection backed by a live echo server
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.approval.timeout = Duration::from_secs(5);
    config.connections = connections(vec![(
        "db-approved",
        postgres_connection(&backend, &["dba"], true, &["select *"]),
    )]);
    let h = harness(config).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db-approved", &token, None).await;

    // WHEN: a whitelisted operation is submitted (it blocks in the gate)
    let proxy = {
        let h_router = h.router.clone();
        let token = token.clone();
        let tunnel_id = tunnel_id.clone();
        tokio::spawn(async move {
            use axum::body::{Body, to_bytes};
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method("POST")
                .uri(format!("/api/proxy/{tunnel_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from("SELECT 1"))
                .unwrap();
            let response = h_router.oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, bytes.to_vec())
        })
    };

    // AND: a mock approver answers the pending approval via the callback
    let approval_id = loop {
        let ids = h.state.gate.pending_for_tunnel(&tunnel_id);
        if let Some(id) = ids.first() {
            break id.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let (status, _) = h
        .request(
            "POST",
            &format!("/api/approvals/{approval_id}"),
            Some("approver-secret"),
            Some(serde_json::json!({"decision": "approved", "approver": "sec-oncall"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // THEN: the operation resumes, is forwarded, and the response comes back
    let (status, body) = proxy.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"SELECT 1");

    // and the trail holds the pending record plus the allowed decision
    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "approval.pending"), 1);
    assert_eq!(count_events(&records, "operation.allowed"), 1);
    assert_eq!(count_events(&records, "operation."), 1);
}

#[tokio::test]
async fn operation_after_expiry_is_rejected_with_denial_record() {
    // GIVEN: a tunnel created with a one-second lifetime
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.connections = connections(vec![(
        "db-short",
        postgres_connection(&backend, &["dba"], false, &["select *"]),
    )]);
    let h = harness(config).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db-short", &token, Some("1s")).await;

    // WHEN: an operation arrives after the expiry passed
    tokio::time::sleep(Duration::from_millis(1050)).await;
    let (status, body) = h.proxy_raw(&tunnel_id, &token, b"SELECT 1").await;

    // THEN: rejected with a tunnel-expired error, nothing forwarded
    assert_eq!(status, StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "tunnel_expired");

    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "operation.denied"), 1);
    assert_eq!(count_events(&records, "operation.allowed"), 0);
    assert_eq!(count_events(&records, "tunnel.expired"), 1);
}

#[tokio::test]
async fn approval_timeout_is_audited_as_timed_out_not_denied() {
    // GIVEN: approval required, a short window, and no approver anywhere
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.approval.timeout = Duration::from_millis(100);
    config.connections = connections(vec![(
        "db-approved",
        postgres_connection(&backend, &["dba"], true, &["select *"]),
    )]);
    let h = harness(config).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db-approved", &token, None).await;

    // WHEN: the window elapses with no decision
    let (status, body) = h.proxy_raw(&tunnel_id, &token, b"SELECT 1").await;

    // THEN: 403 with the timeout error, audited distinctly from a denial
    assert_eq!(status, StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "approval_timeout");

    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "operation.timed_out"), 1);
    assert_eq!(count_events(&records, "operation.denied"), 0);
}

#[tokio::test]
async fn non_whitelisted_operation_is_denied_without_forwarding() {
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.connections = connections(vec![(
        "db",
        postgres_connection(&backend, &["dba"], false, &["select *"]),
    )]);
    let h = harness(config).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db", &token, None).await;

    let (status, body) = h.proxy_raw(&tunnel_id, &token, b"DROP TABLE users").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "policy_violation");

    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "operation.denied"), 1);
    assert_eq!(count_events(&records, "operation.allowed"), 0);
}

#[tokio::test]
async fn proxy_by_non_owner_is_403() {
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    // eve's intern role is allowed here so she could open her own tunnel,
    // but she must not be able to use alice's.
    config.connections = connections(vec![(
        "db",
        postgres_connection(&backend, &["dba", "intern"], false, &["select *"]),
    )]);
    let h = harness(config).await;

    let alice_token = h.login("alice", "alice-pw").await;
    let eve_token = h.login("eve", "eve-pw").await;
    let tunnel_id = h.connect("db", &alice_token, None).await;

    let (status, _) = h.proxy_raw(&tunnel_id, &eve_token, b"SELECT 1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn close_cancels_pending_approval_and_frees_the_tunnel() {
    // GIVEN: an operation suspended in the approval gate
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.approval.timeout = Duration::from_secs(5);
    config.connections = connections(vec![(
        "db-approved",
        postgres_connection(&backend, &["dba"], true, &["select *"]),
    )]);
    let h = harness(config).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db-approved", &token, None).await;

    let proxy = {
        let h_router = h.router.clone();
        let token = token.clone();
        let tunnel_id = tunnel_id.clone();
        tokio::spawn(async move {
            use axum::body::Body;
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method("POST")
                .uri(format!("/api/proxy/{tunnel_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from("SELECT 1"))
                .unwrap();
            h_router.oneshot(request).await.unwrap().status()
        })
    };
    while h.state.gate.pending_for_tunnel(&tunnel_id).is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // WHEN: the owner closes the tunnel
    let (status, _) = h
        .request(
            "DELETE",
            &format!("/api/connect/{tunnel_id}"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // THEN: the suspended operation resolves failed-closed
    assert_eq!(proxy.await.unwrap(), StatusCode::FORBIDDEN);

    let records = h.finish_audit().await;
    assert_eq!(count_events(&records, "tunnel.closed"), 1);
    assert_eq!(count_events(&records, "operation.cancelled"), 1);
}

#[tokio::test]
async fn reload_keeps_existing_tunnels_on_their_generation() {
    // GIVEN: a tunnel opened under generation 1
    let backend = spawn_echo_backend().await;
    let mut config = base_config();
    config.connections = connections(vec![(
        "db",
        postgres_connection(&backend, &["dba"], false, &["select *"]),
    )]);
    let h = harness(config.clone()).await;

    let token = h.login("alice", "alice-pw").await;
    let tunnel_id = h.connect("db", &token, None).await;

    // WHEN: a new generation removes the whitelist rule entirely
    let mut next = config;
    next.connections.get_mut("db").unwrap().whitelist.clear();
    h.state.catalog.install(&next).unwrap();
    assert_eq!(h.state.catalog.current().generation, 2);

    // THEN: the in-flight tunnel still evaluates the rules it pinned
    let (status, body) = h.proxy_raw(&tunnel_id, &token, b"SELECT 1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"SELECT 1");

    // while a tunnel opened now sees the new, empty whitelist
    let new_tunnel = h.connect("db", &token, None).await;
    let (status, _) = h.proxy_raw(&new_tunnel, &token, b"SELECT 1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
