//! End-to-end tests against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use semki::{
    ClientConfig, CredentialStore, FailureKind, Gateway, LocationTracker, SearchFilters,
    SearchSession, StreamState,
};

async fn gateway(server: &MockServer, access: &str) -> (Gateway, Arc<LocationTracker>) {
    let config = ClientConfig::new()
        .with_base_url(server.uri())
        .with_timeout(Duration::from_secs(5));
    let credentials = CredentialStore::in_memory();
    credentials.set(access, Some("refresh-1".to_string()));
    let location = Arc::new(LocationTracker::new("/search"));
    let gateway = Gateway::connect(config, credentials, location.clone()).unwrap();
    (gateway, location)
}

async fn mount_history(server: &MockServer, token: &str, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({"chats": [{"id": "c1", "title": "q"}]}))
    } else {
        ResponseTemplate::new(status).set_body_json(json!({"message": "jwt expired"}))
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/chat/history"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn expired_token_is_renewed_and_the_call_replayed() {
    let server = MockServer::start().await;
    mount_history(&server, "old", 401).await;
    mount_history(&server, "new", 200).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/refresh_token"))
        .and(body_json(json!({"refresh_token": "refresh-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "new", "refresh_token": "refresh-2"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, location) = gateway(&server, "old").await;
    let page = gateway.chat_history(None).await.unwrap();
    assert_eq!(page.chats[0].id, "c1");
    assert_eq!(gateway.credentials().access_token().as_deref(), Some("new"));
    assert_eq!(
        gateway.credentials().refresh_token().as_deref(),
        Some("refresh-2")
    );
    assert_eq!(location.redirects(), 0);
}

#[tokio::test]
async fn concurrent_rejections_share_one_renewal() {
    let server = MockServer::start().await;
    mount_history(&server, "old", 401).await;
    mount_history(&server, "new", 200).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "new"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway(&server, "old").await;
    let calls = (0..5).map(|_| {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.chat_history(None).await })
    });
    for call in futures::future::join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }
    // The renewal answer carried no refresh token, so the held one is kept.
    assert_eq!(
        gateway.credentials().refresh_token().as_deref(),
        Some("refresh-1")
    );
}

#[tokio::test]
async fn rejected_renewal_logs_out_and_redirects() {
    let server = MockServer::start().await;
    mount_history(&server, "old", 401).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/refresh_token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "revoked"})))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, location) = gateway(&server, "old").await;
    let err = gateway.chat_history(None).await.unwrap_err();
    assert!(err.is_renewal_failed());
    assert!(!gateway.credentials().is_authenticated());
    assert_eq!(location.redirects(), 1);
}

#[tokio::test]
async fn search_streams_chunked_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_json(json!({
            "message": "backend engineer",
            "teams": ["t1"],
            "levels": [],
            "locations": [],
            "limit": 10
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "c1"})))
        .mount(&server)
        .await;
    let body = concat!(
        ": keep-alive\n\n",
        "event: result\r\n",
        "data: {\"score\":0.42,\"user\":{\"_id\":\"u2\",\"name\":\"Bo\"},\"description\":\"ops\"}\r\n\r\n",
        "data: {\"score\":0.91,\"user\":{\"_id\":\"u1\",\"name\":\"Ada\"},\"description\":\"backend\"}\n\n",
        "data: [DONE]\n\n",
        "data: {\"score\":1.0,\"user\":{\"_id\":\"late\"}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/v1/search"))
        .and(query_param("q", "backend engineer"))
        .and(query_param("chatId", "c1"))
        .and(query_param("teams", "t1"))
        .and(query_param("limit", "10"))
        .and(header("authorization", "Bearer live"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway(&server, "live").await;
    let session = SearchSession::new(gateway);
    session
        .start("backend engineer", SearchFilters::new().with_teams(["t1"]))
        .await;
    let snapshot = session.wait().await;

    assert_eq!(snapshot.state, StreamState::Completed);
    assert_eq!(snapshot.chat_id(), Some("c1"));
    let ranked: Vec<_> = snapshot.ranked().into_iter().map(|r| r.user.id).collect();
    assert_eq!(ranked, vec!["u1", "u2"]);
}

#[tokio::test]
async fn unauthorized_stream_is_not_renewed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "c1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/search"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "jwt expired"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "new"})))
        .expect(0)
        .mount(&server)
        .await;

    let (gateway, _) = gateway(&server, "live").await;
    let session = SearchSession::new(gateway.clone());
    let state = session.start("q", SearchFilters::new()).await;

    assert_eq!(state, StreamState::Failed);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.failure, Some(FailureKind::ConnectFailed));
    assert!(snapshot.error.unwrap().is_authentication());
    assert_eq!(gateway.credentials().access_token().as_deref(), Some("live"));
}

#[tokio::test]
async fn replay_reads_the_stored_chat() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chat/c7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "c7",
            "messages": [
                {"title": "designers in Porto"},
                {"score": 0.5, "user": {"_id": "u9", "name": "Rui"}, "description": "ux"}
            ]
        })))
        .mount(&server)
        .await;

    let (gateway, _) = gateway(&server, "live").await;
    let session = SearchSession::new(gateway);
    session.replay("c7").await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, StreamState::Idle);
    assert_eq!(snapshot.chat.unwrap().query, "designers in Porto");
    assert_eq!(snapshot.results.len(), 1);
}
