//! Integration tests for queued requests against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::{
    Client, ClientOptions, Listeners, MemoryStore, Payload, RequestData, RequestError,
};
use serde_json::json;
use support::local_server;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

fn client_with(options: ClientOptions) -> Client {
    Client::with_store(options, Arc::new(MemoryStore::new())).expect("client should build")
}

fn fast_client() -> Client {
    client_with(ClientOptions {
        rate_limit_time: Duration::ZERO,
        ..ClientOptions::default()
    })
}

#[tokio::test]
async fn test_get_returns_body() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
        .expect(1)
        .mount(&server)
        .await;

    let body = fast_client()
        .requests()
        .request(RequestData::get(format!("{}/hello", server.uri())))
        .await
        .unwrap();

    assert_eq!(body.as_deref(), Some("hello world"));
}

#[tokio::test]
async fn test_query_overlay_replaces_existing_key() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", "3"))
        .and(query_param("sort", "asc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("page three"))
        .expect(1)
        .mount(&server)
        .await;

    let data = RequestData::get(format!("{}/list?page=1&sort=asc", server.uri()))
        .with_query("page", "3");
    let body = fast_client().requests().request(data).await.unwrap();

    assert_eq!(body.as_deref(), Some("page three"));
}

#[tokio::test]
async fn test_custom_headers_merged_with_request_headers() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/headers"))
        .and(header("x-client", "courier"))
        .and(header("user-agent", "override/2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let mut options = ClientOptions {
        rate_limit_time: Duration::ZERO,
        ..ClientOptions::default()
    };
    options
        .custom_headers
        .insert("X-Client".to_string(), "courier".to_string());
    let client = client_with(options);

    let data = RequestData::get(format!("{}/headers", server.uri()))
        .with_header("User-Agent", "override/2.0");
    let body = client.requests().request(data).await.unwrap();

    assert_eq!(body.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_post_url_encoded_payload() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("pass=p+w&user=me"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .expect(1)
        .mount(&server)
        .await;

    let form = BTreeMap::from([
        ("user".to_string(), "me".to_string()),
        ("pass".to_string(), "p w".to_string()),
    ]);
    let data =
        RequestData::post(format!("{}/login", server.uri())).with_payload(Payload::UrlEncoded(form));
    let body = fast_client().requests().request(data).await.unwrap();

    assert_eq!(body.as_deref(), Some("welcome"));
}

#[tokio::test]
async fn test_post_json_payload_is_plain_text() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/api"))
        .and(header("content-type", "text/plain"))
        .and(body_string(r#"{"id":7}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string("stored"))
        .expect(1)
        .mount(&server)
        .await;

    let data = RequestData::post(format!("{}/api", server.uri()))
        .with_payload(Payload::Json(json!({"id": 7})));
    let body = fast_client().requests().request(data).await.unwrap();

    assert_eq!(body.as_deref(), Some("stored"));
}

#[tokio::test]
async fn test_payload_on_get_is_rejected_without_sending() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let data = RequestData::get(format!("{}/x", server.uri()))
        .with_payload(Payload::Raw("body".to_string()));
    let err = fast_client().requests().request(data).await.unwrap_err();

    assert!(matches!(err, RequestError::UnexpectedPayload { .. }));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_unsupported_scheme_is_rejected() {
    let err = fast_client()
        .requests()
        .request(RequestData::get("ftp://example.com/file.txt"))
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::UnsupportedScheme { ref scheme, .. } if scheme == "ftp"));
}

#[tokio::test]
async fn test_404_is_empty_success_by_default() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&server)
        .await;

    let body = fast_client()
        .requests()
        .request(RequestData::get(format!("{}/missing", server.uri())))
        .await
        .unwrap();

    assert!(body.is_none());
}

#[tokio::test]
async fn test_404_flagged_as_error() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = fast_client()
        .requests()
        .request(RequestData::get(format!("{}/missing", server.uri())).is_404_error(true))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(404));
}

#[tokio::test]
async fn test_server_error_is_status_error() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = fast_client()
        .requests()
        .request(RequestData::get(format!("{}/broken", server.uri())))
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::Status { status: 500, .. }));
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn test_301_followed_with_same_method_and_headers() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new"))
        .and(header("x-token", "abc"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .expect(1)
        .mount(&server)
        .await;

    let data = RequestData::post(format!("{}/old", server.uri()))
        .with_header("X-Token", "abc")
        .with_payload(Payload::Raw("payload".to_string()));
    let body = fast_client().requests().request(data).await.unwrap();

    assert_eq!(body.as_deref(), Some("moved"));
}

#[tokio::test]
async fn test_301_loop_stops_at_redirect_limit() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/loop"))
        .expect(4)
        .mount(&server)
        .await;

    let client = client_with(ClientOptions {
        rate_limit_time: Duration::ZERO,
        max_redirects: 3,
        ..ClientOptions::default()
    });
    let err = client
        .requests()
        .request(RequestData::get(format!("{}/loop", server.uri())))
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::TooManyRedirects { limit: 3, .. }));
}

#[tokio::test]
async fn test_return_output_false_drains_body() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let listeners = Listeners::new().on_done(move |body, error| {
        recorder
            .lock()
            .unwrap()
            .push((body.map(str::to_string), error.is_some()));
    });

    let data = RequestData::get(format!("{}/ping", server.uri()))
        .return_output(false)
        .with_listeners(listeners);
    let body = fast_client().requests().request(data).await.unwrap();

    assert!(body.is_none());
    assert_eq!(*seen.lock().unwrap(), vec![(None, false)]);
}

#[tokio::test]
async fn test_on_done_observes_errors() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let failed = Arc::new(Mutex::new(false));
    let recorder = Arc::clone(&failed);
    let listeners = Listeners::new().on_done(move |_, error| {
        *recorder.lock().unwrap() = error.is_some_and(|e| e.status_code() == Some(503));
    });

    let result = fast_client()
        .requests()
        .request(RequestData::get(server.uri()).with_listeners(listeners))
        .await;

    assert!(result.is_err());
    assert!(*failed.lock().unwrap());
}

#[tokio::test]
async fn test_cookies_from_response_sent_on_next_request() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/; HttpOnly")
                .set_body_string("logged in"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account"))
        .and(header("cookie", "sid=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("account"))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client();
    client
        .requests()
        .request(RequestData::get(format!("{}/login", server.uri())))
        .await
        .unwrap();
    let body = client
        .requests()
        .request(RequestData::get(format!("{}/account", server.uri())))
        .await
        .unwrap();

    assert_eq!(body.as_deref(), Some("account"));
    assert!(client.cookie_jar().get("127.0.0.1", "/", false, true, "sid").is_some());
}

#[tokio::test]
async fn test_same_host_requests_are_spaced() {
    let Some(server) = local_server().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(3)
        .mount(&server)
        .await;

    let rate = Duration::from_millis(200);
    let client = client_with(ClientOptions {
        rate_limit_time: rate,
        ..ClientOptions::default()
    });

    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut pending = Vec::new();
    for i in 0..3 {
        let recorder = Arc::clone(&sent);
        let listeners = Listeners::new().on_request(move |_| {
            recorder.lock().unwrap().push(Instant::now());
        });
        let data = RequestData::get(format!("{}/item/{i}", server.uri())).with_listeners(listeners);
        pending.push(client.requests().request(data));
    }
    for result in futures_util::future::join_all(pending).await {
        assert_eq!(result.unwrap().as_deref(), Some("ok"));
    }

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    for pair in sent.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= rate - Duration::from_millis(25),
            "requests spaced by {gap:?}, expected at least {rate:?}"
        );
    }
}
