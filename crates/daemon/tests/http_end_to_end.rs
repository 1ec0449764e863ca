//! The filesystem adapter driven against a mocked HTTP object store

use std::net::TcpListener;
use std::time::Duration;

use common::remote::{ClientConfig, RemoteClient, API_VERSION};
use common::upload::EMPTY_FINGERPRINT;
use copyfs_daemon::fuse::{FilesystemAdapter, DEFAULT_SPOOL_THRESHOLD};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use url::Url;

const TOKEN: &str = "test-token";

/// md5("hello") ++ sha1("hello")
const HELLO_FINGERPRINT: &str =
    "5d41402abc4b2a76b9719d911017c592aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn commit_body(path: &str, fingerprint: &str, size: u64) -> String {
    format!(
        r#"{{"meta":[{{"action":"create","object_type":"file","path":"{}","size":{},"parts":[{{"fingerprint":"{}","offset":0,"size":{}}}]}}]}}"#,
        path, size, fingerprint, size
    )
}

async fn connect(server: &MockServer) -> FilesystemAdapter {
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/auth_user")
                .header("x-client-type", "api")
                .header("x-api-version", API_VERSION);
            then.status(200).json_body(json!({ "auth_token": TOKEN }));
        })
        .await;

    let config = ClientConfig {
        api_url: Url::parse(&server.base_url()).unwrap(),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let client = RemoteClient::connect(&config, "alice", "secret")
        .await
        .unwrap();
    FilesystemAdapter::new(client, DEFAULT_SPOOL_THRESHOLD)
}

#[tokio::test]
async fn test_create_write_flush_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let fs = connect(&server).await;

    let empty_query = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/has_parts")
                .header("x-authorization", TOKEN)
                .header("x-part-count", "1")
                .header("x-part-fingerprint-1", EMPTY_FINGERPRINT)
                .header("x-part-size-1", "0");
            then.status(200).json_body(json!({ "send_parts": [] }));
        })
        .await;
    let empty_body = commit_body("/a.txt", EMPTY_FINGERPRINT, 0);
    let empty_commit = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/update_objects")
                .header("x-authorization", TOKEN)
                .x_www_form_urlencoded_tuple("data", empty_body.as_str());
            then.status(200).json_body(json!({ "result": "success" }));
        })
        .await;

    let attr = fs.create("/a.txt").await.unwrap();
    assert_eq!(attr.size, 0);
    empty_query.assert_async().await;
    empty_commit.assert_async().await;

    let hello_query = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/has_parts")
                .header("x-part-count", "1")
                .header("x-part-fingerprint-1", HELLO_FINGERPRINT)
                .header("x-part-size-1", "5");
            then.status(200).json_body(json!({
                "send_parts": [{ "fingerprint": HELLO_FINGERPRINT, "size": "5" }]
            }));
        })
        .await;
    let send = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/send_parts")
                .header("x-part-fingerprint-1", HELLO_FINGERPRINT)
                .body("hello");
            then.status(200).json_body(json!({ "result": "success" }));
        })
        .await;
    let hello_body = commit_body("/a.txt", HELLO_FINGERPRINT, 5);
    let hello_commit = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/update_objects")
                .x_www_form_urlencoded_tuple("data", hello_body.as_str());
            then.status(200).json_body(json!({ "result": "success" }));
        })
        .await;

    assert_eq!(fs.write("/a.txt", b"hello", 0).await.unwrap(), 5);
    assert_eq!(hello_commit.hits_async().await, 0);
    fs.flush("/a.txt").await.unwrap();

    hello_query.assert_async().await;
    send.assert_async().await;
    hello_commit.assert_async().await;

    let list = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/list_objects")
                .x_www_form_urlencoded_tuple("data", r#"{"path":"/","max_items":1000000}"#);
            then.status(200).json_body(json!({
                "children": [
                    { "path": "/a.txt", "type": "file", "size": "5",
                      "created_time": 100, "modified_time": 100 },
                ]
            }));
        })
        .await;
    assert_eq!(fs.get_attr("/a.txt").await.unwrap().size, 5);
    list.assert_async().await;

    // Already saved, so closing sends nothing more.
    fs.release("/a.txt").await.unwrap();
    assert_eq!(hello_commit.hits_async().await, 1);
    assert_eq!(empty_commit.hits_async().await, 1);
}
