//! Shared helpers for the remote client integration tests
#![allow(dead_code)]

use std::net::TcpListener;
use std::time::Duration;

use ::common::remote::{ClientConfig, HttpApi};
use httpmock::MockServer;
use url::Url;

pub const TOKEN: &str = "test-token";

/// md5("hello") ++ sha1("hello")
pub const HELLO_FINGERPRINT: &str =
    "5d41402abc4b2a76b9719d911017c592aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig {
        api_url: Url::parse(&server.base_url()).unwrap(),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

/// Register an `/auth_user` mock handing out [`TOKEN`]
pub async fn mock_login(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/auth_user")
                .header("x-client-type", "api")
                .header("x-api-version", ::common::remote::API_VERSION);
            then.status(200)
                .json_body(serde_json::json!({ "auth_token": TOKEN }));
        })
        .await
}

/// A logged-in api against `server`
pub async fn login(server: &MockServer) -> HttpApi {
    mock_login(server).await;
    HttpApi::login(&config_for(server), "alice", "secret")
        .await
        .unwrap()
}
