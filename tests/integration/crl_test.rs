// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integration tests for CRL download and the on-disk cache

use std::sync::Arc;
use std::time::Duration;

use usg_cert_agent::AgentError;
use usg_cert_agent::crl::{CrlSource, HttpCrlSource, RevocationCache, parse_crl};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use super::fixtures::TestCa;
use super::{MockPkiServer, PATH_CRL, cache_path, set_age};

fn http_cache() -> RevocationCache {
    RevocationCache::new(Arc::new(HttpCrlSource::new().unwrap()))
}

#[tokio::test]
async fn test_fetch_der_crl() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Fetch CA");
    let crl = ca.crl(&[&[0x11], &[0x22]]);
    mock.mock_crl(&crl, 1).await;

    let source = HttpCrlSource::new().unwrap();
    let body = source
        .fetch(&mock.crl_url(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(body, crl);
    assert_eq!(parse_crl(&body).unwrap().revoked_count, 2);
}

#[tokio::test]
async fn test_fetch_http_error() {
    let mock = MockPkiServer::start().await;
    mock.mock_crl_error(404).await;

    let result = HttpCrlSource::new()
        .unwrap()
        .fetch(&mock.crl_url(), Duration::from_secs(5))
        .await;

    match result {
        Err(AgentError::CrlFetch(message)) => assert!(message.contains("404")),
        other => panic!("Expected CrlFetch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_too_large() {
    let mock = MockPkiServer::start().await;
    mock.mock_crl(&[0u8; 4096], 1).await;

    let result = HttpCrlSource::with_max_size(1024)
        .unwrap()
        .fetch(&mock.crl_url(), Duration::from_secs(5))
        .await;

    assert!(matches!(result, Err(AgentError::CrlTooLarge(4096, 1024))));
}

#[tokio::test]
async fn test_chunked_body_over_limit_is_cut_off() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Chunked transfer has no Content-Length to reject up front
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 2048];
        let _ = socket.read(&mut request).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await;
        let chunk = vec![b'A'; 1024];
        for _ in 0..8 {
            let _ = socket.write_all(b"400\r\n").await;
            let _ = socket.write_all(&chunk).await;
            let _ = socket.write_all(b"\r\n").await;
        }
        let _ = socket.write_all(b"0\r\n\r\n").await;
    });

    let result = HttpCrlSource::with_max_size(2048)
        .unwrap()
        .fetch(&format!("http://{addr}/crl"), Duration::from_secs(5))
        .await;

    match result {
        Err(AgentError::CrlTooLarge(received, 2048)) => assert!(received > 2048),
        other => panic!("Expected CrlTooLarge, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_timeout() {
    let mock = MockPkiServer::start().await;
    Mock::given(method("GET"))
        .and(path(PATH_CRL))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(mock.inner())
        .await;

    let result = HttpCrlSource::new()
        .unwrap()
        .fetch(&mock.crl_url(), Duration::from_millis(200))
        .await;

    assert!(matches!(result, Err(AgentError::CrlTimeout(_))));
}

#[tokio::test]
async fn test_empty_cache_is_populated() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Populate CA");
    mock.mock_crl(&ca.crl(&[&[0x01]]), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());

    let outcome = http_cache()
        .refresh_if_stale(&mock.crl_url(), &cache, 24.0, Duration::from_secs(5))
        .await;

    assert!(outcome.downloaded);
    assert!(outcome.updated);
    assert_eq!(outcome.age_hours, 0.0);
    assert_eq!(outcome.revoked_count, Some(1));
    assert!(cache.is_file());
}

#[tokio::test]
async fn test_fresh_cache_is_not_fetched() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Fresh CA");
    mock.mock_crl(&ca.crl(&[]), 0).await;

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());
    std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
    std::fs::write(&cache, ca.crl(&[])).unwrap();
    set_age(&cache, Duration::from_secs(90 * 60));

    let outcome = http_cache()
        .refresh_if_stale(&mock.crl_url(), &cache, 2.0, Duration::from_secs(5))
        .await;

    assert!(!outcome.downloaded);
    assert!(!outcome.updated);
    assert!((outcome.age_hours - 1.5).abs() < 0.05);
}

#[tokio::test]
async fn test_stale_cache_is_fetched_once() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Stale CA");
    mock.mock_crl(&ca.crl(&[&[0x0a], &[0x0b], &[0x0c]]), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());
    std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
    std::fs::write(&cache, ca.crl(&[])).unwrap();
    set_age(&cache, Duration::from_secs(90 * 60));

    let outcome = http_cache()
        .refresh_if_stale(&mock.crl_url(), &cache, 1.0, Duration::from_secs(5))
        .await;

    assert!(outcome.downloaded);
    assert!(outcome.updated);
    assert_eq!(outcome.revoked_count, Some(3));
    assert!(RevocationCache::get_age(&cache) < 0.01);
}

#[tokio::test]
async fn test_failed_refresh_keeps_cache() {
    let mock = MockPkiServer::start().await;
    mock.mock_crl_error(503).await;

    let ca = TestCa::new("Outage CA");
    let previous = ca.crl(&[&[0x42]]);

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());
    std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
    std::fs::write(&cache, &previous).unwrap();
    set_age(&cache, Duration::from_secs(30 * 3600));

    let outcome = http_cache()
        .refresh_if_stale(&mock.crl_url(), &cache, 24.0, Duration::from_secs(5))
        .await;

    assert!(!outcome.downloaded);
    assert!(!outcome.updated);
    assert!(outcome.error.is_some());
    assert!(outcome.age_hours > 29.0);
    assert_eq!(outcome.revoked_count, Some(1));
    assert_eq!(std::fs::read(&cache).unwrap(), previous);
}

#[tokio::test]
async fn test_non_crl_body_keeps_cache() {
    let mock = MockPkiServer::start().await;
    mock.mock_crl(b"<html>maintenance</html>", 1).await;

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());

    let outcome = http_cache()
        .refresh_if_stale(&mock.crl_url(), &cache, 24.0, Duration::from_secs(5))
        .await;

    assert!(outcome.downloaded);
    assert!(!outcome.updated);
    assert!(outcome.error.is_some());
    assert_eq!(outcome.age_hours, -1.0);
    assert!(!cache.exists());
}
