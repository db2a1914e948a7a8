use std::net::TcpListener;
use std::time::Duration;

use ecocert_archive_pipeline::{
    ContentFetcher, ContentUploader, FetcherConfig, HttpFetcher, PinStatus, PinataClient,
    PinataConfig, StagingArea, UploadItem, UploadMetadata, UrlPolicy, ValidationPolicy,
    MAX_REDIRECTS,
};
use httpmock::Method::{DELETE, GET, POST};
use httpmock::MockServer;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const JWT: &str = "test-jwt";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

async fn fetcher(max_size: u64) -> anyhow::Result<(tempfile::TempDir, HttpFetcher)> {
    let dir = tempfile::tempdir()?;
    let staging = StagingArea::create(dir.path().join("staging")).await?;
    let config = FetcherConfig {
        max_size,
        timeout: Duration::from_secs(5),
        policy: UrlPolicy::default().allow_host("127.0.0.1"),
        concurrency: 2,
    };
    Ok((dir, HttpFetcher::new(staging, config)?))
}

fn pinata(server: &MockServer) -> anyhow::Result<PinataClient> {
    pinata_with_slots(server, 2)
}

fn pinata_with_slots(server: &MockServer, concurrency: usize) -> anyhow::Result<PinataClient> {
    Ok(PinataClient::new(PinataConfig {
        api_url: server.base_url(),
        gateway_url: "https://gateway.example/".to_string(),
        jwt: JWT.to_string(),
        timeout: Duration::from_secs(5),
        validation: ValidationPolicy::default(),
        concurrency,
    })?)
}

fn is_staging_empty(fetcher: &HttpFetcher) -> anyhow::Result<bool> {
    Ok(std::fs::read_dir(fetcher.staging().path())?
        .next()
        .is_none())
}

/// Serve one response with a chunked body and no `Content-Length`.
async fn serve_chunked(chunks: usize, chunk_size: usize) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = [0_u8; 1024];
        let _ = socket.read(&mut request).await;

        let head = "HTTP/1.1 200 OK\r\n\
                    content-type: application/octet-stream\r\n\
                    transfer-encoding: chunked\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        let mut chunk = format!("{chunk_size:x}\r\n").into_bytes();
        chunk.resize(chunk.len() + chunk_size, b'x');
        chunk.extend_from_slice(b"\r\n");
        for _ in 0..chunks {
            if socket.write_all(&chunk).await.is_err() {
                return;
            }
        }
        let _ = socket.write_all(b"0\r\n\r\n").await;
    });
    Ok(format!("http://{addr}/stream.bin"))
}

#[tokio::test]
async fn download_derives_metadata_and_cleans_staging() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping download_derives_metadata_and_cleans_staging: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let report = server
        .mock_async(|when, then| {
            when.method(GET).path("/reports/q1.pdf");
            then.status(200)
                .header("content-type", "Application/PDF; charset=binary")
                .body("%PDF-1.7 body");
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let downloaded = fetcher.download(&server.url("/reports/q1.pdf")).await?;

    report.assert_async().await;
    assert_eq!(downloaded.content, b"%PDF-1.7 body");
    assert_eq!(downloaded.http_status, 200);
    assert_eq!(downloaded.metadata.content_type, "application/pdf");
    assert_eq!(downloaded.metadata.file_extension.as_deref(), Some("pdf"));
    assert_eq!(downloaded.metadata.size, 13);
    assert_eq!(
        downloaded.metadata.content_hash,
        ecocert_archive_pipeline::content_hash(b"%PDF-1.7 body")
    );
    assert!(is_staging_empty(&fetcher)?);
    Ok(())
}

#[tokio::test]
async fn download_over_declared_limit_returns_no_content() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!(
            "Skipping download_over_declared_limit_returns_no_content: cannot bind localhost"
        );
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/huge.bin");
            then.status(200).body(vec![b'x'; 4096]);
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let err = fetcher.download(&server.url("/huge.bin")).await.err();

    assert_eq!(err.map(|e| e.code()), Some("FILE_TOO_LARGE"));
    assert!(is_staging_empty(&fetcher)?);
    Ok(())
}

#[tokio::test]
async fn undeclared_body_is_cut_off_once_it_passes_the_limit() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!(
            "Skipping undeclared_body_is_cut_off_once_it_passes_the_limit: cannot bind localhost"
        );
        return Ok(());
    }
    let url = serve_chunked(4, 1024).await?;

    let (_dir, fetcher) = fetcher(1024).await?;
    let err = fetcher.download(&url).await.err();

    assert_eq!(err.as_ref().map(|e| e.code()), Some("CONTENT_TOO_LARGE"));
    assert!(err.is_some_and(|e| !e.is_retryable()));
    assert!(is_staging_empty(&fetcher)?);
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_a_retryable_download_failure() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!(
            "Skipping non_success_status_is_a_retryable_download_failure: cannot bind localhost"
        );
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gone");
            then.status(404);
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let err = fetcher.download(&server.url("/gone")).await.err();
    assert_eq!(err.as_ref().map(|e| e.code()), Some("DOWNLOAD_FAILED"));
    assert!(err.is_some_and(|e| e.is_retryable()));
    Ok(())
}

#[tokio::test]
async fn redirects_within_policy_are_followed() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping redirects_within_policy_are_followed: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/moved.pdf");
            then.status(302).header("location", "/reports/final.pdf");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/reports/final.pdf");
            then.status(200)
                .header("content-type", "application/pdf")
                .body("%PDF-1.7 moved");
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let source = server.url("/moved.pdf");
    let downloaded = fetcher.download(&source).await?;

    assert_eq!(downloaded.content, b"%PDF-1.7 moved");
    assert_eq!(downloaded.metadata.url, source);
    assert_eq!(downloaded.metadata.file_extension.as_deref(), Some("pdf"));
    Ok(())
}

#[tokio::test]
async fn redirect_to_a_blocked_host_is_refused() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping redirect_to_a_blocked_host_is_refused: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let internal = format!("http://localhost:{}/secret", server.port());
    server
        .mock_async(|when, then| {
            when.method(GET).path("/start.pdf");
            then.status(302).header("location", internal.as_str());
        })
        .await;
    let secret = server
        .mock_async(|when, then| {
            when.method(GET).path("/secret");
            then.status(200).body("internal metadata");
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let err = fetcher.download(&server.url("/start.pdf")).await.err();

    assert_eq!(err.map(|e| e.code()), Some("PRIVATE_ADDRESS_BLOCKED"));
    secret.assert_hits_async(0).await;
    assert!(is_staging_empty(&fetcher)?);
    Ok(())
}

#[tokio::test]
async fn redirect_loops_give_up_after_the_hop_limit() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping redirect_loops_give_up_after_the_hop_limit: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let hops = server
        .mock_async(|when, then| {
            when.method(GET).path("/loop");
            then.status(301).header("location", "/loop");
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let err = fetcher.download(&server.url("/loop")).await.err();

    assert_eq!(err.map(|e| e.code()), Some("TOO_MANY_REDIRECTS"));
    hops.assert_hits_async(MAX_REDIRECTS + 1).await;
    Ok(())
}

#[tokio::test]
async fn download_all_keeps_order_and_isolates_failures() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping download_all_keeps_order_and_isolates_failures: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing.txt");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/docs/");
            then.status(200)
                .header("content-type", "text/plain")
                .body("ok");
        })
        .await;

    let (_dir, fetcher) = fetcher(1024).await?;
    let urls = vec![
        server.url("/docs/a.txt"),
        server.url("/missing.txt"),
        server.url("/docs/b.txt"),
    ];
    let results = fetcher.download_all(&urls).await;

    assert_eq!(
        results
            .iter()
            .map(|(url, _)| url.clone())
            .collect::<Vec<_>>(),
        urls
    );
    let failed: Vec<bool> = results.iter().map(|(_, result)| result.is_err()).collect();
    assert_eq!(failed, vec![false, true, false]);
    Ok(())
}

#[tokio::test]
async fn local_server_is_blocked_without_allowlist() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let staging = StagingArea::create(dir.path()).await?;
    let fetcher = HttpFetcher::new(staging, FetcherConfig::default())?;
    let err = fetcher.download("http://192.168.1.10/admin").await.err();
    assert_eq!(err.map(|e| e.code()), Some("PRIVATE_ADDRESS_BLOCKED"));
    Ok(())
}

#[tokio::test]
async fn upload_sends_metadata_and_replication_policy() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping upload_sends_metadata_and_replication_policy: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let pin = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/pinning/pinFileToIPFS")
                .header("authorization", format!("Bearer {JWT}"))
                .body_contains("originalFilename")
                .body_contains("contentHash")
                .body_contains("FRA1")
                .body_contains("NYC1");
            then.status(200).json_body(json!({
                "IpfsHash": "bafkreitestcid",
                "PinSize": 13,
                "Timestamp": "2024-01-01T00:00:00Z"
            }));
        })
        .await;

    let client = pinata(&server)?;
    let metadata = UploadMetadata::with_content_type("application/pdf");
    let uploaded = client
        .upload(b"%PDF-1.7 body".to_vec(), "q1.pdf", &metadata)
        .await?;

    pin.assert_async().await;
    assert_eq!(uploaded.content_identifier, "bafkreitestcid");
    assert_eq!(uploaded.size, 13);
    assert_eq!(
        uploaded.gateway_url,
        "https://gateway.example/ipfs/bafkreitestcid"
    );
    Ok(())
}

#[tokio::test]
async fn upload_maps_service_status_codes() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping upload_maps_service_status_codes: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mut rejected = server
        .mock_async(|when, then| {
            when.method(POST).path("/pinning/pinFileToIPFS");
            then.status(401)
                .json_body(json!({ "error": "invalid jwt" }));
        })
        .await;

    let client = pinata(&server)?;
    let metadata = UploadMetadata::default();
    let err = client
        .upload(b"hello".to_vec(), "note.txt", &metadata)
        .await
        .err();
    assert_eq!(err.map(|e| e.code()), Some("AUTHENTICATION_FAILED"));

    rejected.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/pinning/pinFileToIPFS");
            then.status(429);
        })
        .await;
    let err = client
        .upload(b"hello".to_vec(), "note.txt", &metadata)
        .await
        .err();
    assert_eq!(err.as_ref().map(|e| e.code()), Some("RATE_LIMITED"));
    assert!(err.is_some_and(|e| e.is_retryable()));
    Ok(())
}

#[tokio::test]
async fn invalid_content_never_reaches_the_service() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping invalid_content_never_reaches_the_service: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let pin = server
        .mock_async(|when, then| {
            when.method(POST).path("/pinning/pinFileToIPFS");
            then.status(200)
                .json_body(json!({ "IpfsHash": "unused", "PinSize": 1 }));
        })
        .await;

    let client = pinata(&server)?;
    let err = client
        .upload(b"MZ".to_vec(), "setup.exe", &UploadMetadata::default())
        .await
        .err();
    assert_eq!(err.map(|e| e.code()), Some("UNSUPPORTED_FILE_TYPE"));
    pin.assert_hits_async(0).await;
    Ok(())
}

#[tokio::test]
async fn upload_all_reports_each_item() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping upload_all_reports_each_item: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let pin = server
        .mock_async(|when, then| {
            when.method(POST).path("/pinning/pinFileToIPFS");
            then.status(200)
                .json_body(json!({ "IpfsHash": "bafkreibatch", "PinSize": 5 }));
        })
        .await;

    let client = pinata(&server)?;
    let item = |filename: &str| UploadItem {
        content: b"hello".to_vec(),
        filename: filename.to_string(),
        metadata: UploadMetadata::default(),
    };
    let results = client
        .upload_all(vec![item("a.txt"), item("setup.exe"), item("b.txt")])
        .await?;

    pin.assert_hits_async(2).await;
    let outcome: Vec<(String, bool)> = results
        .iter()
        .map(|(filename, result)| (filename.clone(), result.is_ok()))
        .collect();
    assert_eq!(
        outcome,
        vec![
            ("a.txt".to_string(), true),
            ("setup.exe".to_string(), false),
            ("b.txt".to_string(), true),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn pins_beyond_the_slot_limit_wait_their_turn() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping pins_beyond_the_slot_limit_wait_their_turn: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let pin = server
        .mock_async(|when, then| {
            when.method(POST).path("/pinning/pinFileToIPFS");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({ "IpfsHash": "bafkreislow", "PinSize": 5 }));
        })
        .await;

    let client = pinata_with_slots(&server, 1)?;
    let metadata = UploadMetadata::default();
    let started = std::time::Instant::now();
    let (first, second) = tokio::join!(
        client.upload(b"first".to_vec(), "first.txt", &metadata),
        client.upload(b"second".to_vec(), "second.txt", &metadata),
    );

    assert!(first.is_ok() && second.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(400));
    pin.assert_hits_async(2).await;
    Ok(())
}

#[tokio::test]
async fn health_check_reflects_authentication() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping health_check_reflects_authentication: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mut auth = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/data/testAuthentication")
                .header("authorization", format!("Bearer {JWT}"));
            then.status(200).json_body(json!({
                "message": "Congratulations! You are communicating with the Pinata API!"
            }));
        })
        .await;

    let client = pinata(&server)?;
    assert!(client.health_check().await);

    auth.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/data/testAuthentication");
            then.status(403);
        })
        .await;
    assert!(!client.health_check().await);
    Ok(())
}

#[tokio::test]
async fn pin_management_operations() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping pin_management_operations: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/pinning/pinByHash")
                .body_contains("bafkreipinned");
            then.status(200).json_body(json!({
                "id": "job-1",
                "ipfsHash": "bafkreipinned",
                "status": "prechecking",
                "name": "report"
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/data/pinList")
                .query_param("hashContains", "bafkreipinned");
            then.status(200).json_body(json!({
                "count": 1,
                "rows": [{
                    "id": "pin-1",
                    "ipfs_pin_hash": "bafkreipinned",
                    "size": 2048,
                    "date_pinned": "2024-01-01T00:00:00Z",
                    "date_unpinned": null,
                    "metadata": { "name": "report" },
                    "regions": [{
                        "regionId": "FRA1",
                        "currentReplicationCount": 1,
                        "desiredReplicationCount": 1
                    }]
                }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/data/pinList")
                .query_param("hashContains", "bafkreimissing");
            then.status(200)
                .json_body(json!({ "count": 0, "rows": [] }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path("/pinning/unpin/bafkreimissing");
            then.status(404);
        })
        .await;
    let unpin = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/pinning/unpin/bafkreipinned");
            then.status(200).body("OK");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/data/userPinnedDataTotal");
            then.status(200).json_body(json!({
                "pin_count": 12,
                "pin_size_total": 4096,
                "pin_size_with_replications_total": 8192
            }));
        })
        .await;

    let client = pinata(&server)?;

    let job = client.pin_by_hash("bafkreipinned", Some("report")).await?;
    assert_eq!(job.content_identifier, "bafkreipinned");

    let info = client.pin_info("bafkreipinned").await?;
    assert_eq!(info.as_ref().map(|i| i.size), Some(2048));
    assert_eq!(info.map(|i| i.regions.len()), Some(1));
    assert_eq!(client.pin_status("bafkreipinned").await?, PinStatus::Pinned);
    assert_eq!(
        client.pin_status("bafkreimissing").await?,
        PinStatus::NotFound
    );

    client.unpin("bafkreipinned").await?;
    unpin.assert_async().await;
    let missing = client.unpin("bafkreimissing").await.err();
    assert_eq!(missing.map(|e| e.code()), Some("PIN_NOT_FOUND"));

    let usage = client.usage_stats().await?;
    assert_eq!(usage.pin_count, 12);
    assert_eq!(usage.pin_size_with_replications_total, 8192);
    Ok(())
}
