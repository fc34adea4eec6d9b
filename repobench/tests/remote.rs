use bytes::Bytes;
use repobench::{Error, HttpRemote, Remote};
use repobench_test::server::TestServer;
use reqwest::StatusCode;

#[tokio::test]
async fn creates_repository() {
    let server = TestServer::new().await;
    let remote = HttpRemote::new(&server.url("/")).unwrap();

    let id = remote
        .create_repository("testbenchmark", "master", "local://bench")
        .await
        .unwrap();

    assert_eq!(id, "testbenchmark");
    assert_eq!(
        server.repository("testbenchmark").as_deref(),
        Some("local://bench")
    );
}

#[tokio::test]
async fn duplicate_repository_is_a_conflict() {
    let server = TestServer::new().await;
    let remote = HttpRemote::new(&server.url("/")).unwrap();

    remote
        .create_repository("repo", "master", "local://bench")
        .await
        .unwrap();
    let err = remote
        .create_repository("repo", "master", "local://bench")
        .await
        .unwrap_err();

    match err {
        Error::Status { status, body, .. } => {
            assert_eq!(status, StatusCode::CONFLICT);
            assert!(body.contains("already exists"), "{body}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn uploads_and_reads_objects() {
    let server = TestServer::new().await;
    let remote = HttpRemote::new(&server.url("/")).unwrap();
    remote
        .create_repository("repo", "master", "local://bench")
        .await
        .unwrap();

    let content = Bytes::from_static(b"oh hai!");
    remote
        .upload_object("repo", "master", "1", content.clone())
        .await
        .unwrap();
    assert_eq!(server.object("repo", "1"), Some(content.clone()));

    let received = remote.get_object("repo", "master", "1").await.unwrap();
    assert_eq!(received, content);
}

#[tokio::test]
async fn escapes_object_paths() {
    let server = TestServer::new().await;
    let remote = HttpRemote::new(&server.url("/")).unwrap();
    remote
        .create_repository("repo", "master", "local://bench")
        .await
        .unwrap();

    let path = "dir/file name?.txt";
    remote
        .upload_object("repo", "master", path, Bytes::from_static(b"x"))
        .await
        .unwrap();

    assert!(server.object("repo", path).is_some());
    let received = remote.get_object("repo", "master", path).await.unwrap();
    assert_eq!(received, "x");
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let server = TestServer::new().await;
    let remote = HttpRemote::new(&server.url("/")).unwrap();

    let err = remote.get_object("repo", "master", "42").await.unwrap_err();
    assert!(
        matches!(err, Error::Status { status, .. } if status == StatusCode::NOT_FOUND),
        "{err:?}"
    );
}

#[tokio::test]
async fn unreachable_service_is_a_request_error() {
    let remote = HttpRemote::new(&unused_endpoint()).unwrap();
    let err = remote
        .create_repository("repo", "master", "local://bench")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reqwest { .. }), "{err:?}");
}

/// An endpoint on a port that nothing listens on.
fn unused_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    format!("http://127.0.0.1:{port}/")
}
