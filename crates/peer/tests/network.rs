use std::path::Path;
use std::sync::Arc;

use reqwest::{multipart, Client, StatusCode};
use serde_json::{json, Value};
use sharenet_files::MemoryIndexStore;
use sharenet_peer::{PeerConfig, PeerServer};
use sharenet_rpc::{bind_listener, serve, DirectoryCredentials, DirectoryState};
use sharenet_security::SecurityConfig;
use sharenet_types::PeerId;
use tempfile::TempDir;
use tokio::sync::oneshot;

struct Running {
    address: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

const ADMIN_TOKEN: &str = "directory-admin";

fn directory_secret(peer_id: &str) -> String {
    format!("{peer_id}-directory-secret")
}

async fn start_directory() -> Running {
    let listener = bind_listener("127.0.0.1:0").await.expect("bind directory");
    let addr = listener.local_addr().expect("directory addr");
    let mut credentials = DirectoryCredentials::new().with_admin(ADMIN_TOKEN);
    for peer_id in ["peer-a", "peer-b"] {
        credentials.add_peer(PeerId::parse(peer_id).unwrap(), &directory_secret(peer_id));
    }
    let state = DirectoryState::new(Arc::new(MemoryIndexStore::new(0)), credentials);
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve(listener, state, async {
            let _ = rx.await;
        })
        .await;
    });
    Running {
        address: format!("http://{}", addr),
        shutdown: Some(tx),
    }
}

struct TestPeer {
    running: Running,
    dir: TempDir,
}

impl TestPeer {
    async fn start(directory_url: &str, peer_id: &str, files: &[(&str, usize)]) -> Self {
        let config = PeerConfig {
            directory_secret: directory_secret(peer_id),
            ..PeerConfig::default()
        };
        Self::start_with(directory_url, peer_id, files, config).await
    }

    /// `base` supplies security and directory settings; the rest is filled in.
    async fn start_with(
        directory_url: &str,
        peer_id: &str,
        files: &[(&str, usize)],
        base: PeerConfig,
    ) -> Self {
        let dir = TempDir::new().expect("shared dir");
        for (name, size) in files {
            std::fs::write(dir.path().join(name), vec![b'x'; *size]).expect("seed file");
        }

        let config = PeerConfig {
            listen: "127.0.0.1:0".into(),
            directory_url: directory_url.into(),
            peer_id: peer_id.into(),
            username: format!("{peer_id}-user"),
            password: "hunter2".into(),
            shared_dir: dir.path().to_path_buf(),
            directory_timeout_ms: 2_000,
            heartbeat_interval_secs: 0,
            ..base
        };
        let directory = config.directory_client().expect("client");
        let server = PeerServer::bind(&config, Arc::new(directory))
            .await
            .expect("bind peer");
        let addr = server.local_addr().expect("peer addr");

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = server
                .serve(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            running: Running {
                address: format!("http://{}", addr),
                shutdown: Some(tx),
            },
            dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.running.address, path)
    }

    fn shared(&self) -> &Path {
        self.dir.path()
    }

    async fn login_response(&self, peer_id: &str, password: &str) -> reqwest::Response {
        Client::new()
            .post(self.url("/login"))
            .json(&json!({
                "peer_id": peer_id,
                "username": format!("{peer_id}-user"),
                "password": password,
            }))
            .send()
            .await
            .expect("login request")
    }

    async fn login(&self, peer_id: &str) -> String {
        let response = self.login_response(peer_id, "hunter2").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn search(&self, token: &str, query: &str) -> (StatusCode, Value) {
        let response = Client::new()
            .post(self.url("/search"))
            .bearer_auth(token)
            .json(&json!({ "query": query }))
            .send()
            .await
            .expect("search request");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }
}

fn result_pairs(body: &Value) -> Vec<(String, String, u64)> {
    body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["peer_id"].as_str().unwrap().to_string(),
                r["filename"].as_str().unwrap().to_string(),
                r["size_bytes"].as_u64().unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn two_peers_search_and_download() {
    let directory = start_directory().await;
    let peer_a = TestPeer::start(&directory.address, "peer-a", &[("report.txt", 120)]).await;
    let peer_b = TestPeer::start(&directory.address, "peer-b", &[("report_final.txt", 80)]).await;

    let token_a = peer_a.login("peer-a").await;
    let token_b = peer_b.login("peer-b").await;

    let expected = vec![
        ("peer-a".to_string(), "report.txt".to_string(), 120),
        ("peer-b".to_string(), "report_final.txt".to_string(), 80),
    ];
    for (peer, token) in [(&peer_a, &token_a), (&peer_b, &token_b)] {
        let (status, body) = peer.search(token, "report").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results_count"], 2);
        assert_eq!(result_pairs(&body), expected);
    }

    let (_, body) = peer_b.search(&token_b, "REPORT.TXT").await;
    let url = body["results"][0]["download_url"].as_str().unwrap().to_string();
    assert_eq!(url, peer_a.url("/download/report.txt"));

    // Fetch from the owner
    let response = Client::new()
        .get(&url)
        .bearer_auth(&token_a)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-peer-id"], "peer-a");
    assert_eq!(response.headers()["x-file-size"], "120");
    assert_eq!(response.bytes().await.unwrap().len(), 120);

    // Peer B does not hold report.txt and never proxies
    let response = Client::new()
        .get(peer_b.url("/download/report.txt"))
        .bearer_auth(&token_b)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn protected_routes_require_a_session() {
    let directory = start_directory().await;
    let peer = TestPeer::start(&directory.address, "peer-a", &[("doc.txt", 3)]).await;
    let client = Client::new();

    let health = client.get(peer.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let (status, body) = peer.search("", "doc").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    for path in ["/files", "/network", "/download/doc.txt"] {
        let response = client.get(peer.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
    let response = client.post(peer.url("/index")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = peer.login("peer-a").await;
    let (status, body) = peer.search(&token, "doc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results_count"], 1);

    let files: Value = client
        .get(peer.url("/files"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(files["total"], 1);
    assert_eq!(files["files"][0]["filename"], "doc.txt");

    let network: Value = client
        .get(peer.url("/network"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(network["total"], 1);

    let response = client
        .post(peer.url("/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _) = peer.search(&token, "doc").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn new_login_supersedes_previous_session() {
    let directory = start_directory().await;
    let peer = TestPeer::start(&directory.address, "peer-a", &[]).await;

    let first = peer.login("peer-a").await;
    let second = peer.login("peer-a").await;
    assert_ne!(first, second);

    let (status, _) = peer.search(&first, "x").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = peer.search(&second, "x").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn failed_logins_are_throttled() {
    let directory = start_directory().await;
    let config = PeerConfig {
        directory_secret: directory_secret("peer-a"),
        security: SecurityConfig {
            max_login_attempts: 2,
            lockout_secs: 60,
            ..SecurityConfig::default()
        },
        ..PeerConfig::default()
    };
    let peer = TestPeer::start_with(&directory.address, "peer-a", &[], config).await;

    for _ in 0..2 {
        let response = peer.login_response("peer-a", "wrong").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid_credentials");
    }

    // Locked out even with the right password
    let response = peer.login_response("peer-a", "hunter2").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn upload_makes_file_searchable() {
    let directory = start_directory().await;
    let peer_a = TestPeer::start(&directory.address, "peer-a", &[]).await;
    let peer_b = TestPeer::start(&directory.address, "peer-b", &[]).await;
    let token_a = peer_a.login("peer-a").await;
    let token_b = peer_b.login("peer-b").await;

    let form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(b"meeting notes".to_vec()).file_name("notes.txt"),
    );
    let response = Client::new()
        .post(peer_a.url("/upload"))
        .bearer_auth(&token_a)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value = response.json().await.unwrap();
    assert_eq!(report["size_bytes"], 13);
    assert_eq!(report["indexed"], true);
    assert_eq!(
        std::fs::read(peer_a.shared().join("notes.txt")).unwrap(),
        b"meeting notes"
    );

    let (_, body) = peer_b.search(&token_b, "notes").await;
    assert_eq!(
        result_pairs(&body),
        vec![("peer-a".to_string(), "notes.txt".to_string(), 13)]
    );

    let form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(b"MZ".to_vec()).file_name("tool.exe"),
    );
    let response = Client::new()
        .post(peer_a.url("/upload"))
        .bearer_auth(&token_a)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_name");

    let form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(Vec::new()).file_name("empty.txt"),
    );
    let response = Client::new()
        .post(peer_a.url("/upload"))
        .bearer_auth(&token_a)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "empty_file");
}

#[tokio::test]
async fn unreachable_directory_fails_index_but_not_login() {
    // Reserve a port and release it so nothing listens there
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", reserved.local_addr().unwrap());
    drop(reserved);

    let peer = TestPeer::start(&dead, "peer-a", &[("doc.txt", 3)]).await;
    let response = peer.login_response("peer-a", "hunter2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["index"]["status"], "failed");
    let token = body["token"].as_str().unwrap().to_string();

    let response = Client::new()
        .post(peer.url("/index"))
        .bearer_auth(&token)
        .json(&json!({ "force_rescan": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let (status, _) = peer.search(&token, "doc").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn wrong_directory_secret_is_refused() {
    let directory = start_directory().await;
    let config = PeerConfig {
        directory_secret: directory_secret("peer-b"),
        ..PeerConfig::default()
    };
    let peer = TestPeer::start_with(&directory.address, "peer-a", &[("doc.txt", 3)], config).await;

    let response = peer.login_response("peer-a", "hunter2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["index"]["status"], "failed");
    assert!(body["index"]["error"].as_str().unwrap().contains("401"));

    let stats: Value = Client::new()
        .get(format!("{}/stats", directory.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_peers"], 0);
}

#[tokio::test]
async fn index_body_is_optional_but_must_be_valid() {
    let directory = start_directory().await;
    let peer = TestPeer::start(&directory.address, "peer-a", &[("doc.txt", 3)]).await;
    let token = peer.login("peer-a").await;
    let client = Client::new();

    for body in ["{\"force_rescan\": tru", "{\"force_rescan\": \"yes\"}", "{\"force\": true}"] {
        let response = client
            .post(peer.url("/index"))
            .bearer_auth(&token)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let error: Value = response.json().await.unwrap();
        assert_eq!(error["error"], "bad_request");
    }

    let response = client
        .post(peer.url("/index"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value = response.json().await.unwrap();
    assert_eq!(report["files_indexed"], 1);
    assert_eq!(report["rescanned"], false);
}

#[tokio::test]
async fn heartbeat_restores_a_forgotten_peer() {
    let directory = start_directory().await;
    let peer = TestPeer::start(&directory.address, "peer-a", &[("doc.txt", 3)]).await;
    let token = peer.login("peer-a").await;
    let client = Client::new();

    let beat: Value = client
        .post(peer.url("/heartbeat"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(beat["status"], "alive");
    assert_eq!(beat["active"], true);

    let response = client
        .delete(format!("{}/peers/peer-a", directory.address))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let (_, body) = peer.search(&token, "doc").await;
    assert_eq!(body["results_count"], 0);

    let beat: Value = client
        .post(peer.url("/heartbeat"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(beat["status"], "reindexed");
    assert_eq!(beat["files_indexed"], 1);

    let (_, body) = peer.search(&token, "doc").await;
    assert_eq!(body["results_count"], 1);
}
