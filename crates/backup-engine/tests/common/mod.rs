//! # common
//!

#![allow(dead_code)]

use core::time::Duration;
use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Instant,
};

use backup_engine::{
    Config, Engine,
    database::Database,
    queue::{JobId, JobState, Progress},
    snapshot::MockProvider,
    storage::StorageConfig,
    vault::Vault,
};
use tempfile::TempDir;

pub const SERVER_ID: &str = "test-server";

/// An engine over an in-memory database, a mock container engine and a scratch directory.
pub struct TestEngine {
    pub engine: Engine,
    pub provider: Arc<MockProvider>,
    pub database: Arc<Database>,
    pub directory: TempDir,
}

impl TestEngine {
    pub fn artifact_directory(&self) -> PathBuf {
        self.directory.path().join("artifacts")
    }

    /// Wait for every job, panicking if one is lost.
    pub fn wait_all(&self, ids: &[JobId]) -> Vec<Progress> {
        ids.iter()
            .map(|id| self.engine.wait(*id).expect("job should reach a terminal state"))
            .collect()
    }
}

pub fn test_config(directory: &Path) -> Config {
    let mut config = Config::default();
    config.server_id = SERVER_ID.to_string();
    config.data_directory = directory.join("data");
    config.key_file = directory.join("vault.key");
    config.log_directory = directory.join("logs");
    config.storage = StorageConfig::Local {
        directory: directory.join("artifacts"),
    };
    config.scheduler.poll_interval_seconds = 1;
    config.scheduler.supervisor_interval_seconds = 1;
    config
}

pub fn test_engine(provider: MockProvider) -> TestEngine {
    let directory = tempfile::tempdir().unwrap();
    let database = Arc::new(Database::open_in_memory().unwrap());
    test_engine_with(provider, directory, database, Vault::generate())
}

/// Build an engine over parts the test keeps its own handles to.
pub fn test_engine_with(
    provider: MockProvider,
    directory: TempDir,
    database: Arc<Database>,
    vault: Vault,
) -> TestEngine {
    shared::test::init_test_logger();

    let config = test_config(directory.path());
    let provider = Arc::new(provider);

    let engine = Engine::with_parts(
        config,
        Arc::clone(&database),
        vault,
        Arc::clone(&provider) as _,
        Arc::clone(&provider) as _,
    )
    .unwrap();

    TestEngine {
        engine,
        provider,
        database,
        directory,
    }
}

/// Poll a job until it reaches `state`.
pub fn wait_for_state(engine: &Engine, id: JobId, state: JobState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if engine.get_progress(id).is_some_and(|progress| progress.state == state) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }

    panic!("job {id} never reached {state}");
}

/// A request seen by [`http_server`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub body: Vec<u8>,
}

pub type Handler = Arc<dyn Fn(&SeenRequest) -> (&'static str, Vec<u8>) + Send + Sync>;

/// A loopback HTTP server answering each request with `handler`, one thread per connection.
/// Returns the endpoint and every request it has seen.
pub fn http_server(handler: Handler) -> (String, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            let handler = Arc::clone(&handler);
            let log = Arc::clone(&log);
            thread::spawn(move || respond(stream, &handler, &log));
        }
    });

    (format!("http://{address}"), seen)
}

/// A loopback HTTP server answering every request with `status`.
pub fn status_server(status: &'static str) -> String {
    let body = "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>";
    http_server(Arc::new(move |_: &SeenRequest| (status, body.as_bytes().to_vec()))).0
}

/// A minimal in-memory S3 bucket named `bucket`: object PUT, GET, HEAD and DELETE plus an
/// unpaginated ListObjectsV2.
pub fn object_server(
    bucket: &'static str,
) -> (String, Arc<Mutex<BTreeMap<String, Vec<u8>>>>, Arc<Mutex<Vec<SeenRequest>>>) {
    object_server_with(bucket, |_| {})
}

/// An [`object_server`] that calls `before` with each request before touching the bucket.
pub fn object_server_with(
    bucket: &'static str,
    before: impl Fn(&SeenRequest) + Send + Sync + 'static,
) -> (String, Arc<Mutex<BTreeMap<String, Vec<u8>>>>, Arc<Mutex<Vec<SeenRequest>>>) {
    let objects = Arc::new(Mutex::new(BTreeMap::<String, Vec<u8>>::new()));
    let store = Arc::clone(&objects);
    let bucket_path = format!("/{bucket}");

    let (endpoint, seen) = http_server(Arc::new(move |request: &SeenRequest| {
        before(request);
        let mut objects = store.lock().unwrap();
        let (path, query) = request
            .target
            .split_once('?')
            .unwrap_or((request.target.as_str(), ""));

        if path == bucket_path && request.method == "GET" && query.contains("list-type=2") {
            return ("200 OK", list_objects(&objects).into_bytes());
        }

        let Some(key) = path.strip_prefix(&format!("{bucket_path}/")) else {
            return ("404 Not Found", Vec::new());
        };

        match request.method.as_str() {
            "PUT" => {
                objects.insert(key.to_string(), request.body.clone());
                ("200 OK", Vec::new())
            }
            "GET" | "HEAD" => match objects.get(key) {
                Some(bytes) => ("200 OK", bytes.clone()),
                None => ("404 Not Found", Vec::new()),
            },
            "DELETE" => {
                objects.remove(key);
                ("204 No Content", Vec::new())
            }
            _ => ("405 Method Not Allowed", Vec::new()),
        }
    }));

    (endpoint, objects, seen)
}

/// A ListObjectsV2 body for every object.
pub fn list_objects(objects: &BTreeMap<String, Vec<u8>>) -> String {
    let contents: String = objects
        .iter()
        .map(|(key, bytes)| {
            format!(
                "<Contents><Key>{key}</Key><LastModified>2026-10-19T08:00:00.000Z</LastModified><Size>{}</Size></Contents>",
                bytes.len()
            )
        })
        .collect();

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult><IsTruncated>false</IsTruncated>{contents}</ListBucketResult>"
    )
}

fn respond(stream: TcpStream, handler: &Handler, seen: &Mutex<Vec<SeenRequest>>) {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    // Read the head and any body so the client never sees a reset.
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).is_err() {
        return;
    }

    let request = SeenRequest {
        method,
        target,
        body,
    };
    let (status, payload) = handler(&request);
    let is_head = request.method == "HEAD";
    seen.lock().unwrap().push(request);

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );

    let mut stream = reader.into_inner();
    let _ = stream.write_all(head.as_bytes());
    if !is_head {
        let _ = stream.write_all(&payload);
    }
    let _ = stream.flush();
}
