use std::{
    collections::{HashMap, HashSet},
    io::Read,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{
    Method, StatusCode, Url,
    blocking::{Body, Client, Response},
    header::CONTENT_LENGTH,
};
use shared::{ArtifactName, SIDECAR_SUFFIX, Sidecar, load_trust_store};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    InFlight, Payload, RemoteOptions, StorageBackend, StorageError, StoredArtifact,
    sigv4::{Signer, UNSIGNED_PAYLOAD, canonical_query, uri_encode},
};
use crate::credentials::{AccessKey, RemoteCredentials};

/// How much of an error body is kept in an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Patterns for the parts of a ListObjectsV2 response that are used.
struct ListingPatterns {
    contents: Regex,
    key: Regex,
    size: Regex,
    last_modified: Regex,
    truncated: Regex,
    continuation: Regex,
}

impl ListingPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            contents: Regex::new(r"(?s)<Contents>(.*?)</Contents>")?,
            key: Regex::new(r"(?s)<Key>(.*?)</Key>")?,
            size: Regex::new(r"<Size>(\d+)</Size>")?,
            last_modified: Regex::new(r"<LastModified>([^<]+)</LastModified>")?,
            truncated: Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>")?,
            continuation: Regex::new(r"(?s)<NextContinuationToken>(.*?)</NextContinuationToken>")?,
        })
    }
}

/// One object from a listing page.
struct ListedObject {
    key: String,
    size: u64,
    last_modified: DateTime<Utc>,
}

/// Stores artifacts in an S3 compatible object store.
///
/// Each object is written with a single `PUT`, so an object is either absent or complete.
pub struct RemoteStore {
    client: Client,
    endpoint: Url,
    host: String,
    bucket: String,
    region: String,
    prefix: String,
    key: AccessKey,
    patterns: ListingPatterns,
    reported: Mutex<HashSet<String>>,
    in_flight: InFlight,
}

impl RemoteStore {
    /// Create a client for the store described by `options` and `credentials`.
    pub fn new(options: RemoteOptions, credentials: RemoteCredentials) -> Result<Self, StorageError> {
        let endpoint = Url::parse(&credentials.location.endpoint)
            .map_err(|e| StorageError::Client(format!("invalid endpoint: {e}")))?;

        let Some(host_name) = endpoint.host_str() else {
            return Err(StorageError::Client("endpoint has no host".to_string()));
        };
        let host = match endpoint.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };

        let mut builder = Client::builder().timeout(options.timeout());

        if let Some(root_certificate_file) = &options.root_certificate_file {
            let trust_store = load_trust_store(root_certificate_file)
                .map_err(|e| StorageError::Client(e.to_string()))?;

            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let tls = rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| StorageError::Client(e.to_string()))?
                .with_root_certificates(trust_store)
                .with_no_client_auth();

            builder = builder.use_preconfigured_tls(tls);
        }

        let client = builder.build().map_err(|e| StorageError::Client(e.to_string()))?;
        let patterns = ListingPatterns::new().map_err(|e| StorageError::Client(e.to_string()))?;

        let RemoteCredentials { location, key } = credentials;

        Ok(Self {
            client,
            endpoint,
            host,
            bucket: location.bucket,
            region: location.region,
            prefix: options.prefix,
            key,
            patterns,
            reported: Mutex::new(HashSet::new()),
            in_flight: InFlight::default(),
        })
    }

    /// The path of the bucket, or of an object in it, ready for signing.
    fn path(&self, object: Option<&str>) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        let bucket = uri_encode(&self.bucket, false);
        match object {
            Some(object) => format!("{base}/{bucket}/{}", uri_encode(object, true)),
            None => format!("{base}/{bucket}"),
        }
    }

    fn object_key(&self, file_name: &str) -> String {
        format!("{}{file_name}", self.prefix)
    }

    fn send(
        &self,
        method: Method,
        object: Option<&str>,
        query: &[(&str, &str)],
        body: Option<Body>,
    ) -> Result<Response, StorageError> {
        let path = self.path(object);
        let query = canonical_query(query);

        let signature = Signer {
            access_key_id: &self.key.access_key_id,
            secret_access_key: &self.key.secret_access_key,
            region: &self.region,
            service: "s3",
        }
        .sign(method.as_str(), &self.host, &path, &query, Utc::now())?;

        let mut url = self.endpoint.clone();
        url.set_path(&path);
        url.set_query((!query.is_empty()).then_some(query.as_str()));

        let mut request = self
            .client
            .request(method, url)
            .header("x-amz-date", signature.amz_date)
            .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
            .header("Authorization", signature.authorization);

        if let Some(body) = body {
            request = request.body(body);
        }

        request.send().map_err(|e| StorageError::Network(e.to_string()))
    }

    fn send_checked(
        &self,
        method: Method,
        object: Option<&str>,
        query: &[(&str, &str)],
        body: Option<Body>,
    ) -> Result<Response, StorageError> {
        let name = object.unwrap_or(self.bucket.as_str()).to_string();
        let response = self.send(method, object, query, body)?;
        check_status(response, &name)
    }

    fn put_object(&self, key: &str, body: Body) -> Result<(), StorageError> {
        self.send_checked(Method::PUT, Some(key), &[], Some(body))?;
        Ok(())
    }

    fn head_object(&self, key: &str) -> Result<u64, StorageError> {
        let response = self.send_checked(Method::HEAD, Some(key), &[], None)?;

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| StorageError::Remote(response.status().as_u16(), "no content length".to_string()))
    }

    fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.head_object(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.send_checked(Method::DELETE, Some(key), &[], None)?;
        Ok(())
    }

    fn read_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut response = self.send_checked(Method::GET, Some(key), &[], None)?;
        let mut bytes = Vec::new();
        response
            .read_to_end(&mut bytes)
            .map_err(|e| StorageError::Network(e.to_string()))?;
        Ok(bytes)
    }

    /// Every object under the prefix, following continuation tokens.
    fn list_objects(&self) -> Result<Vec<ListedObject>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2"), ("prefix", self.prefix.as_str())];
            if let Some(token) = &continuation {
                query.push(("continuation-token", token.as_str()));
            }

            let body = self
                .send_checked(Method::GET, None, &query, None)?
                .text()
                .map_err(|e| StorageError::Network(e.to_string()))?;

            for contents in self.patterns.contents.captures_iter(&body) {
                let Some(contents) = contents.get(1).map(|m| m.as_str()) else {
                    continue;
                };

                let Some(key) = capture(&self.patterns.key, contents) else {
                    continue;
                };
                let size = capture(&self.patterns.size, contents)
                    .and_then(|size| size.parse().ok())
                    .unwrap_or_default();
                let last_modified = capture(&self.patterns.last_modified, contents)
                    .and_then(|time| DateTime::parse_from_rfc3339(&time).ok())
                    .map(|time| time.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);

                objects.push(ListedObject {
                    key,
                    size,
                    last_modified,
                });
            }

            if !self.patterns.truncated.is_match(&body) {
                break;
            }

            continuation = capture(&self.patterns.continuation, &body);
            if continuation.is_none() {
                warn!("[Remote Store] Listing was truncated without a continuation token");
                break;
            }
        }

        Ok(objects)
    }

    fn report_once(&self, name: &str, message: &str) {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        if reported.insert(name.to_string()) {
            warn!("[Remote Store] {name}: {message}");
        }
    }
}

/// The first capture group, with XML entities unescaped.
fn capture(pattern: &Regex, haystack: &str) -> Option<String> {
    pattern
        .captures(haystack)
        .and_then(|captures| captures.get(1))
        .map(|m| unescape_xml(m.as_str()))
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn check_status(response: Response, name: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(StorageError::Auth(format!("{status} for '{name}'")))
        }
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(name.to_string())),
        _ => Err(StorageError::Remote(status.as_u16(), body)),
    }
}

impl StorageBackend for RemoteStore {
    fn describe(&self) -> String {
        format!("remote:{}/{}/{}", self.endpoint, self.bucket, self.prefix)
    }

    fn put(&self, name: &ArtifactName, payload: Payload, sidecar: &Sidecar) -> Result<u64, StorageError> {
        let Payload { reader, len } = payload;
        let _in_flight = self.in_flight.hold(name);
        let archive_key = self.object_key(name.as_str());

        self.put_object(&archive_key, Body::sized(reader, len))?;

        let sidecar_bytes = sidecar.to_bytes()?;
        let sidecar_key = self.object_key(&name.sidecar_name());
        if let Err(error) = self.put_object(&sidecar_key, Body::from(sidecar_bytes)) {
            if let Err(cleanup) = self.delete_object(&archive_key) {
                warn!("[Remote Store] Could not remove {name} after its sidecar failed: {cleanup}");
            }
            return Err(error);
        }

        debug!("[Remote Store] Stored {name} ({len} bytes)");

        Ok(len)
    }

    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let name = ArtifactName::parse(name).map_err(|_| StorageError::NotFound(name.to_string()))?;
        let response = self.send_checked(Method::GET, Some(&self.object_key(name.as_str())), &[], None)?;
        Ok(Box::new(response))
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        let name = ArtifactName::parse(name).map_err(|_| StorageError::NotFound(name.to_string()))?;
        self.head_object(&self.object_key(name.as_str()))
    }

    fn list(&self) -> Result<Vec<StoredArtifact>, StorageError> {
        let mut archives: HashMap<String, ListedObject> = HashMap::new();
        let mut sidecars: HashSet<String> = HashSet::new();

        for object in self.list_objects()? {
            let Some(file_name) = object.key.strip_prefix(&self.prefix) else {
                continue;
            };
            // Objects in nested "directories" belong to something else.
            if file_name.contains('/') {
                continue;
            }

            // Only sidecars of valid artifact names are ours; other json objects are left alone.
            if let Some(archive) = ArtifactName::of_sidecar(file_name) {
                if !self.in_flight.contains(archive.as_str()) {
                    sidecars.insert(archive.as_str().to_string());
                }
            } else if ArtifactName::is_archive(file_name) && !self.in_flight.contains(file_name) {
                archives.insert(file_name.to_string(), object);
            }
        }

        for orphan in sidecars.iter().filter(|name| !archives.contains_key(*name)) {
            self.report_once(orphan, "sidecar has no archive, removing it");
            let key = self.object_key(&format!("{orphan}{SIDECAR_SUFFIX}"));
            if let Err(error) = self.delete_object(&key) {
                warn!("[Remote Store] Could not remove orphaned sidecar '{key}': {error}");
            }
        }

        let mut artifacts = Vec::with_capacity(archives.len());
        for (file_name, object) in archives {
            let name = match ArtifactName::parse(&file_name) {
                Ok(name) => name,
                Err(error) => {
                    self.report_once(&file_name, &format!("not an artifact name: {error}"));
                    continue;
                }
            };

            let sidecar = if sidecars.contains(&file_name) {
                let parsed = self
                    .read_object(&self.object_key(&name.sidecar_name()))
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| Sidecar::from_bytes(&bytes).map_err(|e| e.to_string()));

                if let Err(error) = &parsed {
                    self.report_once(&file_name, &format!("sidecar is unreadable: {error}"));
                }
                Some(parsed)
            } else {
                self.report_once(&file_name, "archive has no sidecar");
                None
            };

            artifacts.push(StoredArtifact::from_parts(
                name,
                object.size,
                object.last_modified,
                sidecar,
            ));
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(artifacts)
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        let name = ArtifactName::parse(name).map_err(|_| StorageError::NotFound(name.to_string()))?;
        let archive_key = self.object_key(name.as_str());
        let sidecar_key = self.object_key(&name.sidecar_name());

        // Deleting a missing object succeeds on S3, so look first.
        let archive_exists = self.object_exists(&archive_key)?;
        let sidecar_exists = self.object_exists(&sidecar_key)?;
        if !archive_exists && !sidecar_exists {
            return Err(StorageError::NotFound(name.to_string()));
        }

        if archive_exists {
            self.delete_object(&archive_key)?;
        }
        if sidecar_exists {
            if let Err(error) = self.delete_object(&sidecar_key) {
                warn!("[Remote Store] Deleted {name} but not its sidecar: {error}");
            }
        }

        Ok(())
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        let probe = format!("connection-test-{}", Uuid::new_v4());
        let key = self.object_key(&format!(".{probe}"));

        self.put_object(&key, Body::from(probe.clone().into_bytes()))?;

        let read_back = self.read_object(&key);
        let deleted = self.delete_object(&key);

        if read_back? != probe.as_bytes() {
            return Err(StorageError::Consistency(
                key,
                "connection probe did not read back".to_string(),
            ));
        }
        deleted
    }
}
