//! Object storage for uploaded archive artifacts.
//!
//! [`S3Store`] talks to any S3-compatible service (AWS, DigitalOcean Spaces,
//! MinIO) over the REST API with AWS Signature V4, using only `hmac` and
//! `sha2`. [`MemoryObjectStore`] backs tests and dry runs.
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and
//! optionally `AWS_SESSION_TOKEN`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{StageError, StageResult};
use crate::models::Artifact;
use crate::namer;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> StageResult<Vec<String>>;

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> StageResult<()>;

    /// URL where `key` is reachable once uploaded.
    fn public_url(&self, key: &str) -> String;
}

/// Upload a local export under a collision-free key derived from the
/// channel name.
pub async fn upload_artifact(
    store: &dyn ObjectStore,
    local_path: &Path,
    channel_name: &str,
    content_type: &str,
) -> StageResult<Artifact> {
    let body = tokio::fs::read(local_path)
        .await
        .map_err(|e| StageError::Data(format!("cannot read {}: {}", local_path.display(), e)))?;

    let key = namer::resolve_unique_key(channel_name, store).await;
    info!(key = %key, bytes = body.len(), "uploading artifact");
    store.put_object(&key, body, content_type).await?;

    let artifact = Artifact {
        local_path: local_path.to_path_buf(),
        public_url: store.public_url(&key),
        storage_key: key,
    };
    info!(url = %artifact.public_url, "artifact uploaded");
    Ok(artifact)
}

// ============ In-memory store ============

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (String, Vec<u8>)>>,
    base_url: String,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            base_url: base_url.into(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .ok()
            .and_then(|o| o.get(key).map(|(ct, _)| ct.clone()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_keys(&self, prefix: &str) -> StageResult<Vec<String>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StageError::Transport("object map poisoned".into()))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> StageResult<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StageError::Transport("object map poisoned".into()))?;
        objects.insert(key.to_string(), (content_type.to_string(), body));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

// ============ S3-compatible store ============

type HmacSha256 = Hmac<Sha256>;

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = crate::mask::secret_env("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = crate::mask::secret_env("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = crate::mask::secret_env("AWS_SESSION_TOKEN");

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3Store {
    client: reqwest::Client,
    creds: AwsCredentials,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    force_path_style: bool,
    acl: String,
    public_base_url: String,
}

impl S3Store {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            creds: AwsCredentials::from_env()?,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            force_path_style: config.force_path_style,
            acl: config.acl.clone(),
            public_base_url: config.public_base_url.clone(),
        })
    }

    fn scheme(&self) -> &'static str {
        match &self.endpoint_url {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Hostname for requests: virtual-hosted unless path style is forced.
    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) => {
                let bare = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                if self.force_path_style {
                    bare.to_string()
                } else {
                    format!("{}.{}", self.bucket, bare)
                }
            }
            None if self.force_path_style => format!("s3.{}.amazonaws.com", self.region),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    /// Request path for `key` (empty key → bucket root).
    fn canonical_uri(&self, key: &str) -> String {
        let encoded = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if self.force_path_style {
            format!("/{}/{}", self.bucket, encoded)
        } else {
            format!("/{}", encoded)
        }
    }

    /// Build SigV4 headers for a request. `extra` headers are signed too.
    fn signed_headers(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        extra: &[(&str, &str)],
        payload_hash: &str,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        for (k, v) in extra {
            headers.push((k.to_ascii_lowercase(), v.to_string()));
        }
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        // `host` is set by reqwest from the URL
        let mut out: Vec<(String, String)> =
            headers.into_iter().filter(|(k, _)| k != "host").collect();
        out.push(("authorization".to_string(), authorization));
        out
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_keys(&self, prefix: &str) -> StageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        let canonical_uri = self.canonical_uri("");

        loop {
            let mut params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(ref token) = continuation_token {
                params.push(("continuation-token".to_string(), token.clone()));
            }
            params.sort_by(|a, b| a.0.cmp(&b.0));
            let query: String = params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let payload_hash = hex_sha256(b"");
            let headers = self.signed_headers("GET", &canonical_uri, &query, &[], &payload_hash);
            let url = format!(
                "{}://{}{}?{}",
                self.scheme(),
                self.host(),
                canonical_uri,
                query
            );

            let mut req = self.client.get(&url);
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            let resp = req.send().await.map_err(|e| {
                StageError::Transport(format!(
                    "failed to list s3://{}/{}: {}",
                    self.bucket, prefix, e
                ))
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(StageError::Transport(format!(
                    "ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                )));
            }

            let xml = resp.text().await?;
            let (batch, truncated, next) = parse_list_keys(&xml);
            keys.extend(batch);

            if truncated && next.is_some() {
                continuation_token = next;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> StageResult<()> {
        let canonical_uri = self.canonical_uri(key);
        let payload_hash = hex_sha256(&body);
        let headers = self.signed_headers(
            "PUT",
            &canonical_uri,
            "",
            &[("content-type", content_type), ("x-amz-acl", &self.acl)],
            &payload_hash,
        );
        let url = format!("{}://{}{}", self.scheme(), self.host(), canonical_uri);

        let mut req = self.client.put(&url).body(body);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.map_err(|e| {
            StageError::Transport(format!("failed to put s3://{}/{}: {}", self.bucket, key, e))
        })?;

        let status = resp.status();
        if status.as_u16() == 403 {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::Permission(format!(
                "PutObject denied for '{}': {}",
                key,
                body.chars().take(300).collect::<String>()
            )));
        }
        if !status.is_success() {
            return Err(StageError::Transport(format!(
                "PutObject failed (HTTP {}) for key '{}'",
                status, key
            )));
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

// ============ SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

/// Keys, truncation flag, and continuation token from a `ListObjectsV2` body.
fn parse_list_keys(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let truncated = extract_xml_value(xml, "IsTruncated").is_some_and(|v| v == "true");
    let next = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, truncated, next)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_listing_page() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>abc</NextContinuationToken>
            <Contents><Key>general.html</Key><Size>10</Size></Contents>
            <Contents><Key>general-1.html</Key><Size>12</Size></Contents>
            <Contents><Key>folder/</Key><Size>0</Size></Contents>
        </ListBucketResult>"#;
        let (keys, truncated, next) = parse_list_keys(xml);
        assert_eq!(keys, vec!["general.html", "general-1.html"]);
        assert!(truncated);
        assert_eq!(next.as_deref(), Some("abc"));
    }

    #[test]
    fn uri_encoding_keeps_unreserved() {
        assert_eq!(uri_encode("general-1.html"), "general-1.html");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20261017", "us-east-1", "s3");
        let b = derive_signing_key("secret", "20261017", "us-east-1", "s3");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, derive_signing_key("secret", "20261018", "us-east-1", "s3"));
    }

    #[tokio::test]
    async fn upload_resolves_collisions() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("42.html");
        std::fs::write(&file, "<html></html>").unwrap();

        let store = MemoryObjectStore::new("https://archive.example.com/");
        store
            .put_object("general.html", vec![], "text/html")
            .await
            .unwrap();

        let artifact = upload_artifact(&store, &file, "General", "text/html")
            .await
            .unwrap();
        assert_eq!(artifact.storage_key, "general-1.html");
        assert_eq!(
            artifact.public_url,
            "https://archive.example.com/general-1.html"
        );
        assert_eq!(
            store.content_type("general-1.html").as_deref(),
            Some("text/html")
        );
    }

    #[tokio::test]
    async fn upload_of_missing_file_is_data_failure() {
        let store = MemoryObjectStore::new("https://x");
        let err = upload_artifact(&store, Path::new("/nonexistent/x.html"), "g", "text/html")
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Data(_)));
        assert!(store.keys().is_empty());
    }
}
