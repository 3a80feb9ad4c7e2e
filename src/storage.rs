//! Object storage for uploaded assets and rendered documents.
//!
//! Keys are derived from entity ids (`agents/{id}/avatar.png`,
//! `quotes/{id}/quote.html`) and objects are publicly readable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid storage endpoint: {0}")]
    Endpoint(String),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores the object and returns its public URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn public_url(&self, key: &str) -> String;
}

pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "text/html" => Some("html"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or("") {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "html" => "text/html; charset=utf-8",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Files under a local directory, served by the `/media/{*key}` route.
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub async fn read_local_object(root: &Path, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    validate_key(key)?;
    match tokio::fs::read(root.join(key)).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(key, "stored object on local disk");
        Ok(self.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/media/{}", self.public_base_url, key)
    }
}

/// Path-style client for any S3-compatible endpoint, signed with AWS Signature V4.
pub struct S3Storage {
    http: reqwest::Client,
    config: S3Config,
    host: String,
}

impl S3Storage {
    pub fn new(http: reqwest::Client, config: S3Config) -> Result<Self, StorageError> {
        let url = reqwest::Url::parse(&config.endpoint)
            .map_err(|err| StorageError::Endpoint(format!("{}: {err}", config.endpoint)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Endpoint(config.endpoint.clone())),
        };
        Ok(Self { http, config, host })
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", uri_encode(&self.config.bucket, false), uri_encode(key, true))
    }

    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload: &[u8],
        extra_headers: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let path = self.object_path(key);
        let payload_hash = sha256_hex(payload);
        let amz_date = Utc::now();
        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_timestamp(&amz_date)),
        ];
        for (name, value) in extra_headers {
            headers.push((name.to_ascii_lowercase(), value.to_string()));
        }
        let authorization = authorization_header(&SigningInput {
            method: method.as_str(),
            path: &path,
            headers: &headers,
            payload_hash: &payload_hash,
            at: amz_date,
            region: &self.config.region,
            service: "s3",
            access_key_id: &self.config.access_key_id,
            secret_access_key: &self.config.secret_access_key,
        });

        let mut request = self
            .http
            .request(method, format!("{}{}", self.config.endpoint, path))
            .header("authorization", authorization);
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<(), StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(StorageError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let response = self
            .signed_request(
                reqwest::Method::PUT,
                key,
                &bytes,
                &[("x-amz-acl", "public-read")],
            )
            .header("content-type", content_type)
            .body(bytes)
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(key, bucket = %self.config.bucket, "stored object in s3");
        Ok(self.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let response = self
            .signed_request(reqwest::Method::DELETE, key, b"", &[])
            .send()
            .await?;
        ensure_success(response).await
    }

    fn public_url(&self, key: &str) -> String {
        match &self.config.public_url {
            Some(base) => format!("{base}/{}", uri_encode(key, true)),
            None => format!("{}{}", self.config.endpoint, self.object_path(key)),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn amz_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3986 encoding as required by SigV4; `/` is kept when `keep_slash`.
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let c = byte as char;
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') || (keep_slash && c == '/') {
            out.push(c);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

pub struct SigningInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Lower-case header names; all of them are signed.
    pub headers: &'a [(String, String)],
    pub payload_hash: &'a str,
    pub at: DateTime<Utc>,
    pub region: &'a str,
    pub service: &'a str,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

pub fn authorization_header(input: &SigningInput<'_>) -> String {
    let mut headers = input
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect::<Vec<_>>();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        input.method, input.path, canonical_headers, signed_headers, input.payload_hash
    );

    let date = input.at.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{}/aws4_request", input.region, input.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_timestamp(&input.at),
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(input.secret_access_key, &date, input.region, input.service);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        input.access_key_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(validate_key("agents/abc/avatar.png").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("agents//x").is_err());
        assert!(validate_key("agents/a b.png").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn uri_encoding_keeps_unreserved_characters() {
        assert_eq!(uri_encode("a b/c~d", true), "a%20b/c~d");
        assert_eq!(uri_encode("a/b", false), "a%2Fb");
    }

    #[test]
    fn signing_key_depends_on_every_scope_part() {
        let base = signing_key("secret", "20240101", "eu-west-1", "s3");
        assert_eq!(base.len(), 32);
        assert_eq!(base, signing_key("secret", "20240101", "eu-west-1", "s3"));
        assert_ne!(base, signing_key("secret", "20240102", "eu-west-1", "s3"));
        assert_ne!(base, signing_key("secret", "20240101", "us-east-1", "s3"));
        assert_ne!(base, signing_key("other", "20240101", "eu-west-1", "s3"));
    }

    #[test]
    fn authorization_header_lists_sorted_signed_headers() {
        let headers = vec![
            ("x-amz-date".to_string(), "20240101T000000Z".to_string()),
            ("Host".to_string(), "minio.local:9000".to_string()),
            ("x-amz-content-sha256".to_string(), sha256_hex(b"")),
        ];
        let input = SigningInput {
            method: "PUT",
            path: "/bucket/agents/a/avatar.png",
            headers: &headers,
            payload_hash: &sha256_hex(b""),
            at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            region: "us-east-1",
            service: "s3",
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "secret",
        };
        let header = authorization_header(&input);
        assert!(header.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/s3/aws4_request, "
        ));
        assert!(header.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date, "));
        let signature = header.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(header, authorization_header(&input));
    }

    #[test]
    fn authorization_header_matches_the_aws_get_vanilla_vector() {
        let headers = vec![
            ("Host".to_string(), "example.amazonaws.com".to_string()),
            ("X-Amz-Date".to_string(), "20150830T123600Z".to_string()),
        ];
        let input = SigningInput {
            method: "GET",
            path: "/",
            headers: &headers,
            payload_hash: &sha256_hex(b""),
            at: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
            region: "us-east-1",
            service: "service",
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        };
        assert_eq!(
            authorization_header(&input),
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn s3_public_urls_are_path_style_unless_overridden() {
        let config = S3Config {
            bucket: "assets".into(),
            region: "us-east-1".into(),
            endpoint: "http://minio.local:9000".into(),
            access_key_id: "id".into(),
            secret_access_key: "secret".into(),
            public_url: None,
        };
        let storage = S3Storage::new(reqwest::Client::new(), config.clone()).unwrap();
        assert_eq!(storage.host, "minio.local:9000");
        assert_eq!(
            storage.public_url("quotes/q1/quote.html"),
            "http://minio.local:9000/assets/quotes/q1/quote.html"
        );

        let cdn = S3Storage::new(
            reqwest::Client::new(),
            S3Config {
                public_url: Some("https://cdn.example.com".into()),
                ..config
            },
        )
        .unwrap();
        assert_eq!(
            cdn.public_url("agents/a/avatar.png"),
            "https://cdn.example.com/agents/a/avatar.png"
        );
    }

    #[test]
    fn content_types_map_to_extensions() {
        assert_eq!(extension_for_content_type("image/PNG"), Some("png"));
        assert_eq!(extension_for_content_type("image/jpeg; q=1"), Some("jpg"));
        assert_eq!(extension_for_content_type("application/zip"), None);
        assert_eq!(extension_for_content_type("image/svg+xml"), None);
        assert_eq!(content_type_for_key("a/b.svg"), "application/octet-stream");
    }

    #[tokio::test]
    async fn local_storage_writes_reads_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), "http://localhost:4000/");
        let url = storage
            .put("agents/a1/avatar.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:4000/media/agents/a1/avatar.png");

        let bytes = read_local_object(storage.root(), "agents/a1/avatar.png")
            .await
            .unwrap();
        assert_eq!(bytes, Some(vec![1, 2, 3]));

        storage.delete("agents/a1/avatar.png").await.unwrap();
        storage.delete("agents/a1/avatar.png").await.unwrap();
        assert_eq!(
            read_local_object(storage.root(), "agents/a1/avatar.png")
                .await
                .unwrap(),
            None
        );
        assert!(storage.put("../escape", vec![], "text/plain").await.is_err());
    }
}
