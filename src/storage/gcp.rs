//! GCP Cloud Storage gateway storage backend.
//!
//! Proxies byte storage to a GCS bucket via the JSON API, namespacing
//! logical buckets under a key prefix:
//!
//! ```text
//! Objects:  {prefix}{bucket}/{key}
//! Parts:    {prefix}.parts/{upload_id}/{part_number}
//! ```
//!
//! Assembly uses GCS `compose`, which accepts at most 32 sources per
//! call; larger uploads chain through intermediate composite objects.
//! Part MD5s come from GCS object metadata (`md5Hash`, base64), so the
//! composite ETag is computed without downloading any part bytes.
//!
//! Tokens come from Application Default Credentials via
//! [`crate::gcp_auth::GcpTokenProvider`].

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::backend::{AssembledObject, ObjectStat, PartSource, StorageBackend};
use crate::config::GcpStorageConfig;
use crate::errors::{StoreError, StoreResult};
use crate::gcp_auth::GcpTokenProvider;
use crate::types::{composite_etag, now_iso8601, BoxFut, ByteRange};

const PROVIDER: &str = "gcs";

/// GCS compose() accepts at most 32 source objects per call.
const MAX_COMPOSE_SOURCES: usize = 32;

const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Debug, Deserialize)]
struct GcsObjectMeta {
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "md5Hash")]
    md5_hash: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListPage {
    #[serde(default)]
    items: Vec<GcsListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListItem {
    name: String,
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn range_header(range: &ByteRange) -> Option<String> {
    match (range.start, range.end) {
        (Some(first), Some(last)) => Some(format!("bytes={first}-{last}")),
        (Some(first), None) => Some(format!("bytes={first}-")),
        (None, Some(suffix)) => Some(format!("bytes=-{suffix}")),
        (None, None) => None,
    }
}

fn upstream_status(status: StatusCode, operation: &str) -> StoreError {
    StoreError::upstream(
        PROVIDER,
        anyhow::anyhow!("{operation} returned HTTP {status}"),
    )
}

/// Gateway backend that forwards storage operations to GCS.
pub struct GcpGatewayBackend {
    client: reqwest::Client,
    tokens: GcpTokenProvider,
    /// The single upstream GCS bucket.
    bucket: String,
    /// Key prefix for all objects in the upstream bucket.
    prefix: String,
}

impl GcpGatewayBackend {
    pub fn connect(config: &GcpStorageConfig) -> StoreResult<Self> {
        if !config.credentials_file.is_empty() {
            // ADC picks this up when resolving tokens.
            std::env::set_var("GOOGLE_APPLICATION_CREDENTIALS", &config.credentials_file);
        }
        let client = reqwest::Client::new();
        info!(bucket = %config.bucket, prefix = %config.prefix,
              "GCS gateway storage backend ready");
        Ok(Self {
            tokens: GcpTokenProvider::new(client.clone()),
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    fn object_name(&self, bucket: &str, key: &str) -> String {
        format!("{}{}/{}", self.prefix, bucket, key)
    }

    fn part_name(&self, upload_id: &str, part_number: u32) -> String {
        format!("{}.parts/{}/{}", self.prefix, upload_id, part_number)
    }

    fn parts_prefix(&self, upload_id: &str) -> String {
        format!("{}.parts/{}/", self.prefix, upload_id)
    }

    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<String> {
        let mut hasher = Md5::new();
        hasher.update(&data);
        let etag = format!("\"{}\"", hex::encode(hasher.finalize()));

        let token = self.tokens.bearer().await?;
        let url = format!(
            "{GCS_UPLOAD_BASE}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            urlencode(name)
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        if !response.status().is_success() {
            return Err(upstream_status(response.status(), "upload"));
        }
        Ok(etag)
    }

    async fn download(&self, name: &str, range: Option<&ByteRange>) -> StoreResult<Option<Bytes>> {
        let token = self.tokens.bearer().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{}/o/{}?alt=media",
            self.bucket,
            urlencode(name)
        );
        let mut request = self.client.get(&url).bearer_auth(token);
        if let Some(header) = range.and_then(range_header) {
            request = request.header("range", header);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::upstream(PROVIDER, e))?,
            )),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(StoreError::InvalidRange),
            status => Err(upstream_status(status, "download")),
        }
    }

    async fn object_meta(&self, name: &str) -> StoreResult<Option<GcsObjectMeta>> {
        let token = self.tokens.bearer().await?;
        let url = format!("{GCS_API_BASE}/b/{}/o/{}", self.bucket, urlencode(name));
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => Ok(Some(
                response
                    .json::<GcsObjectMeta>()
                    .await
                    .map_err(|e| StoreError::upstream(PROVIDER, e))?,
            )),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(upstream_status(status, "stat")),
        }
    }

    /// Idempotent delete: 404 is success.
    async fn delete_name(&self, name: &str) -> StoreResult<()> {
        let token = self.tokens.bearer().await?;
        let url = format!("{GCS_API_BASE}/b/{}/o/{}", self.bucket, urlencode(name));
        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(upstream_status(status, "delete")),
        }
    }

    async fn list_names(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.tokens.bearer().await?;
            let mut url = format!(
                "{GCS_API_BASE}/b/{}/o?prefix={}",
                self.bucket,
                urlencode(prefix)
            );
            if let Some(pt) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencode(pt)));
            }
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| StoreError::upstream(PROVIDER, e))?;
            if !response.status().is_success() {
                return Err(upstream_status(response.status(), "list"));
            }
            let page = response
                .json::<GcsListPage>()
                .await
                .map_err(|e| StoreError::upstream(PROVIDER, e))?;
            names.extend(page.items.into_iter().map(|i| i.name));
            match page.next_page_token {
                Some(pt) => page_token = Some(pt),
                None => break,
            }
        }
        Ok(names)
    }

    /// One compose call: at most [`MAX_COMPOSE_SOURCES`] sources into
    /// `dest`.
    async fn compose(&self, sources: &[String], dest: &str) -> StoreResult<()> {
        let token = self.tokens.bearer().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{}/o/{}/compose",
            self.bucket,
            urlencode(dest)
        );
        let body = json!({
            "sourceObjects": sources.iter().map(|s| json!({"name": s})).collect::<Vec<_>>(),
            "destination": {"contentType": "application/octet-stream"},
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        if !response.status().is_success() {
            return Err(upstream_status(response.status(), "compose"));
        }
        Ok(())
    }
}

impl StorageBackend for GcpGatewayBackend {
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFut<'_, String> {
        let name = self.object_name(bucket, key);
        Box::pin(async move { self.upload(&name, data).await })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BoxFut<'_, Bytes> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let name = self.object_name(&bucket, &key);
        Box::pin(async move {
            self.download(&name, range.as_ref())
                .await?
                .ok_or(StoreError::NoSuchKey { bucket, key })
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ObjectStat> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let name = self.object_name(&bucket, &key);
        Box::pin(async move {
            let meta = self
                .object_meta(&name)
                .await?
                .ok_or(StoreError::NoSuchKey { bucket, key })?;
            let etag = meta
                .md5_hash
                .as_deref()
                .and_then(|b64| BASE64_STANDARD.decode(b64).ok())
                .map(|digest| format!("\"{}\"", hex::encode(digest)))
                .unwrap_or_default();
            Ok(ObjectStat {
                size: meta.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                etag,
                last_modified: meta.updated.unwrap_or_else(now_iso8601),
            })
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let name = self.object_name(bucket, key);
        Box::pin(async move { self.delete_name(&name).await })
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFut<'_, String> {
        let src_bucket = src_bucket.to_string();
        let src_key = src_key.to_string();
        let src_name = self.object_name(&src_bucket, &src_key);
        let dst_name = self.object_name(dst_bucket, dst_key);
        Box::pin(async move {
            // Server-side rewrite; the ETag comes from the source's MD5
            // metadata so no bytes move through this process.
            let meta = self
                .object_meta(&src_name)
                .await?
                .ok_or(StoreError::NoSuchKey {
                    bucket: src_bucket,
                    key: src_key,
                })?;
            let etag = meta
                .md5_hash
                .as_deref()
                .and_then(|b64| BASE64_STANDARD.decode(b64).ok())
                .map(|digest| format!("\"{}\"", hex::encode(digest)))
                .unwrap_or_default();

            let token = self.tokens.bearer().await?;
            let url = format!(
                "{GCS_API_BASE}/b/{}/o/{}/rewriteTo/b/{}/o/{}",
                self.bucket,
                urlencode(&src_name),
                self.bucket,
                urlencode(&dst_name)
            );
            // rewrite can return a continuation token for very large
            // objects; keep calling until done.
            let mut rewrite_token: Option<String> = None;
            loop {
                let mut request_url = url.clone();
                if let Some(rt) = &rewrite_token {
                    request_url.push_str(&format!("?rewriteToken={}", urlencode(rt)));
                }
                let response = self
                    .client
                    .post(&request_url)
                    .bearer_auth(&token)
                    .header("content-length", "0")
                    .send()
                    .await
                    .map_err(|e| StoreError::upstream(PROVIDER, e))?;
                if !response.status().is_success() {
                    return Err(upstream_status(response.status(), "rewrite"));
                }
                let body = response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| StoreError::upstream(PROVIDER, e))?;
                if body.get("done").and_then(|d| d.as_bool()).unwrap_or(true) {
                    break;
                }
                rewrite_token = body
                    .get("rewriteToken")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string());
            }
            Ok(etag)
        })
    }

    fn put_part(
        &self,
        _bucket: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BoxFut<'_, String> {
        let name = self.part_name(upload_id, part_number);
        Box::pin(async move { self.upload(&name, data).await })
    }

    fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartSource],
    ) -> BoxFut<'_, AssembledObject> {
        let dest = self.object_name(bucket, key);
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            // Composite ETag and size come from part metadata; compose
            // moves the bytes server-side.
            let mut part_digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
            let mut total_size: u64 = 0;
            let mut source_names: Vec<String> = Vec::with_capacity(parts.len());
            for part in &parts {
                let name = self.part_name(&upload_id, part.part_number);
                let meta =
                    self.object_meta(&name)
                        .await?
                        .ok_or_else(|| StoreError::InvalidPart {
                            message: format!(
                                "Part {} of upload {} is not available",
                                part.part_number, upload_id
                            ),
                        })?;
                let digest = meta
                    .md5_hash
                    .as_deref()
                    .and_then(|b64| BASE64_STANDARD.decode(b64).ok())
                    .and_then(|d| <[u8; 16]>::try_from(d.as_slice()).ok())
                    .ok_or_else(|| {
                        StoreError::upstream(
                            PROVIDER,
                            anyhow::anyhow!("part object missing md5Hash metadata"),
                        )
                    })?;
                part_digests.push(digest);
                total_size += meta
                    .size
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                source_names.push(name);
            }

            // Chain compose calls: each level folds up to 32 sources
            // into an intermediate until one call reaches the target.
            let mut level = 0usize;
            let mut intermediates: Vec<String> = Vec::new();
            let mut current = source_names;
            while current.len() > MAX_COMPOSE_SOURCES {
                let mut next: Vec<String> = Vec::new();
                for (i, chunk) in current.chunks(MAX_COMPOSE_SOURCES).enumerate() {
                    let name = format!(
                        "{}.compose-{level}-{i}",
                        self.parts_prefix(&upload_id)
                    );
                    self.compose(chunk, &name).await?;
                    intermediates.push(name.clone());
                    next.push(name);
                }
                current = next;
                level += 1;
            }
            debug!(dest = %dest, parts = parts.len(), levels = level, "composing multipart object");
            self.compose(&current, &dest).await?;

            for name in intermediates {
                self.delete_name(&name).await?;
            }

            Ok(AssembledObject {
                etag: composite_etag(&part_digests),
                total_size,
            })
        })
    }

    fn delete_parts(&self, _bucket: &str, upload_id: &str) -> BoxFut<'_, ()> {
        let prefix = self.parts_prefix(upload_id);
        Box::pin(async move {
            for name in self.list_names(&prefix).await? {
                self.delete_name(&name).await?;
            }
            Ok(())
        })
    }

    fn create_bucket(&self, _bucket: &str) -> BoxFut<'_, ()> {
        // Logical: buckets are key prefixes in the upstream bucket.
        Box::pin(async move { Ok(()) })
    }

    fn delete_bucket(&self, bucket: &str) -> BoxFut<'_, ()> {
        let prefix = format!("{}{}/", self.prefix, bucket);
        Box::pin(async move {
            for name in self.list_names(&prefix).await? {
                self.delete_name(&name).await?;
            }
            Ok(())
        })
    }

    fn sweep_expired_parts(&self, live_upload_ids: &[String]) -> BoxFut<'_, ()> {
        let live = live_upload_ids.to_vec();
        let parts_root = format!("{}.parts/", self.prefix);
        Box::pin(async move {
            let names = self.list_names(&parts_root).await?;
            for name in names {
                let upload_id = name
                    .strip_prefix(&parts_root)
                    .and_then(|rest| rest.split('/').next())
                    .unwrap_or_default();
                if !upload_id.is_empty() && !live.contains(&upload_id.to_string()) {
                    self.delete_name(&name).await?;
                }
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let token = self.tokens.bearer().await?;
            let url = format!("{GCS_API_BASE}/b/{}", self.bucket);
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| StoreError::upstream(PROVIDER, e))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(upstream_status(response.status(), "health"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        let backend = GcpGatewayBackend {
            tokens: GcpTokenProvider::new(reqwest::Client::new()),
            client: reqwest::Client::new(),
            bucket: "upstream".to_string(),
            prefix: "bleep/".to_string(),
        };
        assert_eq!(backend.object_name("photos", "2024/a.jpg"), "bleep/photos/2024/a.jpg");
        assert_eq!(backend.part_name("u-1", 3), "bleep/.parts/u-1/3");
        assert_eq!(backend.parts_prefix("u-1"), "bleep/.parts/u-1/");
    }

    #[test]
    fn test_urlencode_object_names() {
        assert_eq!(urlencode("a/b c.txt"), "a%2Fb%20c.txt");
        assert_eq!(urlencode("plain-name_1.txt"), "plain-name_1.txt");
    }

    #[test]
    fn test_range_header_forms() {
        let header = |s, e| range_header(&ByteRange { start: s, end: e });
        assert_eq!(header(Some(0), Some(99)).as_deref(), Some("bytes=0-99"));
        assert_eq!(header(Some(100), None).as_deref(), Some("bytes=100-"));
        assert_eq!(header(None, Some(5)).as_deref(), Some("bytes=-5"));
        assert_eq!(header(None, None), None);
    }
}
