//! Azure Cosmos DB (SQL API) metadata store backend.
//!
//! All entities live in one container as JSON documents, discriminated
//! by a `kind` field:
//!
//! ```text
//! Bucket:     id=bucket:{name}                pk={name}
//! Object:     id=object:{b64url(bucket/key)}  pk={bucket}
//! Upload:     id=upload:{upload_id}           pk={upload_id}
//! Part:       id=part:{upload_id}:{n:05}      pk={upload_id}
//! Credential: id=cred:{access_key_id}         pk={access_key_id}
//! ```
//!
//! Object keys can contain characters Cosmos forbids in document ids,
//! so the id embeds a URL-safe base64 of `bucket/key`.  Uploads and
//! their parts share a partition, which makes every multipart mutation
//! single-partition.  Bucket-wide listings are cross-partition queries
//! sorted in process through the shared listing algorithm.
//!
//! Requests authenticate with the account master key: HMAC-SHA256 over
//! `{verb}\n{resource_type}\n{resource_link}\n{date}\n\n` per the
//! Cosmos REST contract.

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::info;

use super::list;
use super::store::{
    BatchDeleteOutcome, BucketRecord, CredentialRecord, ExpiredUpload, ListObjectsQuery,
    ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::config::CosmosMetaConfig;
use crate::errors::{StoreError, StoreResult};
use crate::types::{new_upload_id, BoxFut};

const PROVIDER: &str = "cosmos";
const API_VERSION: &str = "2018-12-31";

fn id_bucket(name: &str) -> String {
    format!("bucket:{name}")
}

fn id_object(bucket: &str, key: &str) -> String {
    format!(
        "object:{}",
        URL_SAFE_NO_PAD.encode(format!("{bucket}/{key}"))
    )
}

fn id_upload(upload_id: &str) -> String {
    format!("upload:{upload_id}")
}

fn id_part(upload_id: &str, part_number: u32) -> String {
    format!("part:{upload_id}:{part_number:05}")
}

fn id_credential(access_key_id: &str) -> String {
    format!("cred:{access_key_id}")
}

/// Wrap a record as a Cosmos document with id/pk/kind envelope fields.
fn to_doc<T: Serialize>(id: &str, pk: &str, kind: &str, record: &T) -> StoreResult<Value> {
    let mut doc = serde_json::to_value(record)?;
    let map = doc
        .as_object_mut()
        .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("record did not serialize to an object")))?;
    map.insert("id".to_string(), Value::String(id.to_string()));
    map.insert("pk".to_string(), Value::String(pk.to_string()));
    map.insert("kind".to_string(), Value::String(kind.to_string()));
    Ok(doc)
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> StoreResult<T> {
    Ok(serde_json::from_value(doc)?)
}

/// Metadata store backed by a single Cosmos DB container.
pub struct CosmosMetadataStore {
    client: reqwest::Client,
    endpoint: String,
    master_key: Vec<u8>,
    database: String,
    container: String,
}

impl CosmosMetadataStore {
    /// Build a client against `https://{account}.documents.azure.com`.
    /// The database and container must already exist with partition key
    /// path `/pk`.
    pub fn connect(config: &CosmosMetaConfig) -> StoreResult<Self> {
        let master_key = BASE64_STANDARD
            .decode(&config.master_key)
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        let endpoint = if config.endpoint.is_empty() {
            format!("https://{}.documents.azure.com", config.account)
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        info!(account = %config.account, database = %config.database,
              container = %config.container, "Cosmos metadata store ready");
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            master_key,
            database: config.database.clone(),
            container: config.container.clone(),
        })
    }

    fn collection_link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.container)
    }

    fn doc_link(&self, id: &str) -> String {
        format!("{}/docs/{}", self.collection_link(), id)
    }

    /// Master-key request signature per the Cosmos REST auth contract.
    fn auth_token(&self, verb: &str, resource_type: &str, resource_link: &str, date: &str) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n\n",
            verb.to_lowercase(),
            resource_type,
            resource_link,
            date.to_lowercase()
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.master_key)
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        // The token itself must be URL-encoded.
        format!(
            "type%3Dmaster%26ver%3D1.0%26sig%3D{}",
            urlencode(&signature)
        )
    }

    fn request(
        &self,
        method: reqwest::Method,
        resource_type: &str,
        resource_link: &str,
        partition_key: &str,
    ) -> reqwest::RequestBuilder {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let token = self.auth_token(method.as_str(), resource_type, resource_link, &date);
        self.client
            .request(
                method,
                format!("{}/{}", self.endpoint, resource_link),
            )
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header(
                "x-ms-documentdb-partitionkey",
                format!("[{}]", serde_json::to_string(partition_key).unwrap_or_default()),
            )
    }

    /// Create-or-replace a document.
    async fn upsert_doc(&self, pk: &str, doc: &Value) -> StoreResult<()> {
        let response = self
            .request(reqwest::Method::POST, "docs", &self.collection_link(), pk)
            .header("x-ms-documentdb-is-upsert", "true")
            .json(doc)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(upstream_status(status, "upsert"))
        }
    }

    /// Create a document, failing when the id already exists.
    async fn create_doc(&self, pk: &str, doc: &Value) -> StoreResult<bool> {
        let response = self
            .request(reqwest::Method::POST, "docs", &self.collection_link(), pk)
            .json(doc)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => Err(upstream_status(status, "create")),
        }
    }

    async fn get_doc(&self, pk: &str, id: &str) -> StoreResult<Option<Value>> {
        let link = self.doc_link(id);
        let response = self
            .request(reqwest::Method::GET, "docs", &link, pk)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => {
                let doc = response
                    .json::<Value>()
                    .await
                    .map_err(|e| StoreError::upstream(PROVIDER, e))?;
                Ok(Some(doc))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(upstream_status(status, "get")),
        }
    }

    /// Idempotent delete: 404 is success.
    async fn delete_doc(&self, pk: &str, id: &str) -> StoreResult<()> {
        let link = self.doc_link(id);
        let response = self
            .request(reqwest::Method::DELETE, "docs", &link, pk)
            .send()
            .await
            .map_err(|e| StoreError::upstream(PROVIDER, e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(upstream_status(status, "delete")),
        }
    }

    /// Run a SQL query, following continuation tokens. When
    /// `partition_key` is `None` the query fans out across partitions.
    async fn query(
        &self,
        sql: &str,
        parameters: Vec<Value>,
        partition_key: Option<&str>,
    ) -> StoreResult<Vec<Value>> {
        let mut documents = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .request(
                    reqwest::Method::POST,
                    "docs",
                    &self.collection_link(),
                    partition_key.unwrap_or(""),
                )
                .header("x-ms-documentdb-isquery", "true")
                .header("content-type", "application/query+json");
            if partition_key.is_none() {
                request = request.header("x-ms-documentdb-query-enablecrosspartition", "true");
            }
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token);
            }
            let response = request
                .json(&json!({ "query": sql, "parameters": parameters }))
                .send()
                .await
                .map_err(|e| StoreError::upstream(PROVIDER, e))?;
            if !response.status().is_success() {
                return Err(upstream_status(response.status(), "query"));
            }
            continuation = response
                .headers()
                .get("x-ms-continuation")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = response
                .json::<Value>()
                .await
                .map_err(|e| StoreError::upstream(PROVIDER, e))?;
            if let Some(docs) = body.get("Documents").and_then(|d| d.as_array()) {
                documents.extend(docs.iter().cloned());
            }
            if continuation.is_none() {
                break;
            }
        }
        Ok(documents)
    }

    async fn query_records<T: DeserializeOwned>(
        &self,
        sql: &str,
        parameters: Vec<Value>,
        partition_key: Option<&str>,
    ) -> StoreResult<Vec<T>> {
        let docs = self.query(sql, parameters, partition_key).await?;
        docs.into_iter().map(from_doc).collect()
    }

    async fn get_upload_any(&self, upload_id: &str) -> StoreResult<Option<MultipartUploadRecord>> {
        match self.get_doc(upload_id, &id_upload(upload_id)).await? {
            Some(doc) => Ok(Some(from_doc(doc)?)),
            None => Ok(None),
        }
    }

    /// Remove every part document and the upload document, parts first.
    async fn purge_upload(&self, upload_id: &str) -> StoreResult<()> {
        let parts: Vec<PartRecord> = self
            .query_records(
                "SELECT * FROM c WHERE c.kind = 'part' AND c.pk = @pk",
                vec![json!({"name": "@pk", "value": upload_id})],
                Some(upload_id),
            )
            .await?;
        for part in parts {
            self.delete_doc(upload_id, &id_part(upload_id, part.part_number))
                .await?;
        }
        self.delete_doc(upload_id, &id_upload(upload_id)).await?;
        Ok(())
    }
}

fn upstream_status(status: StatusCode, operation: &str) -> StoreError {
    StoreError::upstream(
        PROVIDER,
        anyhow::anyhow!("{operation} returned HTTP {status}"),
    )
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

impl MetadataStore for CosmosMetadataStore {
    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let doc = to_doc(&id_bucket(&record.name), &record.name, "bucket", &record)?;
            if self.create_doc(&record.name, &doc).await? {
                Ok(())
            } else {
                Err(StoreError::BucketAlreadyExists {
                    bucket: record.name,
                })
            }
        })
    }

    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move {
            match self.get_doc(&name, &id_bucket(&name)).await? {
                Some(doc) => Ok(Some(from_doc(doc)?)),
                None => Ok(None),
            }
        })
    }

    fn delete_bucket(&self, name: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            if self.get_bucket(&name).await?.is_none() {
                return Err(StoreError::NoSuchBucket { bucket: name });
            }
            if self.count_objects(&name).await? > 0 || self.count_uploads(&name).await? > 0 {
                return Err(StoreError::BucketNotEmpty { bucket: name });
            }
            self.delete_doc(&name, &id_bucket(&name)).await
        })
    }

    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>> {
        let owner = owner.map(|s| s.to_string());
        Box::pin(async move {
            let mut buckets: Vec<BucketRecord> = match owner {
                Some(owner_id) => {
                    self.query_records(
                        "SELECT * FROM c WHERE c.kind = 'bucket' AND c.owner_id = @owner",
                        vec![json!({"name": "@owner", "value": owner_id})],
                        None,
                    )
                    .await?
                }
                None => {
                    self.query_records("SELECT * FROM c WHERE c.kind = 'bucket'", vec![], None)
                        .await?
                }
            };
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn update_bucket_acl(&self, name: &str, acl: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let mut record = self
                .get_bucket(&name)
                .await?
                .ok_or(StoreError::NoSuchBucket {
                    bucket: name.clone(),
                })?;
            record.acl = acl;
            let doc = to_doc(&id_bucket(&name), &name, "bucket", &record)?;
            self.upsert_doc(&name, &doc).await
        })
    }

    fn put_object(&self, record: ObjectRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let record = record.normalized();
            if self.get_bucket(&record.bucket).await?.is_none() {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            let doc = to_doc(
                &id_object(&record.bucket, &record.key),
                &record.bucket,
                "object",
                &record,
            )?;
            self.upsert_doc(&record.bucket, &doc).await
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            match self.get_doc(&bucket, &id_object(&bucket, &key)).await? {
                Some(doc) => Ok(Some(from_doc(doc)?)),
                None => Ok(None),
            }
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move { self.delete_doc(&bucket, &id_object(&bucket, &key)).await })
    }

    fn delete_objects_meta(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> BoxFut<'_, BatchDeleteOutcome> {
        let bucket = bucket.to_string();
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut outcome = BatchDeleteOutcome::default();
            for key in keys {
                match self.delete_doc(&bucket, &id_object(&bucket, &key)).await {
                    Ok(()) => outcome.deleted.push(key),
                    Err(err) => outcome.errors.push(super::store::BatchDeleteError {
                        key,
                        code: err.code().to_string(),
                        message: err.to_string(),
                    }),
                }
            }
            Ok(outcome)
        })
    }

    fn update_object_acl(&self, bucket: &str, key: &str, acl: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let mut record =
                self.get_object(&bucket, &key)
                    .await?
                    .ok_or(StoreError::NoSuchKey {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    })?;
            record.acl = acl;
            let doc = to_doc(&id_object(&bucket, &key), &bucket, "object", &record)?;
            self.upsert_doc(&bucket, &doc).await
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        query: ListObjectsQuery,
    ) -> BoxFut<'_, ListObjectsResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            // Single-partition query; range/prefix filtering happens
            // server-side, the merge and cut in the shared algorithm.
            let candidates: Vec<ObjectRecord> = self
                .query_records(
                    "SELECT * FROM c WHERE c.kind = 'object' AND c.pk = @bucket \
                     AND c.key > @start AND STARTSWITH(c.key, @prefix)",
                    vec![
                        json!({"name": "@bucket", "value": bucket}),
                        json!({"name": "@start", "value": query.start_key()}),
                        json!({"name": "@prefix", "value": query.prefix}),
                    ],
                    Some(&bucket),
                )
                .await?;
            Ok(list::paginate_objects(candidates, &query))
        })
    }

    fn count_objects(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let docs = self
                .query(
                    "SELECT VALUE COUNT(1) FROM c WHERE c.kind = 'object' AND c.pk = @bucket",
                    vec![json!({"name": "@bucket", "value": bucket})],
                    Some(&bucket),
                )
                .await?;
            Ok(docs.first().and_then(|v| v.as_u64()).unwrap_or(0))
        })
    }

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> BoxFut<'_, String> {
        Box::pin(async move {
            let mut record = record;
            if record.upload_id.is_empty() {
                record.upload_id = new_upload_id();
            }
            if self.get_bucket(&record.bucket).await?.is_none() {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            let upload_id = record.upload_id.clone();
            let doc = to_doc(&id_upload(&upload_id), &upload_id, "upload", &record)?;
            self.upsert_doc(&upload_id, &doc).await?;
            Ok(upload_id)
        })
    }

    fn get_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, Option<MultipartUploadRecord>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            Ok(self
                .get_upload_any(&upload_id)
                .await?
                .filter(|u| u.bucket == bucket && u.key == key))
        })
    }

    fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            if self.get_upload_any(&upload_id).await?.is_none() {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            let mut doc = to_doc(
                &id_part(&upload_id, part.part_number),
                &upload_id,
                "part",
                &part,
            )?;
            // Parts carry their upload id so dumps can reconstruct the
            // (upload_id, part) pairing.
            doc.as_object_mut()
                .expect("document is an object")
                .insert("upload_id".to_string(), Value::String(upload_id.clone()));
            self.upsert_doc(&upload_id, &doc).await
        })
    }

    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let candidates: Vec<PartRecord> = self
                .query_records(
                    "SELECT * FROM c WHERE c.kind = 'part' AND c.pk = @pk",
                    vec![json!({"name": "@pk", "value": upload_id})],
                    Some(&upload_id),
                )
                .await?;
            Ok(list::paginate_parts(candidates, &query))
        })
    }

    fn get_parts_for_completion(
        &self,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> BoxFut<'_, Vec<PartRecord>> {
        let upload_id = upload_id.to_string();
        let part_numbers = part_numbers.to_vec();
        Box::pin(async move {
            let mut parts: Vec<PartRecord> = self
                .query_records(
                    "SELECT * FROM c WHERE c.kind = 'part' AND c.pk = @pk",
                    vec![json!({"name": "@pk", "value": upload_id})],
                    Some(&upload_id),
                )
                .await?;
            if !part_numbers.is_empty() {
                parts.retain(|p| part_numbers.contains(&p.part_number));
            }
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        final_object: ObjectRecord,
    ) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let matches = self
                .get_upload_any(&upload_id)
                .await?
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            let final_object = final_object.normalized();
            let doc = to_doc(
                &id_object(&final_object.bucket, &final_object.key),
                &final_object.bucket,
                "object",
                &final_object,
            )?;
            self.upsert_doc(&final_object.bucket, &doc).await?;
            self.purge_upload(&upload_id).await
        })
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let matches = self
                .get_upload_any(&upload_id)
                .await?
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            self.purge_upload(&upload_id).await
        })
    }

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        query: ListUploadsQuery,
    ) -> BoxFut<'_, ListUploadsResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let uploads: Vec<MultipartUploadRecord> = self
                .query_records(
                    "SELECT * FROM c WHERE c.kind = 'upload' AND c.bucket = @bucket",
                    vec![json!({"name": "@bucket", "value": bucket})],
                    None,
                )
                .await?;
            let candidates: Vec<MultipartUploadRecord> = uploads
                .into_iter()
                .filter(|u| {
                    u.key.starts_with(&query.prefix)
                        && list::upload_after_marker(
                            &u.key,
                            &u.upload_id,
                            &query.key_marker,
                            &query.upload_id_marker,
                        )
                })
                .collect();
            Ok(list::paginate_uploads(candidates, &query))
        })
    }

    fn count_uploads(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let docs = self
                .query(
                    "SELECT VALUE COUNT(1) FROM c WHERE c.kind = 'upload' AND c.bucket = @bucket",
                    vec![json!({"name": "@bucket", "value": bucket})],
                    None,
                )
                .await?;
            Ok(docs.first().and_then(|v| v.as_u64()).unwrap_or(0))
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>> {
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(ttl_seconds))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let uploads: Vec<MultipartUploadRecord> = self
                .query_records(
                    "SELECT * FROM c WHERE c.kind = 'upload' AND c.initiated_at < @cutoff",
                    vec![json!({"name": "@cutoff", "value": cutoff})],
                    None,
                )
                .await?;
            let expired: Vec<ExpiredUpload> = uploads
                .into_iter()
                .map(|u| ExpiredUpload {
                    upload_id: u.upload_id,
                    bucket: u.bucket,
                    key: u.key,
                })
                .collect();
            for upload in &expired {
                self.purge_upload(&upload.upload_id).await?;
            }
            Ok(expired)
        })
    }

    fn get_credential(&self, access_key_id: &str) -> BoxFut<'_, Option<CredentialRecord>> {
        let access_key_id = access_key_id.to_string();
        Box::pin(async move {
            match self
                .get_doc(&access_key_id, &id_credential(&access_key_id))
                .await?
            {
                Some(doc) => {
                    let record: CredentialRecord = from_doc(doc)?;
                    Ok(Some(record).filter(|c| c.active))
                }
                None => Ok(None),
            }
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let doc = to_doc(
                &id_credential(&record.access_key_id),
                &record.access_key_id,
                "credential",
                &record,
            )?;
            self.upsert_doc(&record.access_key_id, &doc).await
        })
    }

    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let mut buckets: Vec<BucketRecord> = self
                .query_records("SELECT * FROM c WHERE c.kind = 'bucket'", vec![], None)
                .await?;
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>> {
        Box::pin(async move {
            let mut objects: Vec<ObjectRecord> = self
                .query_records("SELECT * FROM c WHERE c.kind = 'object'", vec![], None)
                .await?;
            objects.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
            Ok(objects)
        })
    }

    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>> {
        Box::pin(async move {
            let mut uploads: Vec<MultipartUploadRecord> = self
                .query_records("SELECT * FROM c WHERE c.kind = 'upload'", vec![], None)
                .await?;
            uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            Ok(uploads)
        })
    }

    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>> {
        Box::pin(async move {
            let docs = self
                .query("SELECT * FROM c WHERE c.kind = 'part'", vec![], None)
                .await?;
            let mut parts = Vec::with_capacity(docs.len());
            for doc in docs {
                let upload_id = doc
                    .get("upload_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let part: PartRecord = from_doc(doc)?;
                parts.push((upload_id, part));
            }
            parts.sort_by(|a, b| (&a.0, a.1.part_number).cmp(&(&b.0, b.1.part_number)));
            Ok(parts)
        })
    }

    fn dump_credentials(&self) -> BoxFut<'_, Vec<CredentialRecord>> {
        Box::pin(async move {
            let mut credentials: Vec<CredentialRecord> = self
                .query_records("SELECT * FROM c WHERE c.kind = 'credential'", vec![], None)
                .await?;
            credentials.sort_by(|a, b| a.access_key_id.cmp(&b.access_key_id));
            Ok(credentials)
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let link = self.collection_link();
            let response = self
                .request(reqwest::Method::GET, "colls", &link, "")
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
