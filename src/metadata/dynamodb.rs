//! AWS DynamoDB metadata store backend.
//!
//! Single-table design with a PK/SK pattern:
//!
//! ```text
//! Bucket:     PK=BUCKET#{name}          SK=#METADATA
//! Object:     PK=OBJECT#{bucket}#{key}  SK=#METADATA
//! Upload:     PK=UPLOAD#{upload_id}     SK=#METADATA
//! Part:       PK=UPLOAD#{upload_id}     SK=PART#{part_number:05}
//! Credential: PK=CRED#{access_key}      SK=#METADATA
//! ```
//!
//! Point reads are GetItem; bucket-wide listings are Scan with a
//! filter, sorted in process and fed through the shared listing
//! algorithm.  Conditional writes provide the create-if-absent
//! semantics; multi-item mutations are sequenced final-object-first and
//! rely on DynamoDB's per-item linearizability rather than a
//! transaction.

use std::collections::HashMap;

use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tracing::info;

use super::list;
use super::store::{
    BatchDeleteOutcome, BucketRecord, CredentialRecord, ExpiredUpload, ListObjectsQuery,
    ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::config::DynamoDbMetaConfig;
use crate::errors::{StoreError, StoreResult};
use crate::types::{new_upload_id, BoxFut};

const PROVIDER: &str = "dynamodb";
const SK_METADATA: &str = "#METADATA";

fn pk_bucket(bucket: &str) -> String {
    format!("BUCKET#{bucket}")
}

fn pk_object(bucket: &str, key: &str) -> String {
    format!("OBJECT#{bucket}#{key}")
}

fn pk_upload(upload_id: &str) -> String {
    format!("UPLOAD#{upload_id}")
}

fn pk_credential(access_key: &str) -> String {
    format!("CRED#{access_key}")
}

fn sk_part(part_number: u32) -> String {
    format!("PART#{part_number:05}")
}

fn wrap<E>(err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::upstream(PROVIDER, err)
}

// ── Item marshalling ───────────────────────────────────────────────

fn s(item: &mut HashMap<String, AttributeValue>, name: &str, value: &str) {
    item.insert(name.to_string(), AttributeValue::S(value.to_string()));
}

fn opt_s(item: &mut HashMap<String, AttributeValue>, name: &str, value: &Option<String>) {
    if let Some(v) = value {
        item.insert(name.to_string(), AttributeValue::S(v.clone()));
    }
}

fn n(item: &mut HashMap<String, AttributeValue>, name: &str, value: u64) {
    item.insert(name.to_string(), AttributeValue::N(value.to_string()));
}

fn b(item: &mut HashMap<String, AttributeValue>, name: &str, value: bool) {
    item.insert(name.to_string(), AttributeValue::Bool(value));
}

fn get_s(item: &HashMap<String, AttributeValue>, name: &str) -> String {
    match item.get(name) {
        Some(AttributeValue::S(v)) => v.clone(),
        _ => String::new(),
    }
}

fn get_opt_s(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    match item.get(name) {
        Some(AttributeValue::S(v)) => Some(v.clone()),
        _ => None,
    }
}

fn get_n(item: &HashMap<String, AttributeValue>, name: &str) -> u64 {
    match item.get(name) {
        Some(AttributeValue::N(v)) => v.parse().unwrap_or(0),
        _ => 0,
    }
}

fn get_bool(item: &HashMap<String, AttributeValue>, name: &str) -> bool {
    matches!(item.get(name), Some(AttributeValue::Bool(true)))
}

fn bucket_to_item(record: &BucketRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    s(&mut item, "pk", &pk_bucket(&record.name));
    s(&mut item, "sk", SK_METADATA);
    s(&mut item, "entity", "bucket");
    s(&mut item, "name", &record.name);
    s(&mut item, "region", &record.region);
    s(&mut item, "owner_id", &record.owner_id);
    s(&mut item, "owner_display", &record.owner_display);
    s(&mut item, "acl", &record.acl);
    s(&mut item, "created_at", &record.created_at);
    item
}

fn item_to_bucket(item: &HashMap<String, AttributeValue>) -> BucketRecord {
    BucketRecord {
        name: get_s(item, "name"),
        region: get_s(item, "region"),
        owner_id: get_s(item, "owner_id"),
        owner_display: get_s(item, "owner_display"),
        acl: get_s(item, "acl"),
        created_at: get_s(item, "created_at"),
    }
}

fn object_to_item(record: &ObjectRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    s(&mut item, "pk", &pk_object(&record.bucket, &record.key));
    s(&mut item, "sk", SK_METADATA);
    s(&mut item, "entity", "object");
    s(&mut item, "bucket", &record.bucket);
    s(&mut item, "key", &record.key);
    n(&mut item, "size", record.size);
    s(&mut item, "etag", &record.etag);
    s(&mut item, "content_type", &record.content_type);
    opt_s(&mut item, "content_encoding", &record.content_encoding);
    opt_s(&mut item, "content_language", &record.content_language);
    opt_s(&mut item, "content_disposition", &record.content_disposition);
    opt_s(&mut item, "cache_control", &record.cache_control);
    opt_s(&mut item, "expires", &record.expires);
    s(&mut item, "storage_class", &record.storage_class);
    s(&mut item, "acl", &record.acl);
    s(
        &mut item,
        "user_metadata",
        &serde_json::to_string(&record.user_metadata).unwrap_or_else(|_| "{}".to_string()),
    );
    s(&mut item, "last_modified", &record.last_modified);
    b(&mut item, "delete_marker", record.delete_marker);
    item
}

fn item_to_object(item: &HashMap<String, AttributeValue>) -> ObjectRecord {
    ObjectRecord {
        bucket: get_s(item, "bucket"),
        key: get_s(item, "key"),
        size: get_n(item, "size"),
        etag: get_s(item, "etag"),
        content_type: get_s(item, "content_type"),
        content_encoding: get_opt_s(item, "content_encoding"),
        content_language: get_opt_s(item, "content_language"),
        content_disposition: get_opt_s(item, "content_disposition"),
        cache_control: get_opt_s(item, "cache_control"),
        expires: get_opt_s(item, "expires"),
        storage_class: get_s(item, "storage_class"),
        acl: get_s(item, "acl"),
        user_metadata: serde_json::from_str(&get_s(item, "user_metadata")).unwrap_or_default(),
        last_modified: get_s(item, "last_modified"),
        delete_marker: get_bool(item, "delete_marker"),
    }
}

fn upload_to_item(record: &MultipartUploadRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    s(&mut item, "pk", &pk_upload(&record.upload_id));
    s(&mut item, "sk", SK_METADATA);
    s(&mut item, "entity", "upload");
    s(&mut item, "upload_id", &record.upload_id);
    s(&mut item, "bucket", &record.bucket);
    s(&mut item, "key", &record.key);
    s(&mut item, "content_type", &record.content_type);
    opt_s(&mut item, "content_encoding", &record.content_encoding);
    opt_s(&mut item, "content_language", &record.content_language);
    opt_s(&mut item, "content_disposition", &record.content_disposition);
    opt_s(&mut item, "cache_control", &record.cache_control);
    opt_s(&mut item, "expires", &record.expires);
    s(&mut item, "storage_class", &record.storage_class);
    s(&mut item, "acl", &record.acl);
    s(
        &mut item,
        "user_metadata",
        &serde_json::to_string(&record.user_metadata).unwrap_or_else(|_| "{}".to_string()),
    );
    s(&mut item, "owner_id", &record.owner_id);
    s(&mut item, "owner_display", &record.owner_display);
    s(&mut item, "initiated_at", &record.initiated_at);
    item
}

fn item_to_upload(item: &HashMap<String, AttributeValue>) -> MultipartUploadRecord {
    MultipartUploadRecord {
        upload_id: get_s(item, "upload_id"),
        bucket: get_s(item, "bucket"),
        key: get_s(item, "key"),
        content_type: get_s(item, "content_type"),
        content_encoding: get_opt_s(item, "content_encoding"),
        content_language: get_opt_s(item, "content_language"),
        content_disposition: get_opt_s(item, "content_disposition"),
        cache_control: get_opt_s(item, "cache_control"),
        expires: get_opt_s(item, "expires"),
        storage_class: get_s(item, "storage_class"),
        acl: get_s(item, "acl"),
        user_metadata: serde_json::from_str(&get_s(item, "user_metadata")).unwrap_or_default(),
        owner_id: get_s(item, "owner_id"),
        owner_display: get_s(item, "owner_display"),
        initiated_at: get_s(item, "initiated_at"),
    }
}

fn part_to_item(upload_id: &str, record: &PartRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    s(&mut item, "pk", &pk_upload(upload_id));
    s(&mut item, "sk", &sk_part(record.part_number));
    s(&mut item, "entity", "part");
    s(&mut item, "upload_id", upload_id);
    n(&mut item, "part_number", record.part_number as u64);
    n(&mut item, "size", record.size);
    s(&mut item, "etag", &record.etag);
    s(&mut item, "last_modified", &record.last_modified);
    item
}

fn item_to_part(item: &HashMap<String, AttributeValue>) -> PartRecord {
    PartRecord {
        part_number: get_n(item, "part_number") as u32,
        size: get_n(item, "size"),
        etag: get_s(item, "etag"),
        last_modified: get_s(item, "last_modified"),
    }
}

fn credential_to_item(record: &CredentialRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    s(&mut item, "pk", &pk_credential(&record.access_key_id));
    s(&mut item, "sk", SK_METADATA);
    s(&mut item, "entity", "credential");
    s(&mut item, "access_key_id", &record.access_key_id);
    s(&mut item, "secret_key", &record.secret_key);
    s(&mut item, "owner_id", &record.owner_id);
    s(&mut item, "display_name", &record.display_name);
    b(&mut item, "active", record.active);
    s(&mut item, "created_at", &record.created_at);
    item
}

fn item_to_credential(item: &HashMap<String, AttributeValue>) -> CredentialRecord {
    CredentialRecord {
        access_key_id: get_s(item, "access_key_id"),
        secret_key: get_s(item, "secret_key"),
        owner_id: get_s(item, "owner_id"),
        display_name: get_s(item, "display_name"),
        active: get_bool(item, "active"),
        created_at: get_s(item, "created_at"),
    }
}

// ── Store ──────────────────────────────────────────────────────────

/// Metadata store backed by one DynamoDB table.
pub struct DynamoDbMetadataStore {
    client: Client,
    table_name: String,
}

impl DynamoDbMetadataStore {
    /// Build a client from the standard AWS credential chain. The
    /// table must already exist with string keys `pk` and `sk`.
    pub async fn connect(config: &DynamoDbMetaConfig) -> StoreResult<Self> {
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !config.region.is_empty() {
            builder = builder.region(aws_config::Region::new(config.region.clone()));
        }
        if !config.endpoint_url.is_empty() {
            builder = builder.endpoint_url(&config.endpoint_url);
        }
        let cfg = builder.load().await;
        let client = Client::new(&cfg);
        info!(table = %config.table, region = %config.region, "DynamoDB metadata store ready");
        Ok(Self {
            client,
            table_name: config.table.clone(),
        })
    }

    /// Full-table scan with a filter on the `entity` attribute,
    /// following pagination until exhausted.
    async fn scan_entity(&self, entity: &str) -> StoreResult<Vec<HashMap<String, AttributeValue>>> {
        let mut items = Vec::new();
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut scan = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("entity = :entity")
                .expression_attribute_values(":entity", AttributeValue::S(entity.to_string()));
            if let Some(key) = &exclusive_start_key {
                scan = scan.set_exclusive_start_key(Some(key.clone()));
            }
            let result = scan.send().await.map_err(wrap)?;
            items.extend(result.items().iter().cloned());
            match result.last_evaluated_key() {
                Some(key) => exclusive_start_key = Some(key.clone()),
                None => break,
            }
        }
        Ok(items)
    }

    async fn query_parts(&self, upload_id: &str) -> StoreResult<Vec<PartRecord>> {
        let mut parts = Vec::new();
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut query = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("pk = :pk AND begins_with(sk, :part)")
                .expression_attribute_values(":pk", AttributeValue::S(pk_upload(upload_id)))
                .expression_attribute_values(":part", AttributeValue::S("PART#".to_string()));
            if let Some(key) = &exclusive_start_key {
                query = query.set_exclusive_start_key(Some(key.clone()));
            }
            let result = query.send().await.map_err(wrap)?;
            parts.extend(result.items().iter().map(item_to_part));
            match result.last_evaluated_key() {
                Some(key) => exclusive_start_key = Some(key.clone()),
                None => break,
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn get_upload_any(&self, upload_id: &str) -> StoreResult<Option<MultipartUploadRecord>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("pk", AttributeValue::S(pk_upload(upload_id)))
            .key("sk", AttributeValue::S(SK_METADATA.to_string()))
            .send()
            .await
            .map_err(wrap)?;
        Ok(result.item().map(item_to_upload))
    }

    /// Delete the upload row and every part row under it, parts first.
    async fn purge_upload(&self, upload_id: &str) -> StoreResult<()> {
        let parts = self.query_parts(upload_id).await?;
        for part in parts {
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_upload(upload_id)))
                .key("sk", AttributeValue::S(sk_part(part.part_number)))
                .send()
                .await
                .map_err(wrap)?;
        }
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("pk", AttributeValue::S(pk_upload(upload_id)))
            .key("sk", AttributeValue::S(SK_METADATA.to_string()))
            .send()
            .await
            .map_err(wrap)?;
        Ok(())
    }
}

impl MetadataStore for DynamoDbMetadataStore {
    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let name = record.name.clone();
            let result = self
                .client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(bucket_to_item(&record)))
                .condition_expression("attribute_not_exists(pk)")
                .send()
                .await;
            match result {
                Ok(_) => Ok(()),
                Err(SdkError::ServiceError(err))
                    if matches!(
                        err.err(),
                        PutItemError::ConditionalCheckFailedException(_)
                    ) =>
                {
                    Err(StoreError::BucketAlreadyExists { bucket: name })
                }
                Err(err) => Err(wrap(err)),
            }
        })
    }

    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move {
            let result = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_bucket(&name)))
                .key("sk", AttributeValue::S(SK_METADATA.to_string()))
                .send()
                .await
                .map_err(wrap)?;
            Ok(result.item().map(item_to_bucket))
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
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_bucket(&name)))
                .key("sk", AttributeValue::S(SK_METADATA.to_string()))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }

    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>> {
        let owner = owner.map(|s| s.to_string());
        Box::pin(async move {
            // Scan + in-process sort. O(N) in total bucket count; a GSI
            // on owner_id is the production-scale alternative.
            let items = self.scan_entity("bucket").await?;
            let mut buckets: Vec<BucketRecord> = items
                .iter()
                .map(item_to_bucket)
                .filter(|b| owner.as_deref().map_or(true, |o| b.owner_id == o))
                .collect();
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
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(bucket_to_item(&record)))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
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
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(object_to_item(&record)))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let result = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_object(&bucket, &key)))
                .key("sk", AttributeValue::S(SK_METADATA.to_string()))
                .send()
                .await
                .map_err(wrap)?;
            Ok(result.item().map(item_to_object))
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_object(&bucket, &key)))
                .key("sk", AttributeValue::S(SK_METADATA.to_string()))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
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
                match self.delete_object(&bucket, &key).await {
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
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(object_to_item(&record)))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        query: ListObjectsQuery,
    ) -> BoxFut<'_, ListObjectsResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            // Scan pages arrive unsorted; collect everything for this
            // bucket, then let the shared algorithm filter, sort, and
            // cut.
            let items = self.scan_entity("object").await?;
            let candidates: Vec<ObjectRecord> = items
                .iter()
                .map(item_to_object)
                .filter(|o| {
                    o.bucket == bucket
                        && list::key_matches(&o.key, &query.prefix, query.start_key())
                })
                .collect();
            Ok(list::paginate_objects(candidates, &query))
        })
    }

    fn count_objects(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let items = self.scan_entity("object").await?;
            Ok(items
                .iter()
                .filter(|i| get_s(i, "bucket") == bucket)
                .count() as u64)
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
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(upload_to_item(&record)))
                .send()
                .await
                .map_err(wrap)?;
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
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(part_to_item(&upload_id, &part)))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }

    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let candidates = self.query_parts(&upload_id).await?;
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
            let mut parts = self.query_parts(&upload_id).await?;
            if !part_numbers.is_empty() {
                parts.retain(|p| part_numbers.contains(&p.part_number));
            }
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
            // Final object first, then part/upload rows. A crash in
            // between leaves the object visible and an upload row for
            // the reaper -- the safe direction.
            let final_object = final_object.normalized();
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(object_to_item(&final_object)))
                .send()
                .await
                .map_err(wrap)?;
            self.purge_upload(&upload_id).await?;
            Ok(())
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
            let items = self.scan_entity("upload").await?;
            let candidates: Vec<MultipartUploadRecord> = items
                .iter()
                .map(item_to_upload)
                .filter(|u| {
                    u.bucket == bucket
                        && u.key.starts_with(&query.prefix)
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
            let items = self.scan_entity("upload").await?;
            Ok(items
                .iter()
                .filter(|i| get_s(i, "bucket") == bucket)
                .count() as u64)
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>> {
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(ttl_seconds))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let items = self.scan_entity("upload").await?;
            let expired: Vec<ExpiredUpload> = items
                .iter()
                .map(item_to_upload)
                .filter(|u| u.initiated_at < cutoff)
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
            let result = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key("pk", AttributeValue::S(pk_credential(&access_key_id)))
                .key("sk", AttributeValue::S(SK_METADATA.to_string()))
                .send()
                .await
                .map_err(wrap)?;
            Ok(result
                .item()
                .map(item_to_credential)
                .filter(|c| c.active))
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(credential_to_item(&record)))
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }

    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let items = self.scan_entity("bucket").await?;
            let mut buckets: Vec<BucketRecord> = items.iter().map(item_to_bucket).collect();
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>> {
        Box::pin(async move {
            let items = self.scan_entity("object").await?;
            let mut objects: Vec<ObjectRecord> = items.iter().map(item_to_object).collect();
            objects.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
            Ok(objects)
        })
    }

    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>> {
        Box::pin(async move {
            let items = self.scan_entity("upload").await?;
            let mut uploads: Vec<MultipartUploadRecord> = items.iter().map(item_to_upload).collect();
            uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            Ok(uploads)
        })
    }

    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>> {
        Box::pin(async move {
            let items = self.scan_entity("part").await?;
            let mut parts: Vec<(String, PartRecord)> = items
                .iter()
                .map(|i| (get_s(i, "upload_id"), item_to_part(i)))
                .collect();
            parts.sort_by(|a, b| (&a.0, a.1.part_number).cmp(&(&b.0, b.1.part_number)));
            Ok(parts)
        })
    }

    fn dump_credentials(&self) -> BoxFut<'_, Vec<CredentialRecord>> {
        Box::pin(async move {
            let items = self.scan_entity("credential").await?;
            let mut credentials: Vec<CredentialRecord> =
                items.iter().map(item_to_credential).collect();
            credentials.sort_by(|a, b| a.access_key_id.cmp(&b.access_key_id));
            Ok(credentials)
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await
                .map_err(wrap)?;
            Ok(())
        })
    }
}
