//! End-to-end engine scenarios over the local stack: SQLite metadata
//! plus filesystem storage, the default single-node deployment shape.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use bleepstore::config::Config;
use bleepstore::engine::{reaper, CompletedPart, Engine, ObjectWriteOptions, Owner};
use bleepstore::metadata::sqlite::SqliteMetadataStore;
use bleepstore::metadata::store::{ListObjectsQuery, ListPartsQuery, ListUploadsQuery};
use bleepstore::storage::local::LocalFsBackend;
use bleepstore::types::{ByteRange, MIN_PART_SIZE};

struct Harness {
    engine: Engine,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        Self::attach(dir)
    }

    /// Open (or reopen) the engine over an existing data directory --
    /// reopening is how the tests model a restart after a crash.
    fn attach(dir: tempfile::TempDir) -> Self {
        let metadata = SqliteMetadataStore::open(
            dir.path().join("metadata.db").to_str().unwrap(),
        )
        .expect("failed to open metadata store");
        let storage = LocalFsBackend::new(dir.path().join("objects"))
            .expect("failed to open storage backend");
        let engine = Engine::new(Arc::new(metadata), Arc::new(storage), &Config::default());
        Self { engine, dir }
    }

    fn restart(self) -> Self {
        let dir = self.dir;
        drop(self.engine);
        Self::attach(dir)
    }

    fn objects_root(&self) -> std::path::PathBuf {
        self.dir.path().join("objects")
    }
}

fn owner() -> Owner {
    Owner {
        id: "o1".to_string(),
        display_name: "Owner One".to_string(),
    }
}

#[tokio::test]
async fn scenario_bucket_lifecycle() {
    let h = Harness::new();
    h.engine
        .create_bucket("my-bucket", Some("us-west-2"), &owner())
        .await
        .unwrap();

    let bucket = h.engine.get_bucket("my-bucket").await.unwrap().unwrap();
    assert_eq!(bucket.name, "my-bucket");
    assert_eq!(bucket.region, "us-west-2");
    assert_eq!(bucket.owner_id, "o1");

    h.engine.delete_bucket("my-bucket").await.unwrap();
    assert!(h.engine.get_bucket("my-bucket").await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_object_roundtrip_with_md5() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();

    let record = h
        .engine
        .put_object(
            "b",
            "hello.txt",
            Bytes::from("hello"),
            ObjectWriteOptions::default(),
            &owner(),
        )
        .await
        .unwrap();
    assert_eq!(record.etag, "\"5d41402abc4b2a76b9719d911017c592\"");

    let (fetched, body) = h.engine.get_object("b", "hello.txt", None).await.unwrap();
    assert_eq!(body, Bytes::from("hello"));
    assert_eq!(fetched.size, 5);
    assert_eq!(fetched.etag, "\"5d41402abc4b2a76b9719d911017c592\"");
}

#[tokio::test]
async fn scenario_list_with_delimiter() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    for key in [
        "docs/readme.md",
        "photos/2024/a.jpg",
        "photos/2024/b.jpg",
        "photos/2025/a.jpg",
        "root.txt",
    ] {
        h.engine
            .put_object(
                "b",
                key,
                Bytes::from("x"),
                ObjectWriteOptions::default(),
                &owner(),
            )
            .await
            .unwrap();
    }

    let result = h
        .engine
        .list_objects(
            "b",
            ListObjectsQuery {
                delimiter: "/".to_string(),
                ..ListObjectsQuery::default()
            },
        )
        .await
        .unwrap();
    let keys: Vec<&str> = result.objects.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec!["root.txt"]);
    assert_eq!(result.common_prefixes, vec!["docs/", "photos/"]);

    let result = h
        .engine
        .list_objects(
            "b",
            ListObjectsQuery {
                prefix: "photos/".to_string(),
                delimiter: "/".to_string(),
                ..ListObjectsQuery::default()
            },
        )
        .await
        .unwrap();
    assert!(result.objects.is_empty());
    assert_eq!(result.common_prefixes, vec!["photos/2024/", "photos/2025/"]);
}

#[tokio::test]
async fn scenario_pagination() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    for i in 0..5 {
        h.engine
            .put_object(
                "b",
                &format!("key{i}"),
                Bytes::from("x"),
                ObjectWriteOptions::default(),
                &owner(),
            )
            .await
            .unwrap();
    }

    let mut token: Option<String> = None;
    let mut pages: Vec<Vec<String>> = Vec::new();
    loop {
        let result = h
            .engine
            .list_objects(
                "b",
                ListObjectsQuery {
                    max_keys: 2,
                    continuation_token: token.clone(),
                    ..ListObjectsQuery::default()
                },
            )
            .await
            .unwrap();
        pages.push(result.objects.iter().map(|o| o.key.clone()).collect());
        if !result.is_truncated {
            break;
        }
        token = result.next_continuation_token;
    }
    assert_eq!(
        pages,
        vec![
            vec!["key0".to_string(), "key1".to_string()],
            vec!["key2".to_string(), "key3".to_string()],
            vec!["key4".to_string()],
        ]
    );
}

#[tokio::test]
async fn scenario_multipart_complete() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();

    let upload = h
        .engine
        .create_multipart_upload("b", "big.bin", ObjectWriteOptions::default(), &owner())
        .await
        .unwrap();
    assert_eq!(upload.upload_id.len(), 32);

    // Non-terminal parts must clear the 5 MiB floor.
    let sizes = [MIN_PART_SIZE as usize, MIN_PART_SIZE as usize, 3000];
    let mut completed = Vec::new();
    let mut expected_body: Vec<u8> = Vec::new();
    for (index, size) in sizes.iter().enumerate() {
        let part_number = index as u32 + 1;
        let data = vec![part_number as u8; *size];
        expected_body.extend_from_slice(&data);
        let etag = h
            .engine
            .upload_part("b", "big.bin", &upload.upload_id, part_number, Bytes::from(data))
            .await
            .unwrap();
        completed.push(CompletedPart { part_number, etag });
    }

    let record = h
        .engine
        .complete_multipart_upload("b", "big.bin", &upload.upload_id, &completed)
        .await
        .unwrap();
    assert_eq!(record.size as usize, sizes.iter().sum::<usize>());
    assert!(record.etag.ends_with("-3\""));

    let (_, body) = h.engine.get_object("b", "big.bin", None).await.unwrap();
    assert_eq!(body, Bytes::from(expected_body));

    // Terminal state: the upload and its parts are gone, on disk too.
    assert!(h
        .engine
        .get_multipart_upload("b", "big.bin", &upload.upload_id)
        .await
        .unwrap()
        .is_none());
    assert!(!h
        .objects_root()
        .join(".multipart")
        .join(&upload.upload_id)
        .exists());
}

#[tokio::test]
async fn scenario_multipart_abort() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    let upload = h
        .engine
        .create_multipart_upload("b", "gone.bin", ObjectWriteOptions::default(), &owner())
        .await
        .unwrap();
    for n in 1..=2u32 {
        h.engine
            .upload_part("b", "gone.bin", &upload.upload_id, n, Bytes::from("data"))
            .await
            .unwrap();
    }
    let part_dir = h.objects_root().join(".multipart").join(&upload.upload_id);
    assert!(part_dir.is_dir());

    h.engine
        .abort_multipart_upload("b", "gone.bin", &upload.upload_id)
        .await
        .unwrap();

    assert!(h
        .engine
        .get_multipart_upload("b", "gone.bin", &upload.upload_id)
        .await
        .unwrap()
        .is_none());
    let err = h
        .engine
        .list_parts("b", "gone.bin", &upload.upload_id, ListPartsQuery::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NoSuchUpload");
    assert!(!part_dir.exists());
}

#[tokio::test]
async fn scenario_crash_mid_write() {
    // Crash between storage fsync and metadata commit: the bytes sit
    // in scratch (or even at the final path) but no record exists.
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();

    std::fs::write(
        h.objects_root().join(".tmp").join("tmp-crashed-write"),
        b"partial",
    )
    .unwrap();

    let h = h.restart();
    h.engine.recover("bleepstore", "bleepstore-secret").await.unwrap();

    // Scratch cleared; the object never became visible.
    assert!(!h
        .objects_root()
        .join(".tmp")
        .join("tmp-crashed-write")
        .exists());
    let err = h.engine.get_object("b", "victim.txt", None).await.unwrap_err();
    assert_eq!(err.code(), "NoSuchKey");

    // The retry succeeds.
    let record = h
        .engine
        .put_object(
            "b",
            "victim.txt",
            Bytes::from("full write"),
            ObjectWriteOptions::default(),
            &owner(),
        )
        .await
        .unwrap();
    assert_eq!(record.size, 10);
}

#[tokio::test]
async fn scenario_crash_between_assemble_and_cleanup() {
    // A crash after the metadata commit of Complete but before part
    // cleanup leaves orphan part files; recovery removes them and the
    // final object stays visible.
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    let upload = h
        .engine
        .create_multipart_upload("b", "k", ObjectWriteOptions::default(), &owner())
        .await
        .unwrap();
    let etag = h
        .engine
        .upload_part("b", "k", &upload.upload_id, 1, Bytes::from("solo part"))
        .await
        .unwrap();
    h.engine
        .complete_multipart_upload(
            "b",
            "k",
            &upload.upload_id,
            &[CompletedPart {
                part_number: 1,
                etag,
            }],
        )
        .await
        .unwrap();

    // Simulate the crash by resurrecting a stale part directory.
    let stale_dir = h.objects_root().join(".multipart").join(&upload.upload_id);
    std::fs::create_dir_all(&stale_dir).unwrap();
    std::fs::write(stale_dir.join("1"), b"solo part").unwrap();

    let h = h.restart();
    h.engine.recover("bleepstore", "bleepstore-secret").await.unwrap();

    assert!(!stale_dir.exists());
    let (_, body) = h.engine.get_object("b", "k", None).await.unwrap();
    assert_eq!(body, Bytes::from("solo part"));
}

#[tokio::test]
async fn scenario_range_get() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    h.engine
        .put_object(
            "b",
            "doc",
            Bytes::from("0123456789"),
            ObjectWriteOptions::default(),
            &owner(),
        )
        .await
        .unwrap();

    let (_, body) = h
        .engine
        .get_object("b", "doc", ByteRange::parse("bytes=2-5"))
        .await
        .unwrap();
    assert_eq!(body, Bytes::from("2345"));

    let (_, body) = h
        .engine
        .get_object("b", "doc", ByteRange::parse("bytes=-4"))
        .await
        .unwrap();
    assert_eq!(body, Bytes::from("6789"));

    let err = h
        .engine
        .get_object("b", "doc", ByteRange::parse("bytes=99-"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "InvalidRange");
}

#[tokio::test]
async fn scenario_list_uploads_ordering() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    for key in ["beta", "alpha", "alpha"] {
        h.engine
            .create_multipart_upload("b", key, ObjectWriteOptions::default(), &owner())
            .await
            .unwrap();
    }

    let result = h
        .engine
        .list_multipart_uploads("b", ListUploadsQuery::default())
        .await
        .unwrap();
    assert_eq!(result.uploads.len(), 3);
    assert_eq!(result.uploads[0].key, "alpha");
    assert_eq!(result.uploads[1].key, "alpha");
    assert_eq!(result.uploads[2].key, "beta");
    // Equal keys tie-break ascending by upload id.
    assert!(result.uploads[0].upload_id < result.uploads[1].upload_id);
}

#[tokio::test]
async fn scenario_reaper_removes_stale_upload() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    let upload = h
        .engine
        .create_multipart_upload("b", "stale.bin", ObjectWriteOptions::default(), &owner())
        .await
        .unwrap();
    h.engine
        .upload_part("b", "stale.bin", &upload.upload_id, 1, Bytes::from("bytes"))
        .await
        .unwrap();

    // TTL zero: anything initiated at least a second ago is stale.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    reaper::run_tick(
        h.engine.metadata().as_ref(),
        h.engine.storage().as_ref(),
        0,
    )
    .await;

    assert!(h
        .engine
        .get_multipart_upload("b", "stale.bin", &upload.upload_id)
        .await
        .unwrap()
        .is_none());
    assert!(!h
        .objects_root()
        .join(".multipart")
        .join(&upload.upload_id)
        .exists());
}

#[tokio::test]
async fn scenario_batch_delete() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    for key in ["k1", "k2", "k3"] {
        h.engine
            .put_object(
                "b",
                key,
                Bytes::from("x"),
                ObjectWriteOptions::default(),
                &owner(),
            )
            .await
            .unwrap();
    }

    let keys = vec!["k1".to_string(), "missing".to_string(), "k3".to_string()];
    let outcome = h.engine.delete_objects("b", &keys).await.unwrap();
    assert_eq!(outcome.deleted, keys);
    assert!(outcome.errors.is_empty());

    assert!(h.engine.get_object("b", "k2", None).await.is_ok());
    assert!(h.engine.get_object("b", "k1", None).await.is_err());
}

#[tokio::test]
async fn scenario_state_survives_restart() {
    let h = Harness::new();
    h.engine.create_bucket("b", None, &owner()).await.unwrap();
    h.engine
        .put_object(
            "b",
            "persist.txt",
            Bytes::from("still here"),
            ObjectWriteOptions::default(),
            &owner(),
        )
        .await
        .unwrap();

    let h = h.restart();
    h.engine.recover("bleepstore", "bleepstore-secret").await.unwrap();

    let (record, body) = h.engine.get_object("b", "persist.txt", None).await.unwrap();
    assert_eq!(body, Bytes::from("still here"));
    assert_eq!(record.size, 10);
}
