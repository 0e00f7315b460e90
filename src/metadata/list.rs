//! The canonical list/delimiter/pagination algorithm.
//!
//! Every backend funnels its candidate rows through these functions so
//! that prefix grouping, truncation, and cursor derivation behave
//! identically regardless of substrate.  The rule for delimiter
//! listings: build the merged multiset of objects and deduplicated
//! common prefixes, sort it ascending, and only then cut at
//! `max_keys`.  Cutting before the merge undercounts whenever several
//! keys collapse into one common prefix.

use super::store::{
    ListObjectsQuery, ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery,
    ListUploadsResult, MultipartUploadRecord, ObjectRecord, PartRecord,
};

/// One entry of the merged listing: a concrete object or a rolled-up
/// common prefix.
enum Entry {
    Object(ObjectRecord),
    CommonPrefix(String),
}

impl Entry {
    /// The string this entry sorts and paginates by.
    fn sort_key(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::CommonPrefix(p) => p,
        }
    }

    /// Prefixes sort ahead of an equal-keyed object.
    fn tier(&self) -> u8 {
        match self {
            Entry::CommonPrefix(_) => 0,
            Entry::Object(_) => 1,
        }
    }
}

/// True when `key` survives the bucket-level filters: lexicographically
/// after the cursor and under the requested prefix.
pub fn key_matches(key: &str, prefix: &str, start_key: &str) -> bool {
    key > start_key && key.starts_with(prefix)
}

/// Roll a key up to its common prefix under `delimiter`, if the
/// remainder after `prefix` contains the delimiter.
fn roll_up(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    let remainder = &key[prefix.len()..];
    remainder
        .find(delimiter)
        .map(|i| format!("{}{}", prefix, &remainder[..i + delimiter.len()]))
}

/// Apply the delimiter/truncation step of ListObjects to candidates
/// that already passed [`key_matches`].  Candidates need not be sorted.
pub fn paginate_objects(
    mut candidates: Vec<ObjectRecord>,
    query: &ListObjectsQuery,
) -> ListObjectsResult {
    candidates.sort_by(|a, b| a.key.cmp(&b.key));
    let max_keys = query.max_keys as usize;

    if query.delimiter.is_empty() {
        let is_truncated = candidates.len() > max_keys;
        candidates.truncate(max_keys);
        let cursor = if is_truncated {
            candidates.last().map(|o| o.key.clone())
        } else {
            None
        };
        return ListObjectsResult {
            objects: candidates,
            common_prefixes: Vec::new(),
            is_truncated,
            next_marker: cursor.clone(),
            next_continuation_token: cursor,
        };
    }

    // Merge objects and deduplicated prefixes, then sort the combined
    // multiset and cut.  A rolled-up prefix at or before the cursor is
    // a group the previous page already emitted; its keys are skipped,
    // not re-grouped.
    let start_key = query.start_key();
    let mut entries: Vec<Entry> = Vec::new();
    let mut seen_prefixes = std::collections::BTreeSet::new();
    for obj in candidates {
        match roll_up(&obj.key, &query.prefix, &query.delimiter) {
            Some(cp) => {
                if cp.as_str() > start_key && seen_prefixes.insert(cp.clone()) {
                    entries.push(Entry::CommonPrefix(cp));
                }
            }
            None => entries.push(Entry::Object(obj)),
        }
    }
    entries.sort_by(|a, b| {
        a.sort_key()
            .cmp(b.sort_key())
            .then_with(|| a.tier().cmp(&b.tier()))
    });

    let is_truncated = entries.len() > max_keys;
    entries.truncate(max_keys);
    let cursor = if is_truncated {
        entries.last().map(|e| e.sort_key().to_string())
    } else {
        None
    };

    let mut objects = Vec::new();
    let mut common_prefixes = Vec::new();
    for entry in entries {
        match entry {
            Entry::Object(o) => objects.push(o),
            Entry::CommonPrefix(p) => common_prefixes.push(p),
        }
    }

    ListObjectsResult {
        objects,
        common_prefixes,
        is_truncated,
        next_marker: cursor.clone(),
        next_continuation_token: cursor,
    }
}

/// True when an upload survives the `(key_marker, upload_id_marker)`
/// cursor: `key > km OR (key = km AND upload_id > uidm)`.  An empty
/// key marker admits everything.
pub fn upload_after_marker(key: &str, upload_id: &str, key_marker: &str, id_marker: &str) -> bool {
    if key_marker.is_empty() {
        return true;
    }
    key > key_marker || (key == key_marker && !id_marker.is_empty() && upload_id > id_marker)
}

enum UploadEntry {
    Upload(MultipartUploadRecord),
    CommonPrefix(String),
}

impl UploadEntry {
    fn sort_key(&self) -> (&str, &str) {
        match self {
            UploadEntry::Upload(u) => (&u.key, &u.upload_id),
            UploadEntry::CommonPrefix(p) => (p, ""),
        }
    }
}

/// Delimiter/truncation step of ListMultipartUploads. Candidates must
/// already match bucket, prefix, and marker predicate; ordering is
/// `(key, upload_id)` with common prefixes sorting like zero-id
/// uploads.
pub fn paginate_uploads(
    candidates: Vec<MultipartUploadRecord>,
    query: &ListUploadsQuery,
) -> ListUploadsResult {
    let max_uploads = query.max_uploads as usize;

    let mut entries: Vec<UploadEntry> = Vec::new();
    let mut seen_prefixes = std::collections::BTreeSet::new();
    for upload in candidates {
        let rolled = if query.delimiter.is_empty() {
            None
        } else {
            roll_up(&upload.key, &query.prefix, &query.delimiter)
        };
        match rolled {
            Some(cp) => {
                // A group at or before the key marker was already
                // emitted by an earlier page.
                if cp.as_str() > query.key_marker.as_str() && seen_prefixes.insert(cp.clone()) {
                    entries.push(UploadEntry::CommonPrefix(cp));
                }
            }
            None => entries.push(UploadEntry::Upload(upload)),
        }
    }
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let is_truncated = entries.len() > max_uploads;
    entries.truncate(max_uploads);

    let (next_key_marker, next_upload_id_marker) = if is_truncated {
        match entries.last() {
            Some(UploadEntry::Upload(u)) => {
                (Some(u.key.clone()), Some(u.upload_id.clone()))
            }
            Some(UploadEntry::CommonPrefix(p)) => (Some(p.clone()), Some(String::new())),
            None => (None, None),
        }
    } else {
        (None, None)
    };

    let mut uploads = Vec::new();
    let mut common_prefixes = Vec::new();
    for entry in entries {
        match entry {
            UploadEntry::Upload(u) => uploads.push(u),
            UploadEntry::CommonPrefix(p) => common_prefixes.push(p),
        }
    }

    ListUploadsResult {
        uploads,
        common_prefixes,
        is_truncated,
        next_key_marker,
        next_upload_id_marker,
    }
}

/// Truncation step of ListParts. Candidates need not be sorted.
pub fn paginate_parts(mut candidates: Vec<PartRecord>, query: &ListPartsQuery) -> ListPartsResult {
    candidates.retain(|p| p.part_number > query.part_number_marker);
    candidates.sort_by_key(|p| p.part_number);

    let max_parts = query.max_parts as usize;
    let is_truncated = candidates.len() > max_parts;
    candidates.truncate(max_parts);
    let next_part_number_marker = if is_truncated {
        candidates.last().map(|p| p.part_number)
    } else {
        None
    };

    ListPartsResult {
        parts: candidates,
        is_truncated,
        next_part_number_marker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn obj(key: &str) -> ObjectRecord {
        ObjectRecord {
            bucket: "b".to_string(),
            key: key.to_string(),
            size: 0,
            etag: "\"e\"".to_string(),
            content_type: "application/octet-stream".to_string(),
            content_encoding: None,
            content_language: None,
            content_disposition: None,
            cache_control: None,
            expires: None,
            storage_class: "STANDARD".to_string(),
            acl: "{}".to_string(),
            user_metadata: HashMap::new(),
            last_modified: "2026-02-23T00:00:00.000Z".to_string(),
            delete_marker: false,
        }
    }

    fn query(prefix: &str, delimiter: &str, max_keys: u32) -> ListObjectsQuery {
        ListObjectsQuery {
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            max_keys,
            ..ListObjectsQuery::default()
        }
    }

    fn keys(result: &ListObjectsResult) -> Vec<&str> {
        result.objects.iter().map(|o| o.key.as_str()).collect()
    }

    #[test]
    fn test_no_delimiter_sorted_and_truncated() {
        let candidates = vec![obj("c"), obj("a"), obj("b"), obj("d")];
        let result = paginate_objects(candidates, &query("", "", 3));
        assert_eq!(keys(&result), vec!["a", "b", "c"]);
        assert!(result.is_truncated);
        assert_eq!(result.next_continuation_token.as_deref(), Some("c"));
        assert_eq!(result.next_marker.as_deref(), Some("c"));
    }

    #[test]
    fn test_no_delimiter_exact_fit_not_truncated() {
        let candidates = vec![obj("a"), obj("b")];
        let result = paginate_objects(candidates, &query("", "", 2));
        assert!(!result.is_truncated);
        assert!(result.next_continuation_token.is_none());
    }

    #[test]
    fn test_delimiter_groups_folders() {
        // Folder-style grouping: five keys, delimiter "/".
        let candidates = vec![
            obj("docs/readme.md"),
            obj("photos/2024/a.jpg"),
            obj("photos/2024/b.jpg"),
            obj("photos/2025/a.jpg"),
            obj("root.txt"),
        ];
        let result = paginate_objects(candidates, &query("", "/", 1000));
        assert_eq!(keys(&result), vec!["root.txt"]);
        assert_eq!(result.common_prefixes, vec!["docs/", "photos/"]);
        assert!(!result.is_truncated);
    }

    #[test]
    fn test_delimiter_with_prefix() {
        let candidates = vec![
            obj("photos/2024/a.jpg"),
            obj("photos/2024/b.jpg"),
            obj("photos/2025/a.jpg"),
        ];
        let result = paginate_objects(candidates, &query("photos/", "/", 1000));
        assert!(result.objects.is_empty());
        assert_eq!(result.common_prefixes, vec!["photos/2024/", "photos/2025/"]);
    }

    #[test]
    fn test_delimiter_truncates_merged_multiset() {
        // Three keys collapse into prefix "p/" plus two loose keys; the
        // cut applies to the merged set {a, p/, z}, not to raw rows.
        let candidates = vec![
            obj("a"),
            obj("p/1"),
            obj("p/2"),
            obj("p/3"),
            obj("z"),
        ];
        let result = paginate_objects(candidates, &query("", "/", 2));
        assert_eq!(keys(&result), vec!["a"]);
        assert_eq!(result.common_prefixes, vec!["p/"]);
        assert!(result.is_truncated);
        // Cursor is the last kept entry -- the common prefix.
        assert_eq!(result.next_continuation_token.as_deref(), Some("p/"));
    }

    #[test]
    fn test_delimiter_cursor_resumes_totality() {
        // Paging through with the returned cursor enumerates the same
        // entries as one unpaginated call.
        let all = vec![obj("a"), obj("b/1"), obj("b/2"), obj("c"), obj("d/x")];
        let unpaged = paginate_objects(all.clone(), &query("", "/", 1000));

        let mut collected_keys = Vec::new();
        let mut collected_prefixes = Vec::new();
        let mut start = String::new();
        loop {
            let q = ListObjectsQuery {
                delimiter: "/".to_string(),
                max_keys: 2,
                continuation_token: Some(start.clone()),
                ..ListObjectsQuery::default()
            };
            let candidates: Vec<ObjectRecord> = all
                .iter()
                .filter(|o| key_matches(&o.key, "", q.start_key()))
                .cloned()
                .collect();
            let page = paginate_objects(candidates, &q);
            collected_keys.extend(page.objects.iter().map(|o| o.key.clone()));
            collected_prefixes.extend(page.common_prefixes.iter().cloned());
            match page.next_continuation_token {
                Some(token) => start = token,
                None => break,
            }
        }

        let unpaged_keys: Vec<String> = unpaged.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(collected_keys, unpaged_keys);
        assert_eq!(collected_prefixes, unpaged.common_prefixes);
    }

    #[test]
    fn test_multichar_delimiter() {
        let candidates = vec![obj("a::x"), obj("a::y"), obj("plain")];
        let result = paginate_objects(candidates, &query("", "::", 1000));
        assert_eq!(keys(&result), vec!["plain"]);
        assert_eq!(result.common_prefixes, vec!["a::"]);
    }

    #[test]
    fn test_upload_marker_predicate() {
        assert!(upload_after_marker("b", "u1", "", ""));
        assert!(upload_after_marker("b", "u1", "a", ""));
        assert!(!upload_after_marker("a", "u1", "a", ""));
        assert!(upload_after_marker("a", "u2", "a", "u1"));
        assert!(!upload_after_marker("a", "u1", "a", "u1"));
        assert!(!upload_after_marker("a", "u0", "a", "u1"));
    }

    fn upload(key: &str, id: &str) -> MultipartUploadRecord {
        MultipartUploadRecord {
            upload_id: id.to_string(),
            bucket: "b".to_string(),
            key: key.to_string(),
            content_type: "application/octet-stream".to_string(),
            content_encoding: None,
            content_language: None,
            content_disposition: None,
            cache_control: None,
            expires: None,
            storage_class: "STANDARD".to_string(),
            acl: "{}".to_string(),
            user_metadata: HashMap::new(),
            owner_id: "o".to_string(),
            owner_display: "o".to_string(),
            initiated_at: "2026-02-23T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_uploads_order_and_cursor() {
        let q = ListUploadsQuery {
            max_uploads: 2,
            ..ListUploadsQuery::default()
        };
        let result = paginate_uploads(
            vec![upload("k2", "u1"), upload("k1", "u9"), upload("k1", "u2")],
            &q,
        );
        let got: Vec<(&str, &str)> = result
            .uploads
            .iter()
            .map(|u| (u.key.as_str(), u.upload_id.as_str()))
            .collect();
        assert_eq!(got, vec![("k1", "u2"), ("k1", "u9")]);
        assert!(result.is_truncated);
        assert_eq!(result.next_key_marker.as_deref(), Some("k1"));
        assert_eq!(result.next_upload_id_marker.as_deref(), Some("u9"));
    }

    #[test]
    fn test_uploads_delimiter_groups() {
        let q = ListUploadsQuery {
            delimiter: "/".to_string(),
            ..ListUploadsQuery::default()
        };
        let result = paginate_uploads(
            vec![upload("logs/a", "u1"), upload("logs/b", "u2"), upload("top", "u3")],
            &q,
        );
        assert_eq!(result.uploads.len(), 1);
        assert_eq!(result.uploads[0].key, "top");
        assert_eq!(result.common_prefixes, vec!["logs/"]);
    }

    fn part(n: u32) -> PartRecord {
        PartRecord {
            part_number: n,
            size: 100,
            etag: "\"e\"".to_string(),
            last_modified: "2026-02-23T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_parts_pagination() {
        let q = ListPartsQuery {
            max_parts: 2,
            part_number_marker: 1,
        };
        let result = paginate_parts(vec![part(4), part(1), part(2), part(3)], &q);
        let numbers: Vec<u32> = result.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![2, 3]);
        assert!(result.is_truncated);
        assert_eq!(result.next_part_number_marker, Some(3));
    }
}
