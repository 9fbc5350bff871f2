//! End-to-end scenarios exercised against `MetadataStore` directly, without
//! going through `TransferEngine`: dedup accounting, rename collisions, and
//! the trash lifecycle (soft delete, restore-with-collision, permanent
//! deletion cascading across shared content). These go beyond what the
//! module-level `#[cfg(test)]` blocks cover in miniature.

use tdrive_core::metadata::{ChunkRef, ItemType, MetadataStore};

async fn open_store() -> (tempfile::TempDir, MetadataStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open(&dir.path().join("meta.db")).await.unwrap();
    (dir, store)
}

async fn seed_content(store: &MetadataStore, folder_id: i64, name: &str, hash: &str, size: i64, message_id: i64) -> i64 {
    store.add_binding(folder_id, name, hash, size).await.unwrap();
    let content_id = store.find_content_by_hash(hash).await.unwrap().unwrap();
    store
        .add_chunks(
            content_id,
            &[ChunkRef {
                part_num: 1,
                message_id,
                part_hash: format!("ph-{message_id}"),
            }],
        )
        .await
        .unwrap();
    content_id
}

#[tokio::test]
async fn renaming_onto_an_existing_sibling_is_rejected_without_bumping_the_version() {
    let (_dir, store) = open_store().await;
    let folder = store.add_folder(store.root_folder_id, "docs").await.unwrap();
    let _note = store.add_binding(folder, "note.txt", "hash-note", 10).await.unwrap();
    let report = store.add_binding(folder, "report.txt", "hash-report", 20).await.unwrap();

    let version_before = store.db_version().await.unwrap();
    let err = store.rename_binding(report, "note.txt").await.unwrap_err();
    assert!(matches!(err, tdrive_core::Error::AlreadyExists { .. }));
    assert_eq!(store.db_version().await.unwrap(), version_before);

    let contents = store.folder_contents(folder).await.unwrap();
    let still_report = contents.iter().find(|e| e.id == report).unwrap();
    assert_eq!(still_report.name, "report.txt");
}

#[tokio::test]
async fn soft_deleted_folder_restores_under_a_collision_free_name() {
    let (_dir, store) = open_store().await;
    let original = store.add_folder(store.root_folder_id, "shared").await.unwrap();
    seed_content(&store, original, "a.bin", "hash-a", 100, 1).await;

    store.soft_delete(original, ItemType::Folder).await.unwrap();

    // A new folder now occupies the original name at the original location.
    let replacement = store.add_folder(store.root_folder_id, "shared").await.unwrap();
    seed_content(&store, replacement, "b.bin", "hash-b", 50, 2).await;

    store.restore(original, ItemType::Folder).await.unwrap();

    let root_contents = store.folder_contents(store.root_folder_id).await.unwrap();
    let names: Vec<&str> = root_contents.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"shared"));
    assert!(names.contains(&"shared (1)"), "restored folder should avoid the name collision, got {names:?}");

    let trash_contents = store.folder_contents(store.trash_folder_id).await.unwrap();
    assert!(trash_contents.is_empty(), "trash should be empty after the restore");
}

#[tokio::test]
async fn permanent_deletion_orphans_only_content_with_no_surviving_binding() {
    let (_dir, store) = open_store().await;
    let doomed = store.add_folder(store.root_folder_id, "doomed").await.unwrap();
    let surviving = store.add_folder(store.root_folder_id, "surviving").await.unwrap();

    // Seven bindings whose content lives only inside the doomed folder.
    let mut expected_orphans: Vec<i64> = Vec::new();
    for i in 0..7 {
        let message_id = 1000 + i;
        seed_content(&store, doomed, &format!("only{i}.bin"), &format!("hash-only-{i}"), 10, message_id).await;
        expected_orphans.push(message_id);
    }

    // Three bindings inside the doomed folder whose content is shared with
    // a binding that lives outside it, via the dedup path.
    let mut shared_hashes = Vec::new();
    for i in 0..3 {
        let hash = format!("hash-shared-{i}");
        store.add_binding(doomed, &format!("shared_in{i}.bin"), &hash, 10).await.unwrap();
        let content_id = store.find_content_by_hash(&hash).await.unwrap().unwrap();
        store
            .add_chunks(content_id, &[ChunkRef { part_num: 1, message_id: 2000 + i, part_hash: format!("ph-shared-{i}") }])
            .await
            .unwrap();
        store.add_binding(surviving, &format!("shared_out{i}.bin"), &hash, 10).await.unwrap();
        shared_hashes.push(hash);
    }

    store.soft_delete(doomed, ItemType::Folder).await.unwrap();
    let orphaned = store.remove_folder(doomed).await.unwrap();

    let mut orphaned_sorted = orphaned.clone();
    orphaned_sorted.sort();
    let mut expected_sorted = expected_orphans.clone();
    expected_sorted.sort();
    assert_eq!(orphaned_sorted, expected_sorted, "exactly the seven unshared contents' message ids should be reported");

    for hash in &shared_hashes {
        assert!(store.find_content_by_hash(hash).await.unwrap().is_some(), "shared content must survive the cascade");
    }
    let surviving_contents = store.folder_contents(surviving).await.unwrap();
    assert_eq!(surviving_contents.len(), 3);
}
