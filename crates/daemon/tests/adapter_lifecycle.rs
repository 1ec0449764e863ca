use common::error::RemoteError;
use common::remote::ObjectKind;
use common::testkit::MemoryStore;
use copyfs_daemon::fuse::adapter::{DIR_PERM, FILE_PERM, ROOT_PERM};
use copyfs_daemon::fuse::{FilesystemAdapter, FsError, DEFAULT_SPOOL_THRESHOLD};
use futures::future::join_all;

fn adapter(store: &MemoryStore) -> FilesystemAdapter {
    FilesystemAdapter::new(store.client(), DEFAULT_SPOOL_THRESHOLD)
}

fn content(store: &MemoryStore, path: &str) -> Vec<u8> {
    store.file_content(path).unwrap().to_vec()
}

#[tokio::test]
async fn test_writes_stay_local_until_flush() {
    let store = MemoryStore::new();
    let fs = adapter(&store);

    fs.create("/hello.txt").await.unwrap();
    assert!(store.contains("/hello.txt"));
    assert!(content(&store, "/hello.txt").is_empty());

    assert_eq!(fs.write("/hello.txt", b"hello", 0).await.unwrap(), 5);
    assert!(content(&store, "/hello.txt").is_empty());
    assert!(fs.open_files().is_dirty("/hello.txt").await);

    fs.flush("/hello.txt").await.unwrap();
    assert_eq!(content(&store, "/hello.txt"), b"hello");
    assert!(!fs.open_files().is_dirty("/hello.txt").await);

    store.reset_stats();
    fs.release("/hello.txt").await.unwrap();
    assert!(!fs.open_files().is_open("/hello.txt"));
    // clean release uploads nothing
    assert_eq!(store.stats().update_calls, 0);
}

#[tokio::test]
async fn test_release_uploads_dirty_file() {
    let store = MemoryStore::new().with_file("/notes.txt", b"draft");
    let fs = adapter(&store);

    fs.open("/notes.txt").await.unwrap();
    assert_eq!(fs.read("/notes.txt", 100, 0).await.unwrap(), b"draft");
    fs.write("/notes.txt", b"final", 0).await.unwrap();
    fs.write("/notes.txt", b"!", 5).await.unwrap();
    fs.release("/notes.txt").await.unwrap();

    assert_eq!(content(&store, "/notes.txt"), b"final!");
    assert!(!fs.open_files().is_open("/notes.txt"));
}

#[tokio::test]
async fn test_create_seeds_cached_listing() {
    let store = MemoryStore::new().with_dir("/docs");
    let fs = adapter(&store);

    let before = fs.read_dir("/docs").await.unwrap();
    assert_eq!(before.len(), 2);
    let list_calls = store.stats().list_calls;

    let attr = fs.create("/docs/new.txt").await.unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(attr.perm, FILE_PERM);

    let after = fs.read_dir("/docs").await.unwrap();
    let names: Vec<_> = after.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "new.txt"]);
    assert_eq!(store.stats().list_calls, list_calls);
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let store = MemoryStore::new();
    let fs = adapter(&store);
    fs.read_dir("/").await.unwrap();
    store.set_fail_uploads(true);

    let err = fs.create("/broken").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(!fs.open_files().is_open("/broken"));
    assert!(fs.get_attr("/broken").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_get_attr_reports_open_size() {
    let store = MemoryStore::new().with_file("/f", b"abc");
    let fs = adapter(&store);

    fs.open("/f").await.unwrap();
    fs.write("/f", b"defgh", 3).await.unwrap();
    assert_eq!(fs.get_attr("/f").await.unwrap().size, 8);

    fs.release("/f").await.unwrap();
    assert_eq!(fs.get_attr("/f").await.unwrap().size, 8);
    assert_eq!(content(&store, "/f"), b"abcdefgh");
}

#[tokio::test]
async fn test_get_attr_kinds_and_missing_paths() {
    let store = MemoryStore::new().with_file("/d/f", b"12345");
    let fs = adapter(&store);

    let root = fs.get_attr("/").await.unwrap();
    assert!(root.is_dir());
    assert_eq!(root.perm, ROOT_PERM);

    let dir = fs.get_attr("/d").await.unwrap();
    assert_eq!(dir.kind, ObjectKind::Dir);
    assert_eq!(dir.perm, DIR_PERM);

    let file = fs.get_attr("/d/f").await.unwrap();
    assert_eq!(file.size, 5);
    assert_eq!(file.perm, FILE_PERM);

    let missing = fs.get_attr("/d/nope").await.unwrap_err();
    assert_eq!(missing.errno(), libc::ENOENT);
    let under_missing = fs.get_attr("/x/y").await.unwrap_err();
    assert_eq!(under_missing.errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_rename_preserves_pending_writes() {
    let store = MemoryStore::new();
    let fs = adapter(&store);

    fs.create("/draft.txt").await.unwrap();
    fs.write("/draft.txt", b"pending", 0).await.unwrap();
    fs.rename("/draft.txt", "/final.txt").await.unwrap();

    assert!(!fs.open_files().is_open("/draft.txt"));
    assert!(fs.open_files().is_dirty("/final.txt").await);
    assert!(!store.contains("/draft.txt"));

    fs.release("/final.txt").await.unwrap();
    assert_eq!(content(&store, "/final.txt"), b"pending");
    assert!(!store.contains("/draft.txt"));
}

#[tokio::test]
async fn test_failed_rename_keeps_open_file_in_place() {
    let store = MemoryStore::new().with_file("/a", b"x");
    let fs = adapter(&store);
    fs.open("/a").await.unwrap();
    fs.write("/a", b"y", 0).await.unwrap();

    store.set_offline(true);
    let err = fs.rename("/a", "/b").await.unwrap_err();
    assert!(matches!(err, FsError::Remote(RemoteError::RemoteUnavailable(_))));
    assert!(fs.open_files().is_open("/a"));
    assert!(!fs.open_files().is_open("/b"));

    store.set_offline(false);
    fs.release("/a").await.unwrap();
    assert_eq!(content(&store, "/a"), b"y");
}

#[tokio::test]
async fn test_rename_directory_moves_open_children_and_listing() {
    let store = MemoryStore::new().with_file("/old/f", b"1");
    let fs = adapter(&store);
    fs.read_dir("/").await.unwrap();
    fs.open("/old/f").await.unwrap();
    fs.write("/old/f", b"2", 0).await.unwrap();

    fs.rename("/old", "/new").await.unwrap();

    let root: Vec<_> = fs
        .read_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(root, vec![".", "..", "new"]);
    assert!(fs.open_files().is_open("/new/f"));

    fs.release("/new/f").await.unwrap();
    assert_eq!(content(&store, "/new/f"), b"2");
}

#[tokio::test]
async fn test_truncate_marks_dirty_only_on_change() {
    let store = MemoryStore::new().with_file("/t", b"abc");
    let fs = adapter(&store);
    fs.open("/t").await.unwrap();

    fs.truncate("/t", 3).await.unwrap();
    assert!(!fs.open_files().is_dirty("/t").await);

    fs.truncate("/t", 1).await.unwrap();
    assert!(fs.open_files().is_dirty("/t").await);

    fs.truncate("/t", 4).await.unwrap();
    assert_eq!(fs.read("/t", 10, 0).await.unwrap(), b"a\0\0\0");

    fs.release("/t").await.unwrap();
    assert_eq!(content(&store, "/t"), b"a\0\0\0");
}

#[tokio::test]
async fn test_truncate_closed_file_uploads_result() {
    let store = MemoryStore::new()
        .with_file("/keep", b"hello")
        .with_file("/wipe", b"gone");
    let fs = adapter(&store);

    fs.truncate("/keep", 2).await.unwrap();
    assert_eq!(content(&store, "/keep"), b"he");

    store.reset_stats();
    fs.truncate("/wipe", 0).await.unwrap();
    assert!(content(&store, "/wipe").is_empty());
    assert_eq!(store.stats().download_calls, 0);

    assert!(!fs.open_files().is_open("/keep"));
    assert!(!fs.open_files().is_open("/wipe"));
}

#[tokio::test]
async fn test_failed_upload_stays_dirty_until_retry() {
    let store = MemoryStore::new().with_file("/f", b"old");
    let fs = adapter(&store);
    fs.open("/f").await.unwrap();
    fs.write("/f", b"new", 0).await.unwrap();

    store.set_fail_uploads(true);
    let err = fs.release("/f").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(fs.open_files().is_open("/f"));
    assert!(fs.open_files().is_dirty("/f").await);
    assert_eq!(content(&store, "/f"), b"old");

    store.set_fail_uploads(false);
    fs.flush_all().await;
    assert_eq!(content(&store, "/f"), b"new");
    assert!(!fs.open_files().is_open("/f"));
}

#[tokio::test]
async fn test_failed_flush_then_successful_release() {
    let store = MemoryStore::new();
    let fs = adapter(&store);
    fs.create("/f").await.unwrap();
    fs.write("/f", b"data", 0).await.unwrap();

    store.set_fail_uploads(true);
    assert!(fs.flush("/f").await.is_err());
    assert!(fs.open_files().is_dirty("/f").await);

    store.set_fail_uploads(false);
    fs.release("/f").await.unwrap();
    assert_eq!(content(&store, "/f"), b"data");
}

#[tokio::test]
async fn test_mkdir_unlink_rmdir_patch_cached_listing() {
    let store = MemoryStore::new().with_file("/a.txt", b"a");
    let fs = adapter(&store);
    fs.read_dir("/").await.unwrap();
    let list_calls = store.stats().list_calls;

    let attr = fs.mkdir("/d").await.unwrap();
    assert!(attr.is_dir());
    fs.unlink("/a.txt").await.unwrap();

    let names: Vec<_> = fs
        .read_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "d"]);
    assert_eq!(store.stats().list_calls, list_calls);

    fs.rmdir("/d").await.unwrap();
    assert!(!store.contains("/d"));
    assert!(fs.get_attr("/d").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_unlinked_open_file_is_not_resurrected() {
    let store = MemoryStore::new().with_file("/tmp.txt", b"x");
    let fs = adapter(&store);
    fs.open("/tmp.txt").await.unwrap();
    fs.write("/tmp.txt", b"more", 1).await.unwrap();

    fs.unlink("/tmp.txt").await.unwrap();
    fs.release("/tmp.txt").await.unwrap();

    assert!(!store.contains("/tmp.txt"));
}

#[tokio::test]
async fn test_unlinked_open_file_stays_readable_and_writable() {
    let store = MemoryStore::new().with_file("/scratch.tmp", b"scratch");
    let fs = adapter(&store);
    fs.open("/scratch.tmp").await.unwrap();

    fs.unlink("/scratch.tmp").await.unwrap();
    assert!(fs.get_attr("/scratch.tmp").await.unwrap_err().is_not_found());
    assert_eq!(fs.read("/scratch.tmp", 100, 0).await.unwrap(), b"scratch");
    assert_eq!(fs.write("/scratch.tmp", b"S", 0).await.unwrap(), 1);
    fs.truncate("/scratch.tmp", 4).await.unwrap();
    assert_eq!(fs.read("/scratch.tmp", 100, 0).await.unwrap(), b"Scra");

    store.reset_stats();
    fs.release("/scratch.tmp").await.unwrap();
    assert!(!store.contains("/scratch.tmp"));
    assert_eq!(store.stats().update_calls, 0);
    assert!(matches!(
        fs.read("/scratch.tmp", 1, 0).await,
        Err(FsError::NotOpen(_))
    ));
}

#[tokio::test]
async fn test_rename_over_open_file_leaves_moved_content() {
    let store = MemoryStore::new()
        .with_file("/target", b"old-b")
        .with_file("/tmp.new", b"new-a");
    let fs = adapter(&store);
    fs.open("/target").await.unwrap();

    fs.rename("/tmp.new", "/target").await.unwrap();
    assert_eq!(content(&store, "/target"), b"new-a");
    assert!(!fs.open_files().is_open("/target"));

    fs.open("/target").await.unwrap();
    assert_eq!(fs.read("/target", 100, 0).await.unwrap(), b"new-a");
    fs.write("/target", b"X", 0).await.unwrap();

    fs.release("/target").await.unwrap();
    fs.release("/target").await.unwrap();
    assert_eq!(content(&store, "/target"), b"Xew-a");
    assert!(!fs.open_files().has_handles("/target"));
}

#[tokio::test]
async fn test_failed_create_keeps_other_handles_pending_writes() {
    let store = MemoryStore::new().with_file("/doc", b"v1");
    let fs = adapter(&store);
    fs.open("/doc").await.unwrap();
    fs.write("/doc", b"v2", 0).await.unwrap();

    store.set_fail_uploads(true);
    assert!(fs.create("/doc").await.is_err());
    assert!(fs.open_files().is_open("/doc"));
    assert!(fs.open_files().is_dirty("/doc").await);
    assert_eq!(fs.open_files().handles("/doc"), 1);
    assert!(fs.read_dir("/").await.unwrap().iter().any(|e| e.name == "doc"));

    store.set_fail_uploads(false);
    fs.release("/doc").await.unwrap();
    assert_eq!(content(&store, "/doc"), b"v2");
    assert!(!fs.open_files().is_open("/doc"));
}

#[tokio::test]
async fn test_concurrent_opens_share_one_download() {
    let store = MemoryStore::new().with_file("/shared", b"payload");
    let fs = adapter(&store);

    let opens = (0..8).map(|_| fs.open("/shared"));
    for opened in join_all(opens).await {
        opened.unwrap();
    }

    assert_eq!(store.stats().download_calls, 1);
    assert_eq!(fs.open_files().handles("/shared"), 8);
    for _ in 0..8 {
        fs.release("/shared").await.unwrap();
    }
    assert!(!fs.open_files().is_open("/shared"));
}

#[tokio::test]
async fn test_open_rejects_directories_and_missing_files() {
    let store = MemoryStore::new().with_dir("/d");
    let fs = adapter(&store);

    assert_eq!(fs.open("/d").await.unwrap_err().errno(), libc::EISDIR);
    assert_eq!(fs.open("/nope").await.unwrap_err().errno(), libc::ENOENT);
    assert_eq!(
        fs.read("/nope", 1, 0).await.unwrap_err().errno(),
        libc::EBADF
    );
}

#[tokio::test]
async fn test_statfs_and_metadata_noops() {
    let store = MemoryStore::new().with_file("/f", b"1");
    let fs = adapter(&store);

    let stat = fs.statfs();
    assert_eq!((stat.bsize, stat.blocks, stat.bavail), (512, 4096, 2048));

    let attr = fs.chmod("/f", 0o777).await.unwrap();
    assert_eq!(attr.perm, FILE_PERM);
    fs.chown("/f", Some(0), Some(0)).await.unwrap();
}
