//! Namespace operation tests: create, link, unlink, rename and directory
//! listing against an in-process cluster.
//!
//! Run: `cargo nextest run -p oxlustre-client namespace_tests`

mod common;

use common::*;
use oxlustre_client::{ClientConfig, NAME_MAX};
use oxlustre_core::attr::mode;
use oxlustre_core::FileType;

// =============================================================================
// Directories
// =============================================================================

#[tokio::test]
async fn test_mkdir_applies_umask_and_links_parent() {
    let fs = TestFs::start().await;
    let root_before = fs.session.getattr(fs.root()).await.unwrap();

    let dir = fs.session.mkdir(fs.root(), "docs", 0o777).await.unwrap();
    assert_eq!(dir.kind, FileType::Directory);
    assert_eq!(dir.perm, 0o755);
    assert_eq!(dir.nlink, 2);

    let root_after = fs.session.getattr(fs.root()).await.unwrap();
    assert_eq!(root_after.nlink, root_before.nlink + 1);
}

#[tokio::test]
async fn test_readdir_lists_every_entry() {
    let fs = TestFs::start().await;
    let dir = fs.session.mkdir(fs.root(), "many", 0o755).await.unwrap();

    // More than one directory page
    for i in 0..150 {
        fs.session
            .mknod(dir.fid, &format!("file{i:03}"), mode::S_IFREG | 0o644, 0)
            .await
            .unwrap();
    }
    let entries = fs.session.readdir(dir.fid).await.unwrap();
    assert_eq!(entries.len(), 150);
    assert_eq!(entries[0].name, "file000");
    assert_eq!(entries[149].name, "file149");
    assert!(entries.iter().all(|e| e.kind == FileType::Regular));
}

#[tokio::test]
async fn test_readdir_on_file_is_enotdir() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "plain", 0o644, 0).await.unwrap();
    assert_errno(fs.session.readdir(file.fid).await, libc::ENOTDIR);
}

#[tokio::test]
async fn test_rmdir_rules() {
    let fs = TestFs::start().await;
    let dir = fs.session.mkdir(fs.root(), "d", 0o755).await.unwrap();
    fs.session.mknod(dir.fid, "inner", 0o644, 0).await.unwrap();
    fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();

    assert_errno(fs.session.rmdir(fs.root(), "d").await, libc::ENOTEMPTY);
    assert_errno(fs.session.rmdir(fs.root(), "f").await, libc::ENOTDIR);
    assert_errno(fs.session.unlink(fs.root(), "d").await, libc::EISDIR);

    fs.session.unlink(dir.fid, "inner").await.unwrap();
    fs.session.rmdir(fs.root(), "d").await.unwrap();
    assert_errno(fs.session.lookup(fs.root(), "d").await, libc::ENOENT);
}

// =============================================================================
// Special Files
// =============================================================================

#[tokio::test]
async fn test_mknod_type_rules() {
    let fs = TestFs::start().await;

    let plain = fs.session.mknod(fs.root(), "plain", 0o666, 0).await.unwrap();
    assert_eq!(plain.kind, FileType::Regular);
    assert_eq!(plain.perm, 0o644);

    let fifo = fs
        .session
        .mknod(fs.root(), "pipe", mode::S_IFIFO | 0o600, 0)
        .await
        .unwrap();
    assert_eq!(fifo.kind, FileType::Fifo);

    let dev = fs
        .session
        .mknod(fs.root(), "dev", mode::S_IFCHR | 0o600, 0x0105)
        .await
        .unwrap();
    assert_eq!(dev.kind, FileType::CharDevice);
    assert_eq!(dev.rdev, 0x0105);

    assert_errno(
        fs.session.mknod(fs.root(), "dir", mode::S_IFDIR | 0o755, 0).await,
        libc::EPERM,
    );
    assert_errno(
        fs.session.mknod(fs.root(), "bogus", mode::S_IFMT | 0o644, 0).await,
        libc::EINVAL,
    );
}

#[tokio::test]
async fn test_create_existing_name_is_eexist() {
    let fs = TestFs::start().await;
    fs.session.mkdir(fs.root(), "x", 0o755).await.unwrap();
    assert_errno(fs.session.mknod(fs.root(), "x", 0o644, 0).await, libc::EEXIST);
}

#[tokio::test]
async fn test_name_validation() {
    let fs = TestFs::start().await;
    assert_errno(fs.session.lookup(fs.root(), "").await, libc::EINVAL);
    assert_errno(fs.session.mkdir(fs.root(), "a/b", 0o755).await, libc::EINVAL);
    let long = "n".repeat(NAME_MAX + 1);
    assert_errno(fs.session.mknod(fs.root(), &long, 0o644, 0).await, libc::ENAMETOOLONG);
    assert_errno(fs.session.lookup(fs.root(), "missing").await, libc::ENOENT);
}

// =============================================================================
// Links
// =============================================================================

#[tokio::test]
async fn test_hard_link_counts() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "orig", 0o644, 0).await.unwrap();

    let linked = fs.session.link(file.fid, fs.root(), "alias").await.unwrap();
    assert_eq!(linked.nlink, 2);
    assert_eq!(fs.session.lookup(fs.root(), "alias").await.unwrap().fid, file.fid);

    fs.session.unlink(fs.root(), "orig").await.unwrap();
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().nlink, 1);
}

#[tokio::test]
async fn test_link_to_directory_is_eperm() {
    let fs = TestFs::start().await;
    let dir = fs.session.mkdir(fs.root(), "d", 0o755).await.unwrap();
    assert_errno(fs.session.link(dir.fid, fs.root(), "d2").await, libc::EPERM);
}

#[tokio::test]
async fn test_link_count_ceiling() {
    let fs = TestFs::with_client(ClientConfig::local().max_link_count(3)).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();

    fs.session.link(file.fid, fs.root(), "a").await.unwrap();
    fs.session.link(file.fid, fs.root(), "b").await.unwrap();
    assert_errno(fs.session.link(file.fid, fs.root(), "c").await, libc::EMLINK);
    assert_errno(fs.session.lookup(fs.root(), "c").await, libc::ENOENT);
}

#[tokio::test]
async fn test_subdirectory_ceiling() {
    let fs = TestFs::with_client(ClientConfig::local().max_link_count(3)).await;
    fs.session.mkdir(fs.root(), "one", 0o755).await.unwrap();
    assert_errno(fs.session.mkdir(fs.root(), "two", 0o755).await, libc::EMLINK);
}

// =============================================================================
// Symlinks
// =============================================================================

#[tokio::test]
async fn test_symlink_roundtrip() {
    let fs = TestFs::start().await;
    let link = fs.session.symlink(fs.root(), "l", "some/where").await.unwrap();
    assert_eq!(link.kind, FileType::Symlink);
    assert_eq!(link.size, 10);

    assert_eq!(fs.session.readlink(link.fid).await.unwrap(), "some/where");
    // The creator knew the target already
    assert_eq!(fs.session.stats().snapshot().readlink_rpcs, 0);
}

#[tokio::test]
async fn test_readlink_on_regular_file_is_einval() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    assert_errno(fs.session.readlink(file.fid).await, libc::EINVAL);
}

// =============================================================================
// Rename
// =============================================================================

#[tokio::test]
async fn test_rename_moves_entry() {
    let fs = TestFs::start().await;
    let dir = fs.session.mkdir(fs.root(), "dst", 0o755).await.unwrap();
    let file = fs.session.mknod(fs.root(), "src", 0o644, 0).await.unwrap();

    fs.session.rename(fs.root(), "src", dir.fid, "moved").await.unwrap();
    assert_errno(fs.session.lookup(fs.root(), "src").await, libc::ENOENT);
    assert_eq!(fs.session.lookup(dir.fid, "moved").await.unwrap().fid, file.fid);
}

#[tokio::test]
async fn test_rename_over_file_destroys_its_objects() {
    let fs = TestFs::start().await;
    fs.write_file("keep", b"new contents").await;
    let victim = fs.write_file("victim", b"old contents").await;
    let md = fs.stripe(victim);
    let target = md.objects[0].target as usize;
    assert!(fs.cluster.ost(target).has_object(md.objects[0].object));

    fs.session.rename(fs.root(), "keep", fs.root(), "victim").await.unwrap();
    assert!(!fs.cluster.ost(target).has_object(md.objects[0].object));

    let fid = fs.session.lookup(fs.root(), "victim").await.unwrap().fid;
    assert_eq!(&fs.read_file(fid).await[..], b"new contents");
}

#[tokio::test]
async fn test_rename_directory_over_file_is_enotdir() {
    let fs = TestFs::start().await;
    fs.session.mkdir(fs.root(), "d", 0o755).await.unwrap();
    fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    assert_errno(fs.session.rename(fs.root(), "d", fs.root(), "f").await, libc::ENOTDIR);
}

// =============================================================================
// Forget
// =============================================================================

#[tokio::test]
async fn test_forget_drops_inode_until_next_lookup() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    let lookups = fs.session.inodes().get(&file.fid).unwrap().lookup_count();

    fs.session.forget(file.fid, lookups);
    assert!(fs.session.inodes().get(&file.fid).is_none());

    // The root is never forgotten
    fs.session.forget(fs.root(), 100);
    assert!(fs.session.inodes().get(&fs.root()).is_some());

    assert_eq!(fs.session.getattr(file.fid).await.unwrap().fid, file.fid);
    assert!(fs.session.inodes().get(&file.fid).is_some());
}
