//! Cache coherence between clients: lock revocation, revalidation,
//! size authority and merge rules for partial or inconsistent replies.
//!
//! Run: `cargo nextest run -p oxlustre-client coherence_tests`

mod common;

use bytes::Bytes;
use common::*;
use futures::future::join_all;
use oxlustre_client::{ClientConfig, ClientError, InodeStatus, OpenFlags};
use oxlustre_core::{AttrValid, ObjectId, Opcode, SetAttr, StripeMd, StripeObject, WireAttrs};
use oxlustre_sim::{Fault, FaultRule, METADATA_ENDPOINT};

// =============================================================================
// Revalidation
// =============================================================================

#[tokio::test]
async fn test_revalidate_hits_under_cached_lock() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();

    fs.session.getattr(file.fid).await.unwrap();
    let before = fs.session.stats().snapshot();
    fs.session.getattr(file.fid).await.unwrap();
    let after = fs.session.stats().snapshot();

    assert_eq!(after.revalidate_hits, before.revalidate_hits + 1);
    assert_eq!(after.getattr_rpcs, before.getattr_rpcs);
}

#[tokio::test]
async fn test_remote_change_revokes_cached_attributes() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().perm, 0o644);

    other.setattr(file.fid, SetAttr::new().mode(0o600)).await.unwrap();

    let inode = fs.session.inodes().get(&file.fid).unwrap();
    inode.drain_notices();
    assert_eq!(inode.status(), InodeStatus::Stale);

    let before = fs.session.stats().snapshot();
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().perm, 0o600);
    assert_eq!(fs.session.stats().snapshot().revalidate_misses, before.revalidate_misses + 1);
}

#[tokio::test]
async fn test_remote_unlink_is_seen() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    fs.session.link(file.fid, fs.root(), "g").await.unwrap();
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().nlink, 2);

    other.unlink(fs.root(), "g").await.unwrap();
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().nlink, 1);
}

#[tokio::test]
async fn test_concurrent_getattr_shares_one_rpc() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    other.lookup(fs.root(), "f").await.unwrap();

    let before = other.stats().snapshot();
    let results = join_all((0..8).map(|_| other.getattr(file.fid))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(other.stats().snapshot().getattr_rpcs, before.getattr_rpcs + 1);
}

// =============================================================================
// Size
// =============================================================================

#[tokio::test]
async fn test_size_written_elsewhere_is_glimpsed() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let fid = fs.write_file("f", b"0123456789").await;

    let fd = other.open(fid, OpenFlags::WRITE).await.unwrap();
    other.write(fd, 10, Bytes::from_static(b"abcdef")).await.unwrap();
    other.close(fd).await.unwrap();

    assert_eq!(fs.session.getattr(fid).await.unwrap().size, 16);
    assert_eq!(&fs.read_file(fid).await[..], b"0123456789abcdef");
}

#[tokio::test]
async fn test_size_authority_lost_to_remote_truncate() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let fd = fs
        .session
        .open_at(fs.root(), "f", OpenFlags::RDWR | OpenFlags::CREATE, 0o644)
        .await
        .unwrap();
    fs.session.write(fd, 0, Bytes::from(patterned(5000))).await.unwrap();
    let inode = fs.session.files().get(fd).unwrap().inode().clone();
    assert!(inode.size_authority());

    other.setattr(inode.fid(), SetAttr::new().size(10)).await.unwrap();

    inode.drain_notices();
    assert!(!inode.size_authority());
    assert_eq!(fs.session.getattr(inode.fid()).await.unwrap().size, 10);
    fs.session.close(fd).await.unwrap();
}

#[tokio::test]
async fn test_local_size_wins_while_authoritative() {
    let fs = TestFs::start().await;
    let fd = fs
        .session
        .open_at(fs.root(), "f", OpenFlags::RDWR | OpenFlags::CREATE, 0o644)
        .await
        .unwrap();
    fs.session.write(fd, 0, Bytes::from(patterned(3000))).await.unwrap();
    let inode = fs.session.files().get(fd).unwrap().inode().clone();

    // A glimpse that has not seen the write yet
    inode.merge_storage(&WireAttrs {
        valid: AttrValid::SIZE,
        size: 0,
        ..WireAttrs::default()
    });
    assert_eq!(inode.size(), 3000);
    assert!(inode.size_authority());

    inode.merge_storage(&WireAttrs {
        valid: AttrValid::SIZE,
        size: 4000,
        ..WireAttrs::default()
    });
    assert_eq!(inode.size(), 4000);
    assert!(!inode.size_authority());
    fs.session.close(fd).await.unwrap();
}

// =============================================================================
// Reply Validation
// =============================================================================

#[tokio::test]
async fn test_masked_fields_keep_cached_values() {
    let fs = TestFs::start().await;
    let other = fs.mount_another(ClientConfig::local()).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    fs.session.getattr(file.fid).await.unwrap();

    other
        .setattr(file.fid, SetAttr::new().uid(42).mode(0o600))
        .await
        .unwrap();
    fs.cluster.network().inject(
        FaultRule::new(Fault::MaskAttrs(AttrValid::UID))
            .on(METADATA_ENDPOINT)
            .op(Opcode::Getattr),
    );

    let attr = fs.session.getattr(file.fid).await.unwrap();
    assert_eq!(attr.uid, 0, "uid without its validity bit must not be merged");
    assert_eq!(attr.perm, 0o600);
}

#[tokio::test]
async fn test_reply_without_type_is_rejected() {
    let fs = TestFs::start().await;
    fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    let other = fs.mount_another(ClientConfig::local()).await;
    fs.cluster.network().inject(
        FaultRule::new(Fault::MaskAttrs(AttrValid::TYPE))
            .on(METADATA_ENDPOINT)
            .op(Opcode::Lookup),
    );
    assert_protocol_error(other.lookup(fs.root(), "f").await);
}

#[tokio::test]
async fn test_changed_stripe_layout_is_rejected() {
    let fs = TestFs::start().await;
    let fid = fs.write_file("f", b"data").await;
    let cached = fs.stripe(fid);

    let foreign = ObjectId::new(0xdead, 0);
    let replaced = StripeMd::new(
        foreign,
        cached.stripe_size,
        0,
        vec![StripeObject {
            object: foreign,
            target: 0,
        }],
    )
    .unwrap();
    fs.cluster.mds().replace_stripe(fid, replaced.to_bytes()).unwrap();

    let err = fs.session.lookup(fs.root(), "f").await.unwrap_err();
    assert!(matches!(err, ClientError::StripeMismatch { fid: f } if f == fid));
    assert_eq!(err.to_errno(), libc::EPROTO);
    assert_eq!(fs.stripe(fid), cached);
}

// =============================================================================
// Symlinks
// =============================================================================

#[tokio::test]
async fn test_concurrent_readlink_fetches_once() {
    let fs = TestFs::start().await;
    fs.session.symlink(fs.root(), "l", "a/long/target").await.unwrap();
    let other = fs.mount_another(ClientConfig::local()).await;
    let fid = other.lookup(fs.root(), "l").await.unwrap().fid;

    let targets = join_all((0..8).map(|_| other.readlink(fid))).await;
    for target in targets {
        assert_eq!(target.unwrap(), "a/long/target");
    }
    assert_eq!(other.stats().snapshot().readlink_rpcs, 1);
}
