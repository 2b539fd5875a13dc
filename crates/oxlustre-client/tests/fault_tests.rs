//! Behaviour under injected network and service faults: resend policy,
//! partial stripe failures, orphaned objects and degraded statfs.
//!
//! Run: `cargo nextest run -p oxlustre-client fault_tests`

mod common;

use bytes::Bytes;
use common::*;
use oxlustre_client::{ClientConfig, ClientError, OpenFlags};
use oxlustre_core::Opcode;
use oxlustre_sim::{Fault, FaultRule, METADATA_ENDPOINT};
use std::time::Duration;

const STRIPE: u64 = 64 * 1024;

// =============================================================================
// Resend Policy
// =============================================================================

#[tokio::test]
async fn test_idempotent_request_is_resent() {
    let fs = TestFs::with_client(ClientConfig::local().max_resends(2)).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    let net = fs.cluster.network();
    let before = net.request_count(METADATA_ENDPOINT, Opcode::Getattr);

    net.inject(
        FaultRule::new(Fault::Drop)
            .on(METADATA_ENDPOINT)
            .op(Opcode::Getattr)
            .times(1),
    );
    fs.session.getattr(file.fid).await.unwrap();
    assert_eq!(net.request_count(METADATA_ENDPOINT, Opcode::Getattr), before + 2);
}

#[tokio::test]
async fn test_hung_request_times_out_and_is_resent() {
    let config = ClientConfig::local()
        .rpc_timeout(Duration::from_millis(100))
        .max_resends(1);
    let fs = TestFs::with_client(config).await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();

    fs.cluster.network().inject(
        FaultRule::new(Fault::Hang)
            .on(METADATA_ENDPOINT)
            .op(Opcode::Getattr)
            .times(1),
    );
    assert_eq!(fs.session.getattr(file.fid).await.unwrap().fid, file.fid);
}

#[tokio::test]
async fn test_lost_reply_of_create_is_not_resent() {
    let fs = TestFs::with_client(ClientConfig::local().max_resends(3)).await;
    let net = fs.cluster.network();
    net.inject(
        FaultRule::new(Fault::DropReply)
            .on(METADATA_ENDPOINT)
            .op(Opcode::Create)
            .times(1),
    );

    assert_errno(fs.session.mkdir(fs.root(), "d", 0o755).await, libc::ENOTCONN);
    assert_eq!(net.request_count(METADATA_ENDPOINT, Opcode::Create), 1);

    // The server did execute it
    let mds = fs.cluster.mds();
    assert!(mds.store().lookup(mds.root(), "d").unwrap().is_some());
    assert_errno(fs.session.mkdir(fs.root(), "d", 0o755).await, libc::EEXIST);
}

#[tokio::test]
async fn test_resent_prep_write_leaves_nothing_staged() {
    let fs = TestFs::with_client(ClientConfig::local().max_resends(2)).await;
    let fid = fs.write_file("f", b"seed").await;
    let target = fs.stripe(fid).objects[0].target;
    let ost = format!("ost{target}");
    let net = fs.cluster.network();
    let before = net.request_count(&ost, Opcode::PrepWrite);
    net.inject(
        FaultRule::new(Fault::DropReply)
            .on(ost.clone())
            .op(Opcode::PrepWrite)
            .times(1),
    );

    let fd = fs.session.open(fid, OpenFlags::RDWR).await.unwrap();
    let data = Bytes::from(patterned(4096));
    assert_eq!(fs.session.write(fd, 0, data.clone()).await.unwrap(), 4096);
    assert_eq!(net.request_count(&ost, Opcode::PrepWrite), before + 2);
    assert_eq!(fs.session.read(fd, 0, 4096).await.unwrap(), data);

    for ost in fs.cluster.osts() {
        assert_eq!(ost.staged_count(), 0);
    }
}

#[tokio::test]
async fn test_remote_errno_is_passed_through() {
    let fs = TestFs::start().await;
    let file = fs.session.mknod(fs.root(), "f", 0o644, 0).await.unwrap();
    fs.cluster.network().inject(
        FaultRule::new(Fault::Errno(libc::EACCES))
            .on(METADATA_ENDPOINT)
            .op(Opcode::Setattr),
    );
    assert_errno(
        fs.session
            .setattr(file.fid, oxlustre_core::SetAttr::new().mode(0o600))
            .await,
        libc::EACCES,
    );
}

// =============================================================================
// Striped I/O Failures
// =============================================================================

#[tokio::test]
async fn test_write_with_one_hung_stripe_reports_partial_failure() {
    let config = ClientConfig::local()
        .default_striping(3, STRIPE)
        .rpc_timeout(Duration::from_millis(200))
        .max_resends(0);
    let fs = TestFs::with_client(config).await;
    let fd = fs
        .session
        .open_at(fs.root(), "f", OpenFlags::RDWR | OpenFlags::CREATE, 0o644)
        .await
        .unwrap();
    let fid = fs.session.files().get(fd).unwrap().inode().fid();
    let md = fs.stripe(fid);
    assert_eq!(md.stripe_count(), 3);

    let stuck = md.objects[2].target;
    fs.cluster.network().inject(
        FaultRule::new(Fault::Hang)
            .on(format!("ost{stuck}"))
            .op(Opcode::PrepWrite),
    );

    let data = Bytes::from(patterned(3 * STRIPE as usize));
    let err = fs.session.write(fd, 0, data.clone()).await.unwrap_err();
    assert_partial(&err, &[0, 1], &[2]);
    assert_eq!(err.to_errno(), libc::ETIMEDOUT);

    // The completed stripes did take effect
    let first = md.objects[0];
    let stored = fs
        .cluster
        .ost(first.target as usize)
        .object_data(first.object)
        .unwrap();
    assert_eq!(&stored[..], &data[..STRIPE as usize]);
}

#[tokio::test]
async fn test_single_stripe_failure_surfaces_as_itself() {
    let fs = TestFs::start().await;
    let fid = fs.write_file("f", b"data").await;
    let target = fs.stripe(fid).objects[0].target;
    fs.cluster.network().inject(
        FaultRule::new(Fault::Errno(libc::EIO))
            .on(format!("ost{target}"))
            .op(Opcode::PrepRead),
    );

    let fd = fs.session.open(fid, OpenFlags::READ).await.unwrap();
    let err = fs.session.read(fd, 0, 4).await.unwrap_err();
    assert!(!matches!(err, ClientError::PartialFailure(_)));
    assert_eq!(err.to_errno(), libc::EIO);
}

// =============================================================================
// Unlink
// =============================================================================

#[tokio::test]
async fn test_unlink_destroys_objects() {
    let fs = TestFs::start().await;
    let fid = fs.write_file("f", b"data").await;
    let obj = fs.stripe(fid).objects[0];

    fs.session.unlink(fs.root(), "f").await.unwrap();
    assert!(!fs.cluster.ost(obj.target as usize).has_object(obj.object));
    assert_eq!(fs.session.stats().snapshot().orphaned, 0);
}

#[tokio::test]
async fn test_unlink_with_failed_destroy_reports_orphans() {
    let fs = TestFs::start().await;
    let fid = fs.write_file("f", b"data").await;
    let obj = fs.stripe(fid).objects[0];
    fs.cluster
        .network()
        .inject(FaultRule::new(Fault::Errno(libc::EIO)).op(Opcode::ObjDestroy));

    let err = fs.session.unlink(fs.root(), "f").await.unwrap_err();
    assert!(matches!(err, ClientError::OrphanedObjects { fid: f, .. } if f == fid));
    assert_eq!(err.to_errno(), libc::EIO);
    assert_eq!(fs.session.stats().snapshot().orphaned, 1);

    // The name is gone, the object is left behind
    assert_errno(fs.session.lookup(fs.root(), "f").await, libc::ENOENT);
    assert!(fs.cluster.ost(obj.target as usize).has_object(obj.object));
}

// =============================================================================
// Statfs
// =============================================================================

#[tokio::test]
async fn test_statfs_survives_one_storage_target() {
    let fs = TestFs::start().await;
    let full = fs.session.statfs().await.unwrap();

    fs.cluster.network().inject(
        FaultRule::new(Fault::Errno(libc::EIO))
            .on("ost1")
            .op(Opcode::Statfs),
    );
    let degraded = fs.session.statfs().await.unwrap();
    assert_eq!(degraded.blocks, full.blocks / 3 * 2);
    assert_eq!(degraded.files, full.files);
}

#[tokio::test]
async fn test_statfs_fails_without_metadata_service() {
    let fs = TestFs::start().await;
    fs.cluster.network().inject(
        FaultRule::new(Fault::Errno(libc::EIO))
            .on(METADATA_ENDPOINT)
            .op(Opcode::Statfs),
    );
    assert_errno(fs.session.statfs().await, libc::EIO);
}

#[tokio::test]
async fn test_statfs_result_is_reused_within_max_age() {
    let config = ClientConfig::local().statfs_max_age(Duration::from_secs(60));
    let fs = TestFs::with_client(config).await;
    let net = fs.cluster.network();

    fs.session.statfs().await.unwrap();
    fs.session.statfs().await.unwrap();
    assert_eq!(net.request_count(METADATA_ENDPOINT, Opcode::Statfs), 1);
}

// =============================================================================
// Unmount
// =============================================================================

#[tokio::test]
async fn test_operations_after_unmount_fail() {
    let fs = TestFs::start().await;
    fs.session.unmount().await.unwrap();
    assert!(!fs.session.is_mounted());
    assert!(matches!(
        fs.session.getattr(fs.root()).await,
        Err(ClientError::Unmounted)
    ));
    // Second unmount is a no-op
    fs.session.unmount().await.unwrap();
}
