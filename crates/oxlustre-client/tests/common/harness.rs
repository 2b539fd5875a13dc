//! A mounted client on top of an in-process cluster.

use bytes::Bytes;
use oxlustre_client::{ClientConfig, LockServices, MountTargets, OpenFlags, Session};
use oxlustre_core::{Fid, StripeMd};
use oxlustre_sim::{SimConfig, TestCluster};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Route client logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestFs {
    pub cluster: TestCluster,
    pub session: Arc<Session>,
}

impl TestFs {
    /// Default cluster, local client configuration.
    pub async fn start() -> Self {
        Self::with_config(SimConfig::default(), ClientConfig::local()).await
    }

    pub async fn with_client(config: ClientConfig) -> Self {
        Self::with_config(SimConfig::default(), config).await
    }

    pub async fn with_config(sim: SimConfig, config: ClientConfig) -> Self {
        init_tracing();
        let cluster = TestCluster::start(sim);
        let session = mount(&cluster, config).await;
        Self { cluster, session }
    }

    /// Mount a second, independent client on the same cluster.
    pub async fn mount_another(&self, config: ClientConfig) -> Arc<Session> {
        mount(&self.cluster, config).await
    }

    pub fn root(&self) -> Fid {
        self.session.root()
    }

    /// Create `name` in the root with `data` as its content.
    pub async fn write_file(&self, name: &str, data: &[u8]) -> Fid {
        let session = &self.session;
        let fd = session
            .open_at(self.root(), name, OpenFlags::RDWR | OpenFlags::CREATE, 0o644)
            .await
            .expect("open for write failed");
        let written = session
            .write(fd, 0, Bytes::copy_from_slice(data))
            .await
            .expect("write failed");
        assert_eq!(written, data.len() as u64);
        session.close(fd).await.expect("close failed");
        session
            .lookup(self.root(), name)
            .await
            .expect("lookup after write failed")
            .fid
    }

    pub async fn read_file(&self, fid: Fid) -> Bytes {
        read_all(&self.session, fid).await
    }

    /// Stripe metadata the client has cached for `fid`.
    pub fn stripe(&self, fid: Fid) -> Arc<StripeMd> {
        self.session
            .inodes()
            .get(&fid)
            .and_then(|inode| inode.stripe())
            .expect("file has no cached stripe metadata")
    }
}

pub async fn mount(cluster: &TestCluster, config: ClientConfig) -> Arc<Session> {
    Session::mount(
        config,
        cluster.transport(),
        MountTargets {
            metadata: cluster.metadata_endpoint(),
            storage: cluster.storage_endpoints(),
        },
        LockServices {
            metadata: cluster.metadata_locks(),
            data: cluster.data_locks(),
        },
    )
    .await
    .expect("mount failed")
}

pub async fn read_all(session: &Session, fid: Fid) -> Bytes {
    let fd = session
        .open(fid, OpenFlags::READ)
        .await
        .expect("open for read failed");
    let data = session.read(fd, 0, 1 << 24).await.expect("read failed");
    session.close(fd).await.expect("close failed");
    data
}
