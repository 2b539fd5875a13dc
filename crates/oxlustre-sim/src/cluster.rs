//! A whole filesystem in one process.

use crate::backing::{BackingStore, MemoryStore};
use crate::mds::MetadataServer;
use crate::network::SimNetwork;
use crate::ost::StorageTarget;
use oxlustre_core::transport::{Endpoint, Transport};
use oxlustre_core::Fid;
use oxlustre_dlm::{ClientId, DEFAULT_ACK_TIMEOUT, LockClient, LockServer, LockService};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const METADATA_ENDPOINT: &str = "mds";

/// Fid of the root directory of every simulated filesystem.
pub const ROOT_FID: Fid = Fid::new(1, 0, 0);

/// Shape of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub storage_targets: u32,
    /// How long a lock holder may sit on a blocking callback before eviction.
    pub ack_timeout: Duration,
    pub ost_capacity_blocks: u64,
    pub ost_object_capacity: u64,
    pub mds_inode_capacity: u64,
    pub block_size: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            storage_targets: 3,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ost_capacity_blocks: 1 << 20,
            ost_object_capacity: 1 << 16,
            mds_inode_capacity: 1 << 16,
            block_size: 4096,
        }
    }
}

impl SimConfig {
    #[must_use]
    pub fn storage_targets(mut self, count: u32) -> Self {
        self.storage_targets = count;
        self
    }

    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ost_capacity_blocks(mut self, blocks: u64) -> Self {
        self.ost_capacity_blocks = blocks;
        self
    }

    #[must_use]
    pub fn mds_inode_capacity(mut self, inodes: u64) -> Self {
        self.mds_inode_capacity = inodes;
        self
    }
}

/// One metadata server, `storage_targets` storage targets and the two lock
/// namespaces, wired to a shared [`SimNetwork`].
#[derive(Debug)]
pub struct TestCluster {
    network: Arc<SimNetwork>,
    mds: Arc<MetadataServer>,
    osts: Vec<Arc<StorageTarget>>,
    md_locks: LockServer,
    dt_locks: LockServer,
}

impl TestCluster {
    /// Must be called from within a Tokio runtime: the lock servers spawn
    /// their callback timers on it.
    pub fn start(config: SimConfig) -> Self {
        let network = Arc::new(SimNetwork::new());
        let md_locks = LockServer::new("mdt-locks", config.ack_timeout);
        let dt_locks = LockServer::new("ost-locks", config.ack_timeout);

        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new(
            ROOT_FID,
            config.mds_inode_capacity,
            config.block_size,
        ));
        let server_locks = LockClient::connect(ClientId::random(), Arc::new(md_locks.clone()), 0);
        let mds = Arc::new(MetadataServer::new(
            METADATA_ENDPOINT,
            ROOT_FID,
            store,
            server_locks,
            config.block_size,
        ));
        network.register(METADATA_ENDPOINT, mds.clone());

        let osts: Vec<_> = (0..config.storage_targets)
            .map(|index| {
                let ost = Arc::new(StorageTarget::new(
                    format!("ost{index}"),
                    index,
                    config.ost_capacity_blocks,
                    config.ost_object_capacity,
                    config.block_size,
                    dt_locks.clone(),
                ));
                network.register(ost.name().to_string(), ost.clone());
                ost
            })
            .collect();

        info!(storage_targets = osts.len(), "Test cluster started");
        Self {
            network,
            mds,
            osts,
            md_locks,
            dt_locks,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.network.clone()
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn metadata_endpoint(&self) -> Endpoint {
        Endpoint::metadata(METADATA_ENDPOINT)
    }

    pub fn storage_endpoints(&self) -> Vec<Endpoint> {
        self.osts.iter().map(|o| Endpoint::storage(o.name())).collect()
    }

    pub fn metadata_locks(&self) -> Arc<dyn LockService> {
        Arc::new(self.md_locks.clone())
    }

    pub fn data_locks(&self) -> Arc<dyn LockService> {
        Arc::new(self.dt_locks.clone())
    }

    pub fn md_lock_server(&self) -> &LockServer {
        &self.md_locks
    }

    pub fn dt_lock_server(&self) -> &LockServer {
        &self.dt_locks
    }

    pub fn mds(&self) -> &MetadataServer {
        &self.mds
    }

    /// # Panics
    ///
    /// If there is no target `index`.
    pub fn ost(&self, index: usize) -> &StorageTarget {
        &self.osts[index]
    }

    pub fn osts(&self) -> &[Arc<StorageTarget>] {
        &self.osts
    }

    /// Stop the lock namespaces and take every service off the network.
    pub fn shutdown(&self) {
        self.md_locks.shutdown();
        self.dt_locks.shutdown();
        self.network.unregister(METADATA_ENDPOINT);
        for ost in &self.osts {
            self.network.unregister(ost.name());
        }
        info!("Test cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxlustre_core::protocol::{decode, encode};
    use oxlustre_core::{Reply, Request};

    async fn call(cluster: &TestCluster, endpoint: &Endpoint, request: &Request) -> Reply {
        let raw = cluster
            .transport()
            .send(endpoint, encode(request).unwrap())
            .await
            .unwrap();
        decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_services_reachable() {
        let cluster = TestCluster::start(SimConfig::default().storage_targets(2));
        assert_eq!(cluster.storage_endpoints().len(), 2);

        let status = call(&cluster, &cluster.metadata_endpoint(), &Request::GetStatus).await;
        assert_eq!(status, Reply::Status { root: ROOT_FID });

        for endpoint in cluster.storage_endpoints() {
            let reply = call(&cluster, &endpoint, &Request::Statfs).await;
            assert!(matches!(reply, Reply::Statfs(_)));
        }
        cluster.shutdown();
    }
}
