//! A mounted filesystem instance.
//!
//! [`Session`] is the explicit context every operation runs against: the
//! metadata and striping clients, both lock tables, the inode cache and the
//! descriptor table. It is built by [`Session::mount`] and torn down by
//! [`Session::unmount`], storage side first.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::file::FileTable;
use crate::inode::InodeCache;
use crate::lov::LovClient;
use crate::mdc::MdcClient;
use crate::obd::ObdOps;
use crate::osc::OscClient;
use crate::single_flight::SingleFlight;
use crate::stats::ClientStats;
use oxlustre_core::transport::{Endpoint, Transport};
use oxlustre_core::{AttrValid, Fid, ObdStatfs};
use oxlustre_dlm::{ClientId, LockClient, LockService};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Where the services of a filesystem live.
#[derive(Debug, Clone)]
pub struct MountTargets {
    pub metadata: Endpoint,
    /// Storage targets; position `i` is target index `i` in stripe metadata.
    pub storage: Vec<Endpoint>,
}

/// Lock namespaces of a filesystem.
#[derive(Clone)]
pub struct LockServices {
    pub metadata: Arc<dyn LockService>,
    pub data: Arc<dyn LockService>,
}

impl std::fmt::Debug for LockServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockServices")
            .field("metadata", &self.metadata.name())
            .field("data", &self.data.name())
            .finish()
    }
}

pub struct Session {
    pub(crate) id: Uuid,
    pub(crate) instance: String,
    pub(crate) config: ClientConfig,
    pub(crate) mdc: MdcClient,
    pub(crate) lov: LovClient,
    pub(crate) md_locks: LockClient,
    pub(crate) dt_locks: LockClient,
    pub(crate) inodes: InodeCache,
    pub(crate) files: FileTable,
    pub(crate) root: Fid,
    pub(crate) stats: ClientStats,
    pub(crate) getattr_flights: SingleFlight<Fid>,
    pub(crate) statfs_cache: Mutex<Option<(Instant, ObdStatfs)>>,
    mounted: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("root", &self.root)
            .field("inodes", &self.inodes.len())
            .field("open_files", &self.files.len())
            .field("mounted", &self.mounted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to the services and load the root inode.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(level = "info", skip_all, fields(profile = %config.profile))]
    pub async fn mount(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        targets: MountTargets,
        locks: LockServices,
    ) -> ClientResult<Arc<Self>> {
        let id = Uuid::new_v4();
        let instance = format!("{}-{}", config.profile, id.simple());
        let policy = config.retry_policy();

        let mdc = MdcClient::new(Arc::clone(&transport), targets.metadata, policy);
        mdc.connect(id).await?;
        let root = match mdc.get_status().await {
            Ok(root) => root,
            Err(e) => {
                let _ = mdc.disconnect().await;
                return Err(e);
            }
        };

        let oscs = targets
            .storage
            .into_iter()
            .enumerate()
            .map(|(index, endpoint)| {
                Arc::new(OscClient::new(index as u32, Arc::clone(&transport), endpoint, policy))
            })
            .collect();
        let lov = LovClient::new(format!("{instance}-lov"), oscs);
        if let Err(e) = lov.connect(id).await {
            let _ = lov.disconnect().await;
            let _ = mdc.disconnect().await;
            return Err(e);
        }

        let client_id = ClientId(id);
        let md_locks = LockClient::connect(client_id, locks.metadata, config.lock_lru_size);
        let dt_locks = LockClient::connect(client_id, locks.data, config.lock_lru_size);
        let inodes = InodeCache::new(md_locks.clone(), dt_locks.clone());

        let session = Arc::new(Self {
            id,
            instance,
            config,
            mdc,
            lov,
            md_locks,
            dt_locks,
            inodes,
            files: FileTable::new(),
            root,
            stats: ClientStats::new(),
            getattr_flights: SingleFlight::new(),
            statfs_cache: Mutex::new(None),
            mounted: AtomicBool::new(true),
        });

        let loaded = match session.mdc.getattr_full(root, AttrValid::BASIC).await {
            Ok(body) => session.inodes.iget(&body).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = loaded {
            let _ = session.unmount().await;
            return Err(e);
        }
        session.inodes.pin_root(root);

        info!(
            instance = %session.instance,
            %root,
            targets = session.lov.target_count(),
            "Mounted"
        );
        Ok(session)
    }

    /// Release every lock and disconnect, storage targets before the
    /// metadata service. Unmounting twice is a no-op.
    #[instrument(level = "info", skip(self), fields(instance = %self.instance))]
    pub async fn unmount(&self) -> ClientResult<()> {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for file in self.files.drain() {
            if let Some(group) = file.take_group() {
                if let Err(e) = self.dt_locks.release(group.handle) {
                    warn!(fd = file.fd(), error = %e, "Group lock release failed");
                }
            }
        }
        self.md_locks.disconnect();
        self.dt_locks.disconnect();

        let storage = self.lov.disconnect().await;
        let metadata = self.mdc.disconnect().await;
        info!("Unmounted");
        storage.and(metadata)
    }

    pub(crate) fn check_mounted(&self) -> ClientResult<()> {
        if self.mounted.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClientError::Unmounted)
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Unique tag of this mount, used to name its devices.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn root(&self) -> Fid {
        self.root
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn inodes(&self) -> &InodeCache {
        &self.inodes
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Metadata lock table.
    pub fn md_locks(&self) -> &LockClient {
        &self.md_locks
    }

    /// Data (extent) lock table.
    pub fn dt_locks(&self) -> &LockClient {
        &self.dt_locks
    }

    pub fn mdc(&self) -> &MdcClient {
        &self.mdc
    }

    pub fn lov(&self) -> &LovClient {
        &self.lov
    }
}
