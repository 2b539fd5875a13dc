//! Filesystem usage reports and their aggregation.

use serde::{Deserialize, Serialize};

/// Usage report of a single service (metadata service or storage target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObdStatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

impl ObdStatfs {
    /// Sum storage target reports into one, normalised to the block size of the first.
    pub fn sum<'a>(reports: impl IntoIterator<Item = &'a ObdStatfs>) -> Option<ObdStatfs> {
        let mut iter = reports.into_iter();
        let mut total = *iter.next()?;
        let base = total.bsize;
        for r in iter {
            let scale = |v: u64| -> u64 {
                if base == 0 || r.bsize == base {
                    v
                } else {
                    v.saturating_mul(u64::from(r.bsize)) / u64::from(base)
                }
            };
            total.blocks = total.blocks.saturating_add(scale(r.blocks));
            total.bfree = total.bfree.saturating_add(scale(r.bfree));
            total.bavail = total.bavail.saturating_add(scale(r.bavail));
            total.files = total.files.saturating_add(r.files);
            total.ffree = total.ffree.saturating_add(r.ffree);
            total.namelen = total.namelen.min(r.namelen).max(1);
        }
        Some(total)
    }

    /// Combine the metadata report with the aggregated storage report.
    ///
    /// Space comes from storage. Inode counts come from the metadata service,
    /// except that when storage has fewer free objects than the metadata
    /// service has free inodes the totals are reduced so "inodes in use"
    /// stays correct.
    pub fn merge(md: &ObdStatfs, data: &ObdStatfs) -> ObdStatfs {
        let mut out = *md;
        out.bsize = data.bsize;
        out.blocks = data.blocks;
        out.bfree = data.bfree;
        out.bavail = data.bavail;
        if data.ffree < out.ffree {
            out.files = (out.files - out.ffree) + data.ffree;
            out.ffree = data.ffree;
        }
        out
    }
}

/// POSIX `statvfs`-shaped report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub namemax: u64,
}

impl StatVfs {
    pub fn from_obd(osfs: &ObdStatfs, fsid: u64) -> Self {
        Self {
            bsize: u64::from(osfs.bsize),
            frsize: u64::from(osfs.bsize),
            blocks: osfs.blocks,
            bfree: osfs.bfree,
            bavail: osfs.bavail,
            files: osfs.files,
            ffree: osfs.ffree,
            favail: osfs.ffree,
            fsid,
            namemax: u64::from(osfs.namelen),
        }
    }
}
