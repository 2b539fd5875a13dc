//! Stripe metadata and the striping math.
//!
//! A regular file with allocated storage is laid out RAID-0 style across
//! `stripe_count` storage objects: byte `off` of the file lives in stripe
//! `(off / stripe_size) % stripe_count` at object offset
//! `(off / stripe_size / stripe_count) * stripe_size + off % stripe_size`.
//!
//! The descriptor travels as an opaque little-endian blob (the "EA"). Its
//! magic and shape are checked before anything else so that a malformed blob
//! never reaches the I/O path.

use crate::fid::ObjectId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic number of a version-1 RAID-0 stripe descriptor.
pub const STRIPE_MAGIC_V1: u32 = 0x0BD1_0BD0;

/// Maximum number of stripes a single file may span.
pub const MAX_STRIPE_COUNT: u32 = 160;

/// Stripe sizes must be a multiple of this.
pub const STRIPE_SIZE_ALIGN: u64 = 4096;

/// Largest object a single storage target accepts.
pub const MAX_OBJECT_BYTES: u64 = 1 << 44;

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 4 + 4;
const ENTRY_LEN: usize = 8 + 8 + 4 + 4;

/// Errors decoding or using stripe metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StripeError {
    #[error("bad stripe magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("stripe blob truncated: {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("stripe blob has {extra} trailing bytes")]
    TrailingBytes { extra: usize },

    #[error("unsupported stripe pattern {0}")]
    BadPattern(u32),

    #[error("invalid stripe count {0}")]
    BadStripeCount(u32),

    #[error("invalid stripe size {0}")]
    BadStripeSize(u64),

    #[error("extent {offset}+{len} overflows")]
    ExtentOverflow { offset: u64, len: u64 },

    #[error("stripe index {index} out of range (count {count})")]
    NoSuchStripe { index: usize, count: usize },
}

/// Layout pattern of the stripes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StripePattern {
    Raid0,
}

impl StripePattern {
    fn to_wire(self) -> u32 {
        match self {
            Self::Raid0 => 1,
        }
    }

    fn from_wire(raw: u32) -> Result<Self, StripeError> {
        match raw {
            1 => Ok(Self::Raid0),
            other => Err(StripeError::BadPattern(other)),
        }
    }
}

/// One stripe: a storage object on a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeObject {
    pub object: ObjectId,
    /// Index of the storage target holding the object.
    pub target: u32,
}

/// Stripe metadata of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeMd {
    /// Identity of the striped object as a whole (used as the extent lock resource).
    pub object: ObjectId,
    pub pattern: StripePattern,
    pub stripe_size: u64,
    /// Target index the first stripe was placed on.
    pub stripe_offset: u32,
    pub objects: Vec<StripeObject>,
}

/// A contiguous piece of a file extent that lands in one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeExtent {
    pub stripe: usize,
    pub object: ObjectId,
    pub target: u32,
    pub object_offset: u64,
    pub file_offset: u64,
    pub len: u64,
}

/// All pieces of a file extent that land in one stripe, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeIo {
    pub stripe: usize,
    pub object: ObjectId,
    pub target: u32,
    pub segments: Vec<StripeExtent>,
}

impl StripeIo {
    pub fn bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

impl StripeMd {
    /// Build and validate a RAID-0 descriptor.
    pub fn new(
        object: ObjectId,
        stripe_size: u64,
        stripe_offset: u32,
        objects: Vec<StripeObject>,
    ) -> Result<Self, StripeError> {
        let md = Self {
            object,
            pattern: StripePattern::Raid0,
            stripe_size,
            stripe_offset,
            objects,
        };
        md.validate()?;
        Ok(md)
    }

    pub fn stripe_count(&self) -> usize {
        self.objects.len()
    }

    pub fn validate(&self) -> Result<(), StripeError> {
        let count = u32::try_from(self.objects.len()).unwrap_or(u32::MAX);
        if count == 0 || count > MAX_STRIPE_COUNT {
            return Err(StripeError::BadStripeCount(count));
        }
        if self.stripe_size == 0 || !self.stripe_size.is_multiple_of(STRIPE_SIZE_ALIGN) {
            return Err(StripeError::BadStripeSize(self.stripe_size));
        }
        Ok(())
    }

    /// Size of the encoded blob.
    pub fn ea_size(&self) -> usize {
        HEADER_LEN + ENTRY_LEN * self.objects.len()
    }

    /// Encode to the wire blob.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.ea_size());
        buf.put_u32_le(STRIPE_MAGIC_V1);
        buf.put_u32_le(self.pattern.to_wire());
        buf.put_u64_le(self.object.id);
        buf.put_u64_le(self.object.group);
        buf.put_u64_le(self.stripe_size);
        buf.put_u32_le(self.stripe_offset);
        buf.put_u32_le(self.objects.len() as u32);
        for obj in &self.objects {
            buf.put_u64_le(obj.object.id);
            buf.put_u64_le(obj.object.group);
            buf.put_u32_le(obj.target);
            buf.put_u32_le(0);
        }
        buf.freeze()
    }

    /// Decode a wire blob, checking magic, pattern and shape.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, StripeError> {
        if raw.len() < 4 {
            return Err(StripeError::Truncated {
                len: raw.len(),
                needed: HEADER_LEN,
            });
        }
        let mut buf = raw;
        let magic = buf.get_u32_le();
        if magic != STRIPE_MAGIC_V1 {
            return Err(StripeError::BadMagic { found: magic });
        }
        if raw.len() < HEADER_LEN {
            return Err(StripeError::Truncated {
                len: raw.len(),
                needed: HEADER_LEN,
            });
        }
        let pattern = StripePattern::from_wire(buf.get_u32_le())?;
        let object = ObjectId::new(buf.get_u64_le(), buf.get_u64_le());
        let stripe_size = buf.get_u64_le();
        let stripe_offset = buf.get_u32_le();
        let count = buf.get_u32_le();
        if count == 0 || count > MAX_STRIPE_COUNT {
            return Err(StripeError::BadStripeCount(count));
        }
        let needed = HEADER_LEN + ENTRY_LEN * count as usize;
        if raw.len() < needed {
            return Err(StripeError::Truncated {
                len: raw.len(),
                needed,
            });
        }
        if raw.len() > needed {
            return Err(StripeError::TrailingBytes {
                extra: raw.len() - needed,
            });
        }
        let mut objects = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = buf.get_u64_le();
            let group = buf.get_u64_le();
            let target = buf.get_u32_le();
            let _reserved = buf.get_u32_le();
            objects.push(StripeObject {
                object: ObjectId::new(id, group),
                target,
            });
        }
        let md = Self {
            object,
            pattern,
            stripe_size,
            stripe_offset,
            objects,
        };
        md.validate()?;
        Ok(md)
    }

    /// True when both descriptors describe the same layout.
    pub fn same_layout(&self, other: &Self) -> bool {
        self == other
    }

    /// Largest file size this layout can address.
    pub fn max_file_bytes(&self) -> u64 {
        MAX_OBJECT_BYTES.saturating_mul(self.objects.len() as u64)
    }

    fn stripe_width(&self) -> u64 {
        self.stripe_size * self.objects.len() as u64
    }

    /// Locate a file offset: `(stripe index, object offset)`.
    pub fn locate(&self, file_offset: u64) -> (usize, u64) {
        let count = self.objects.len() as u64;
        let stripe_no = file_offset / self.stripe_size;
        let stripe = (stripe_no % count) as usize;
        let object_offset = (stripe_no / count) * self.stripe_size + file_offset % self.stripe_size;
        (stripe, object_offset)
    }

    /// Split `[offset, offset + len)` into per-stripe pieces in file order.
    pub fn map_extent(&self, offset: u64, len: u64) -> Result<Vec<StripeExtent>, StripeError> {
        let end = offset
            .checked_add(len)
            .ok_or(StripeError::ExtentOverflow { offset, len })?;
        let mut out = Vec::new();
        let mut cur = offset;
        while cur < end {
            let (stripe, object_offset) = self.locate(cur);
            let in_chunk = self.stripe_size - cur % self.stripe_size;
            let take = in_chunk.min(end - cur);
            let obj = &self.objects[stripe];
            out.push(StripeExtent {
                stripe,
                object: obj.object,
                target: obj.target,
                object_offset,
                file_offset: cur,
                len: take,
            });
            cur += take;
        }
        Ok(out)
    }

    /// Like [`map_extent`](Self::map_extent) but grouped per stripe for fan-out.
    pub fn group_by_stripe(&self, offset: u64, len: u64) -> Result<Vec<StripeIo>, StripeError> {
        let mut per_stripe: Vec<Option<StripeIo>> = vec![None; self.objects.len()];
        for seg in self.map_extent(offset, len)? {
            per_stripe[seg.stripe]
                .get_or_insert_with(|| StripeIo {
                    stripe: seg.stripe,
                    object: seg.object,
                    target: seg.target,
                    segments: Vec::new(),
                })
                .segments
                .push(seg);
        }
        Ok(per_stripe.into_iter().flatten().collect())
    }

    /// File size implied by one stripe object's size.
    pub fn object_to_file_size(&self, stripe: usize, object_size: u64) -> Result<u64, StripeError> {
        self.check_stripe(stripe)?;
        if object_size == 0 {
            return Ok(0);
        }
        let count = self.objects.len() as u64;
        let last = object_size - 1;
        let row = last / self.stripe_size;
        let within = last % self.stripe_size;
        Ok((row * count + stripe as u64) * self.stripe_size + within + 1)
    }

    /// Size one stripe object must have for the file to be `file_size` long.
    pub fn file_to_object_size(&self, stripe: usize, file_size: u64) -> Result<u64, StripeError> {
        self.check_stripe(stripe)?;
        let width = self.stripe_width();
        let rows = file_size / width;
        let rem = file_size % width;
        let before = stripe as u64 * self.stripe_size;
        let tail = rem.saturating_sub(before).min(self.stripe_size);
        Ok(rows * self.stripe_size + tail)
    }

    /// File size given every stripe object's size.
    pub fn file_size_from_objects(&self, object_sizes: &[u64]) -> Result<u64, StripeError> {
        let mut size = 0;
        for (stripe, obj_size) in object_sizes.iter().enumerate() {
            size = size.max(self.object_to_file_size(stripe, *obj_size)?);
        }
        Ok(size)
    }

    fn check_stripe(&self, stripe: usize) -> Result<(), StripeError> {
        if stripe >= self.objects.len() {
            return Err(StripeError::NoSuchStripe {
                index: stripe,
                count: self.objects.len(),
            });
        }
        Ok(())
    }
}
