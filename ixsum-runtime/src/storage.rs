//! Storage capability probe.
//!
//! Generated drivers emit one kernel per specialization and pick between
//! them at run time by probing the element type and the launch options.

use std::any::TypeId;

/// The storage classes a kernel can be specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Plain nested loops.
    Host,
    /// Element type profits from an unrolled inner loop.
    HostVectorizable,
    /// Grid-style execution with flat global ids.
    Device,
}

/// Probe the storage kind for a representative element value.
///
/// `device` reflects the call site's block-kernel option; when set it wins
/// over the element probe, mirroring how device storage bypasses the host
/// kernels entirely.
pub fn storage_kind_of<T: 'static>(_rep: &T, device: bool) -> StorageKind {
    if device {
        return StorageKind::Device;
    }
    let id = TypeId::of::<T>();
    if id == TypeId::of::<f32>()
        || id == TypeId::of::<f64>()
        || id == TypeId::of::<i32>()
        || id == TypeId::of::<i64>()
    {
        StorageKind::HostVectorizable
    } else {
        StorageKind::Host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe() {
        assert_eq!(storage_kind_of(&0.0f64, false), StorageKind::HostVectorizable);
        assert_eq!(storage_kind_of(&0i64, false), StorageKind::HostVectorizable);
        assert_eq!(storage_kind_of(&0u8, false), StorageKind::Host);
        assert_eq!(storage_kind_of(&0.0f32, true), StorageKind::Device);
    }
}
