//! dirpool: directory-backed storage pool management.
//!
//! Pools live on a plain filesystem directory; volumes are directory trees
//! (or raw image files) underneath it. The crate provides the full volume
//! lifecycle: create, fill, copy, snapshot, restore, migrate over a stream
//! connection, back up to tarball staging and restore from one, with project
//! quotas attached where the backing filesystem supports them.

pub mod archive;
pub mod disk;
pub mod driver;
pub mod error;
pub mod migration;
pub mod mount;
pub mod operation;
pub mod paths;
pub mod quota;
pub mod revert;
pub mod sync;
pub mod units;
pub mod volume;

pub use driver::{DirDriver, DriverBackends, DriverInfo, StorageDriver, VolumeIdResolver};
pub use error::{Result, StorageError};
pub use operation::Operation;
pub use volume::{ContentType, Volume, VolumeFiller, VolumeType};
