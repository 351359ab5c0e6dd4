mod fs;

use std::fmt::{Debug, Display};
use std::io;
use std::time::SystemTime;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32};

pub use crate::resource::fs::{FsResource, FsResources};

/// Stable identifier of an external resource, such as a file path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(ArcStr);

impl ResourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<&Utf8Path> for ResourceKey {
    fn from(value: &Utf8Path) -> Self {
        Self::new(value.as_str())
    }
}

impl From<&camino::Utf8PathBuf> for ResourceKey {
    fn from(value: &camino::Utf8PathBuf) -> Self {
        Self::new(value.as_str())
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceKey({})", self.0)
    }
}

/// A handle to an external resource, as far as change detection needs it.
///
/// Resources form a hierarchy: a resource may have children (a directory), in
/// which case the walking stampers visit them.
pub trait Resource: Send {
    fn key(&self) -> &ResourceKey;

    fn exists(&self) -> io::Result<bool>;

    fn is_dir(&self) -> io::Result<bool>;

    fn modified(&self) -> io::Result<SystemTime>;

    fn read_bytes(&self) -> io::Result<Vec<u8>>;

    /// Direct children, sorted by key. Empty for leaf resources.
    fn children(&self) -> io::Result<Vec<Box<dyn Resource>>>;

    /// Path of `self` below `root`, using `/` as separator.
    fn relative_to(&self, root: &ResourceKey) -> String {
        let key = self.key().as_str();
        key.strip_prefix(root.as_str())
            .map(|rest| rest.trim_start_matches(['/', '\\']))
            .unwrap_or(key)
            .replace('\\', "/")
    }

    /// Content hash of a leaf resource.
    fn hash(&self) -> io::Result<Hash32> {
        Ok(Hash32::hash(self.read_bytes()?))
    }
}

/// Resolves resource keys to resource handles.
pub trait ResourceService: Send + Sync {
    fn resource(&self, key: &ResourceKey) -> io::Result<Box<dyn Resource>>;
}
