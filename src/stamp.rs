//! Change detection.
//!
//! A stamper reduces a resource or a task output to a small value, the stamp,
//! that is stored next to the dependency. Checking a dependency means stamping
//! again with the same stamper and comparing the two stamps, so the engine
//! never has to keep or interpret the old resource contents.

use std::io;
use std::time::UNIX_EPOCH;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32, Value};
use crate::error::Error;
use crate::resource::Resource;
use crate::task::Registry;

/// Which parts of a directory tree a walking stamper visits.
///
/// Both patterns are glob patterns matched against the path relative to the
/// walked root. Without `descend` every directory is entered, without
/// `matcher` every file is included.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Walk {
    pub descend: Option<String>,
    pub matcher: Option<String>,
}

impl Walk {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(matcher: impl Into<String>) -> Self {
        Self {
            descend: None,
            matcher: Some(matcher.into()),
        }
    }

    pub fn descend(mut self, descend: impl Into<String>) -> Self {
        self.descend = Some(descend.into());
        self
    }

    /// Every file under `root` selected by this walk, in key order.
    fn files(&self, root: &dyn Resource) -> io::Result<Vec<Box<dyn Resource>>> {
        let descend = compile(self.descend.as_deref())?;
        let matcher = compile(self.matcher.as_deref())?;

        let mut files = Vec::new();
        let mut pending = root.children()?;
        pending.reverse();

        while let Some(resource) = pending.pop() {
            let relative = resource.relative_to(root.key());
            if resource.is_dir()? {
                if descend.as_ref().is_none_or(|p| p.matches(&relative)) {
                    let mut children = resource.children()?;
                    children.reverse();
                    pending.extend(children);
                }
            } else if matcher.as_ref().is_none_or(|p| p.matches(&relative)) {
                files.push(resource);
            }
        }

        Ok(files)
    }
}

fn compile(pattern: Option<&str>) -> io::Result<Option<Pattern>> {
    pattern
        .map(|p| Pattern::new(p).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)))
        .transpose()
}

/// Stamps resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStamper {
    /// Only whether the resource exists.
    Exists,
    /// Last modification time of the resource itself.
    Modified,
    /// Latest modification time of any walked file.
    ModifiedWalk(Walk),
    /// Content hash of the resource.
    Hash,
    /// Combined content hash of every walked file.
    HashWalk(Walk),
}

/// Value of a resource stamp.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StampValue {
    Exists(bool),
    /// Milliseconds since the Unix epoch.
    Modified(i64),
    Hash(Option<Hash32>),
}

/// Sentinel for a resource that does not exist. It compares greater than any
/// real modification time.
pub const MODIFIED_MISSING: i64 = i64::MAX;
/// Sentinel for a walk that found nothing.
pub const MODIFIED_EMPTY: i64 = i64::MIN;

/// A resource stamp together with the stamper that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceStamp {
    pub stamper: ResourceStamper,
    pub value: StampValue,
}

impl ResourceStamper {
    pub fn stamp(&self, resource: &dyn Resource) -> io::Result<ResourceStamp> {
        let value = match self {
            ResourceStamper::Exists => StampValue::Exists(resource.exists()?),
            ResourceStamper::Modified => StampValue::Modified(modified(resource)?),
            ResourceStamper::ModifiedWalk(walk) => {
                if !resource.exists()? {
                    StampValue::Modified(MODIFIED_MISSING)
                } else if !resource.is_dir()? {
                    StampValue::Modified(modified(resource)?)
                } else {
                    let mut latest = MODIFIED_EMPTY;
                    for file in walk.files(resource)? {
                        latest = latest.max(modified(file.as_ref())?);
                    }
                    StampValue::Modified(latest)
                }
            }
            ResourceStamper::Hash => {
                if resource.exists()? && !resource.is_dir()? {
                    StampValue::Hash(Some(resource.hash()?))
                } else {
                    StampValue::Hash(None)
                }
            }
            ResourceStamper::HashWalk(walk) => {
                if !resource.exists()? {
                    StampValue::Hash(None)
                } else if !resource.is_dir()? {
                    StampValue::Hash(Some(resource.hash()?))
                } else {
                    let mut hasher = blake3::Hasher::new();
                    for file in walk.files(resource)? {
                        hasher.update(file.relative_to(resource.key()).as_bytes());
                        hasher.update(&[0]);
                        hasher.update(&file.hash()?.to_hex().into_bytes());
                    }
                    StampValue::Hash(Some(hasher.finalize().into()))
                }
            }
        };

        Ok(ResourceStamp {
            stamper: self.clone(),
            value,
        })
    }
}

fn modified(resource: &dyn Resource) -> io::Result<i64> {
    if !resource.exists()? {
        return Ok(MODIFIED_MISSING);
    }

    let millis = match resource.modified()?.duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_millis()).unwrap_or(MODIFIED_MISSING - 1),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX - 1),
    };

    Ok(millis)
}

/// Stamps task outputs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputStamper {
    /// The whole output; any change is a change.
    Equals,
    /// A constant; the output never triggers re-execution of its callers.
    Inconsequential,
    /// The output passed through a projection registered under this id, so
    /// only the projected part is compared.
    Projection(ArcStr),
}

impl Default for OutputStamper {
    fn default() -> Self {
        OutputStamper::Equals
    }
}

/// An output stamp together with the stamper that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputStamp {
    pub stamper: OutputStamper,
    pub value: Value,
}

impl OutputStamper {
    pub fn projection(id: &str) -> Self {
        OutputStamper::Projection(id.into())
    }

    pub fn stamp(&self, output: &Value, registry: &Registry) -> Result<OutputStamp, Error> {
        let value = match self {
            OutputStamper::Equals => output.clone(),
            OutputStamper::Inconsequential => Value::Null,
            OutputStamper::Projection(id) => registry.projection(id)?(output),
        };

        Ok(OutputStamp {
            stamper: self.clone(),
            value,
        })
    }
}
