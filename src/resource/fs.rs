use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::resource::{Resource, ResourceKey, ResourceService};

/// Resolves resource keys as filesystem paths.
///
/// Relative keys are resolved against `root` when one is set, and against
/// the working directory otherwise.
#[derive(Debug, Clone, Default)]
pub struct FsResources {
    root: Option<Utf8PathBuf>,
}

impl FsResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, key: &ResourceKey) -> Utf8PathBuf {
        let path = Utf8Path::new(key.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ResourceService for FsResources {
    fn resource(&self, key: &ResourceKey) -> io::Result<Box<dyn Resource>> {
        Ok(Box::new(FsResource {
            key: key.clone(),
            path: self.resolve(key),
        }))
    }
}

/// A file or directory on disk.
#[derive(Debug, Clone)]
pub struct FsResource {
    key: ResourceKey,
    path: Utf8PathBuf,
}

impl FsResource {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Resource for FsResource {
    fn key(&self) -> &ResourceKey {
        &self.key
    }

    fn exists(&self) -> io::Result<bool> {
        self.path.try_exists()
    }

    fn is_dir(&self) -> io::Result<bool> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn modified(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.path)?.modified()
    }

    fn read_bytes(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn children(&self) -> io::Result<Vec<Box<dyn Resource>>> {
        if !self.is_dir()? {
            return Ok(vec![]);
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "non UTF-8 file name")
            })?;

            children.push(FsResource {
                key: ResourceKey::new(format!("{}/{}", self.key.as_str().trim_end_matches('/'), name)),
                path: self.path.join(name),
            });
        }

        children.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(children
            .into_iter()
            .map(|child| Box::new(child) as Box<dyn Resource>)
            .collect())
    }

    fn hash(&self) -> io::Result<Hash32> {
        Hash32::hash_file(&self.path)
    }
}
