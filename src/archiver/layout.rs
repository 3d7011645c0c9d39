//! naming of blobs and local directories
//!
//! ```text
//! blob:  [<prefix>/]<service>/<resource>.<suffix>
//! local: <root>/<service>/<resource>/<generation>/
//!        <root>/<service>/<resource>/current -> <generation>
//!        <root>/<service>/.<resource>.lock
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::compression::CompressionMode;
use crate::error::{Error, Result};

/// name of the pointer symlink inside a resource directory
pub const CURRENT: &str = "current";

/// suffix shared by every temporary entry the archiver creates
pub const TMP_SUFFIX: &str = ".tmp";

/// identifies a logical artifact family
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    service: String,
    resource: String,
}

impl ResourceKey {
    pub fn new(service: impl Into<String>, resource: impl Into<String>) -> Result<Self> {
        let service = service.into();
        let resource = resource.into();
        validate_name(&service)?;
        validate_name(&resource)?;
        Ok(Self { service, resource })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.resource)
    }
}

/// service and resource names become single path components
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidResource("empty name".to_string()));
    }

    if name == "." || name == ".." {
        return Err(Error::InvalidResource(format!(
            "name cannot be '.' or '..': {}",
            name
        )));
    }

    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidResource(format!(
            "name cannot contain '/' or null byte: {:?}",
            name
        )));
    }

    if name.starts_with('.') {
        return Err(Error::InvalidResource(format!(
            "name cannot start with '.': {}",
            name
        )));
    }

    Ok(())
}

/// object path of a resource in the blob store
pub fn blob_path(prefix: Option<&str>, key: &ResourceKey, mode: CompressionMode) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!(
            "{}/{}/{}.{}",
            prefix,
            key.service,
            key.resource,
            mode.suffix()
        ),
        None => format!("{}/{}.{}", key.service, key.resource, mode.suffix()),
    }
}

/// listing prefix covering every resource of a service
pub fn service_prefix(prefix: Option<&str>, service: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}/", prefix, service),
        None => format!("{}/", service),
    }
}

/// local directory layout rooted at the archive directory
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.root.join(service)
    }

    pub fn resource_dir(&self, key: &ResourceKey) -> PathBuf {
        self.service_dir(&key.service).join(&key.resource)
    }

    pub fn version_dir(&self, key: &ResourceKey, version: &str) -> PathBuf {
        self.resource_dir(key).join(version)
    }

    pub fn current_link(&self, key: &ResourceKey) -> PathBuf {
        self.resource_dir(key).join(CURRENT)
    }

    /// lock file sits beside the resource directory so cleanup never sees it
    pub fn lock_path(&self, key: &ResourceKey) -> PathBuf {
        self.service_dir(&key.service)
            .join(format!(".{}.lock", key.resource))
    }
}

/// fresh hidden name for a temporary entry
pub fn temp_name() -> String {
    format!(".{}{}", uuid::Uuid::new_v4(), TMP_SUFFIX)
}
