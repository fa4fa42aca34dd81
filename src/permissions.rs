use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::model::{PermissionMethod, PermissionPolicy};
use crate::xattr_store::ShareRootBackend;

const DEFAULT_MODE: u32 = 0o777;

/// Final state of one permission-policy application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The policy's mode was applied to the share root on this run.
    Applied,
    /// Nothing was done: the method is `none` or the status marker
    /// already records completion.
    Skipped,
}

/// Applies a share's permission policy to its root directory.
///
/// For `initialize-share-perms` the engine reads the policy's status
/// xattr first and only touches the share root when the marker does
/// not record completion. The marker is written strictly after the
/// mode change, so a crash between the two steps re-applies (an
/// idempotent chmod) on the next run instead of skipping it.
///
/// Intended for the single-writer container startup model; there is no
/// cross-process locking.
pub struct SharePermissions<'a, B: ShareRootBackend> {
    backend: &'a B,
    path: PathBuf,
    policy: &'a PermissionPolicy,
}

impl<'a, B: ShareRootBackend> SharePermissions<'a, B> {
    pub fn new(backend: &'a B, path: impl Into<PathBuf>, policy: &'a PermissionPolicy) -> Self {
        Self {
            backend,
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the status marker records a completed application.
    pub fn status_ok(&self) -> Result<bool> {
        let value = self
            .backend
            .get_marker(&self.path, &self.policy.status_xattr)?;
        let Some(value) = value else {
            return Ok(false);
        };
        let text = String::from_utf8_lossy(&value);
        let current_prefix = text.split('/').next().unwrap_or_default();
        Ok(current_prefix == self.policy.status_prefix())
    }

    /// Run the policy's state machine once.
    pub fn apply(&self) -> Result<ApplyOutcome> {
        match self.policy.method {
            PermissionMethod::None => {
                debug!("permissions unmanaged for {:?}", self.path);
                Ok(ApplyOutcome::Skipped)
            }
            PermissionMethod::AlwaysSharePerms => {
                self.set_perms()?;
                self.set_status()?;
                Ok(ApplyOutcome::Applied)
            }
            PermissionMethod::InitializeSharePerms => {
                if self.status_ok()? {
                    debug!("permissions already initialized for {:?}", self.path);
                    return Ok(ApplyOutcome::Skipped);
                }
                self.set_perms()?;
                self.set_status()?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn mode(&self) -> Result<u32> {
        match self.policy.mode() {
            None => Ok(DEFAULT_MODE),
            Some(text) => u32::from_str_radix(text, 8).map_err(|_| Error::InvalidMode {
                path: self.path.clone(),
                value: text.to_string(),
            }),
        }
    }

    fn set_perms(&self) -> Result<()> {
        let mode = self.mode()?;
        info!("setting mode {:o} on {:?}", mode, self.path);
        self.backend.set_mode(&self.path, mode)
    }

    fn set_status(&self) -> Result<()> {
        // marker prefix plus a timestamp as a debugging hint
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let value = format!("{}/{}", self.policy.status_prefix(), ts);
        self.backend
            .set_marker(&self.path, &self.policy.status_xattr, value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xattr_store::MemoryBackend;
    use std::path::Path;

    fn policy(json: serde_json::Value) -> PermissionPolicy {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_method_none_never_touches_fs() {
        let backend = MemoryBackend::new();
        let policy = PermissionPolicy::default();
        let perms = SharePermissions::new(&backend, "/share", &policy);

        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Skipped);
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Skipped);
        assert!(backend.mode_changes().is_empty());
    }

    #[test]
    fn test_initialize_applies_exactly_once() {
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
            "mode": "0755",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);

        assert!(!perms.status_ok().unwrap());
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Applied);
        assert!(perms.status_ok().unwrap());
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Skipped);

        assert_eq!(backend.mode_changes().len(), 1);
        assert_eq!(backend.current_mode(Path::new("/share")), Some(0o755));
    }

    #[test]
    fn test_initialize_reapplies_after_missing_marker() {
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);

        // a marker with the wrong prefix does not count as done
        backend
            .set_marker(Path::new("/share"), "user.marker", b"v0/123")
            .unwrap();
        assert!(!perms.status_ok().unwrap());
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Applied);
        assert_eq!(backend.current_mode(Path::new("/share")), Some(0o777));
    }

    #[test]
    fn test_always_applies_every_run() {
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "always-share-perms",
            "mode": "0700",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);

        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Applied);
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Applied);
        assert_eq!(backend.mode_changes().len(), 2);
    }

    #[test]
    fn test_status_prefix_override() {
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
            "status_prefix": "v2",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);

        perms.apply().unwrap();
        let marker = backend
            .get_marker(Path::new("/share"), "user.marker")
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&marker).starts_with("v2/"));
    }

    #[test]
    fn test_invalid_mode_is_an_error() {
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "always-share-perms",
            "mode": "rwxr-xr-x",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);
        assert!(matches!(
            perms.apply().unwrap_err(),
            Error::InvalidMode { .. }
        ));
        assert!(backend.mode_changes().is_empty());
    }

    #[test]
    fn test_backend_failure_is_not_downgraded() {
        let backend = MemoryBackend::new();
        backend.set_failing(true);
        let policy = policy(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
        }));
        let perms = SharePermissions::new(&backend, "/share", &policy);
        assert!(matches!(
            perms.apply().unwrap_err(),
            Error::PermissionBackend { .. }
        ));
    }

    #[test]
    fn test_marker_written_after_mode_change() {
        // simulate a crash between apply and mark: mode set, no marker
        let backend = MemoryBackend::new();
        let policy = policy(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
            "mode": "0770",
        }));
        backend.set_mode(Path::new("/share"), 0o770).unwrap();

        let perms = SharePermissions::new(&backend, "/share", &policy);
        // next run re-applies because the marker is missing
        assert_eq!(perms.apply().unwrap(), ApplyOutcome::Applied);
        assert_eq!(backend.mode_changes().len(), 2);
        assert!(perms.status_ok().unwrap());
    }
}
