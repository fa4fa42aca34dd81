use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Ordered string-keyed mapping, as parsed from a config document.
/// `serde_json` is built with `preserve_order`, so iteration follows
/// the order keys first appeared in the source files.
pub type OptionMap = serde_json::Map<String, serde_json::Value>;

/// Feature flags that switch on wide-ranging behaviors for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureFlag {
    Addc,
    Ctdb,
}

/// The whole typed configuration document, merged from every supplied
/// file. Constructed once per invocation and read-only afterwards.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(rename = "samba-container-config")]
    pub version: String,

    /// Named server instances selectable at runtime.
    #[serde(default)]
    pub configs: HashMap<String, InstanceSpec>,

    /// Share definitions, referenced by name from instances.
    #[serde(default)]
    pub shares: HashMap<String, ShareSpec>,

    /// Reusable blocks of smb.conf global options.
    #[serde(default)]
    pub globals: HashMap<String, GlobalSpec>,

    #[serde(default)]
    pub users: UsersSection,

    #[serde(default)]
    pub groups: GroupsSection,

    /// AD DC domain configurations, referenced by name from instances.
    #[serde(default)]
    pub domain_settings: HashMap<String, DomainSettings>,

    /// Initial domain users, keyed by domain settings name.
    #[serde(default)]
    pub domain_users: HashMap<String, Vec<DomainUserEntry>>,

    /// Initial domain groups, keyed by domain settings name.
    #[serde(default)]
    pub domain_groups: HashMap<String, Vec<DomainGroupEntry>>,

    /// Organizational units to create, keyed by domain settings name.
    #[serde(default)]
    pub organizational_units: HashMap<String, Vec<OrgUnitEntry>>,

    /// Overrides for the CTDB cluster configuration.
    #[serde(default)]
    pub ctdb: BTreeMap<String, String>,
}

impl ConfigDocument {
    /// Check document-wide invariants that the serde layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.configs.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "no entries under \"configs\"".to_string(),
            });
        }
        for user in &self.users.all_entries {
            user.validate()?;
        }
        for (ds_name, users) in &self.domain_users {
            for user in users {
                user.validate().map_err(|err| Error::InvalidConfig {
                    reason: format!("domain_users[{:?}]: {}", ds_name, err),
                })?;
            }
        }
        Ok(())
    }
}

/// One entry of the `configs` section: a self-contained server identity.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    /// Name set for the server instance (netbios name, DC name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_features: Vec<FeatureFlag>,

    /// Ordered share-name references. Empty for AD DC instances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shares: Vec<String>,

    /// Ordered global-section references, merged first to last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub globals: Vec<String>,

    /// Domain settings reference. Required iff the addc feature is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_settings: Option<String>,

    /// Instance-wide default permission policy for shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionPolicy>,
}

impl InstanceSpec {
    pub fn with_addc(&self) -> bool {
        self.instance_features.contains(&FeatureFlag::Addc)
    }

    pub fn with_ctdb(&self) -> bool {
        self.instance_features.contains(&FeatureFlag::Ctdb)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShareSpec {
    /// Options passed verbatim into the share's smb.conf section.
    #[serde(default)]
    pub options: OptionMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionPolicy>,
}

impl ShareSpec {
    /// The `path` smb.conf option, if the share has one.
    pub fn path(&self) -> Option<&str> {
        self.options.get("path").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSpec {
    #[serde(default)]
    pub options: OptionMap,
}

/// How share-root permissions are managed for a share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMethod {
    /// Leave the share root untouched.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Apply the policy once, recording completion in a status xattr.
    #[serde(rename = "initialize-share-perms")]
    InitializeSharePerms,
    /// Apply the policy on every run, no status tracking consulted.
    #[serde(rename = "always-share-perms")]
    AlwaysSharePerms,
}

pub const DEFAULT_STATUS_XATTR: &str = "user.share-perms-status";

fn default_status_xattr() -> String {
    DEFAULT_STATUS_XATTR.to_string()
}

/// Permission management policy for a share root directory.
///
/// Method-specific keys such as `mode` and `status_prefix` live in
/// `options`; unknown keys are preserved for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default)]
    pub method: PermissionMethod,

    /// Extended attribute name used to store completion state.
    #[serde(default = "default_status_xattr")]
    pub status_xattr: String,

    #[serde(flatten)]
    pub options: OptionMap,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            method: PermissionMethod::None,
            status_xattr: default_status_xattr(),
            options: OptionMap::new(),
        }
    }
}

impl PermissionPolicy {
    /// Octal permission bits to apply to the share root.
    pub fn mode(&self) -> Option<&str> {
        self.options.get("mode").and_then(|v| v.as_str())
    }

    /// Marker prefix recorded in the status xattr.
    pub fn status_prefix(&self) -> &str {
        self.options
            .get("status_prefix")
            .and_then(|v| v.as_str())
            .unwrap_or("v1")
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsersSection {
    #[serde(default)]
    pub all_entries: Vec<UserEntry>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupsSection {
    #[serde(default)]
    pub all_entries: Vec<GroupEntry>,
}

/// A user instantiated in the container environment for share access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// NT-hashed password, hex encoded. Mutually exclusive with `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nt_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UserEntry {
    pub fn validate(&self) -> Result<()> {
        if self.nt_hash.is_some() && self.password.is_some() {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "user {:?} sets both \"password\" and \"nt_hash\"",
                    self.name
                ),
            });
        }
        Ok(())
    }

    /// Decode the stored NT hash into raw bytes.
    pub fn nt_passwd(&self) -> Result<Vec<u8>> {
        let hex = match &self.nt_hash {
            Some(h) => h.as_str(),
            None => return Ok(Vec::new()),
        };
        decode_hex(hex).ok_or_else(|| Error::InvalidConfig {
            reason: format!("user {:?} has a malformed nt_hash", self.name),
        })
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// General settings for one AD domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainSettings {
    pub realm: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,

    /// Filters applied to host interfaces for DC binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<InterfacePatterns>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfacePatterns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<String>,
}

/// A user created in a freshly provisioned AD domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainUserEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nt_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Names of groups the user should be made a member of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_of: Vec<String>,

    /// Organizational unit the user is created under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ou: Option<String>,
}

impl DomainUserEntry {
    pub fn validate(&self) -> Result<()> {
        if self.nt_hash.is_some() && self.password.is_some() {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "user {:?} sets both \"password\" and \"nt_hash\"",
                    self.name
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainGroupEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ou: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrgUnitEntry {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_flag_parsing() {
        let spec: InstanceSpec = serde_json::from_value(serde_json::json!({
            "instance_features": ["addc"],
            "domain_settings": "main",
        }))
        .unwrap();
        assert!(spec.with_addc());
        assert!(!spec.with_ctdb());
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let result: std::result::Result<InstanceSpec, _> =
            serde_json::from_value(serde_json::json!({
                "instance_features": ["magic"],
            }));
        assert!(result.is_err());
    }

    #[test]
    fn test_permission_policy_defaults() {
        let policy = PermissionPolicy::default();
        assert_eq!(policy.method, PermissionMethod::None);
        assert_eq!(policy.status_xattr, DEFAULT_STATUS_XATTR);
        assert_eq!(policy.status_prefix(), "v1");
        assert!(policy.mode().is_none());
    }

    #[test]
    fn test_permission_policy_extra_keys_preserved() {
        let policy: PermissionPolicy = serde_json::from_value(serde_json::json!({
            "method": "initialize-share-perms",
            "status_xattr": "user.marker",
            "mode": "0755",
            "status_prefix": "v2",
            "acl_backend": "fancy",
        }))
        .unwrap();
        assert_eq!(policy.method, PermissionMethod::InitializeSharePerms);
        assert_eq!(policy.status_xattr, "user.marker");
        assert_eq!(policy.mode(), Some("0755"));
        assert_eq!(policy.status_prefix(), "v2");
        assert!(policy.options.contains_key("acl_backend"));
    }

    #[test]
    fn test_user_credential_exclusivity() {
        let user: UserEntry = serde_json::from_value(serde_json::json!({
            "name": "alice",
            "password": "letmein",
            "nt_hash": "aabb",
        }))
        .unwrap();
        assert!(user.validate().is_err());
    }

    #[test]
    fn test_nt_hash_decoding() {
        let user: UserEntry = serde_json::from_value(serde_json::json!({
            "name": "bob",
            "nt_hash": "00ff10",
        }))
        .unwrap();
        assert_eq!(user.nt_passwd().unwrap(), vec![0x00, 0xff, 0x10]);

        let bad: UserEntry = serde_json::from_value(serde_json::json!({
            "name": "bob",
            "nt_hash": "zz",
        }))
        .unwrap();
        assert!(bad.nt_passwd().is_err());
    }

    #[test]
    fn test_share_path_option() {
        let share: ShareSpec = serde_json::from_value(serde_json::json!({
            "options": {"path": "/srv/data", "read only": "no"},
        }))
        .unwrap();
        assert_eq!(share.path(), Some("/srv/data"));
    }

    #[test]
    fn test_document_requires_instances() {
        let doc = ConfigDocument {
            version: "v0".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            doc.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
