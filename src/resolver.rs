use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::model::{
    ConfigDocument, DomainGroupEntry, DomainUserEntry, FeatureFlag, InstanceSpec,
    InterfacePatterns, OptionMap, OrgUnitEntry, PermissionPolicy,
};

/// Base for uid/gid values assigned to entries that do not set their own.
const ID_BASE: u32 = 1000;

/// Global options appended for clustered (CTDB) instances.
const CTDB_GLOBAL_OPTIONS: &[(&str, &str)] = &[
    ("clustering", "yes"),
    ("ctdb:registry.tdb", "yes"),
    ("include", "registry"),
];

/// Built-in defaults for the CTDB cluster configuration.
const CTDB_DEFAULTS: &[(&str, &str)] = &[
    ("nodes_json", "/var/lib/ctdb/shared/ctdb-nodes.json"),
    ("nodes_path", "/var/lib/ctdb/shared/nodes"),
    ("recovery_lock", "/var/lib/ctdb/shared/RECOVERY"),
    ("log_level", "DEBUG"),
    ("script_log_level", "DEBUG"),
    ("realtime_scheduling", "false"),
];

/// The fully merged, reference-resolved configuration for one instance,
/// ready for consumption by the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    /// Key of the selected entry under `configs`.
    pub instance: String,

    /// Server identity name, when the instance sets one.
    pub instance_name: Option<String>,

    pub features: Vec<FeatureFlag>,

    /// Merged global options, later sections overriding earlier ones.
    /// Iteration order follows first occurrence of each key.
    pub global_options: OptionMap,

    /// Shares referenced by the instance, in reference order.
    pub shares: Vec<EffectiveShare>,

    pub users: Vec<ResolvedUser>,

    pub groups: Vec<ResolvedGroup>,

    /// Present only for AD DC instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<ResolvedDomain>,

    /// Present only for CTDB instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctdb: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveShare {
    pub name: String,
    pub options: OptionMap,
    pub permissions: PermissionPolicy,
}

impl EffectiveShare {
    /// Share root directory, from the share's `path` option.
    pub fn path(&self) -> Option<&str> {
        self.options.get("path").and_then(|v| v.as_str())
    }
}

/// A local user with its uid/gid defaults filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nt_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedGroup {
    pub name: String,
    pub gid: u32,
}

/// Domain settings for an AD DC instance, with derived defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDomain {
    pub realm: String,
    pub short_domain: String,
    pub admin_password: Option<String>,
    /// Name the DC advertises, from the instance name.
    pub dcname: Option<String>,
    /// Interface filter patterns, applied later by the selector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<InterfacePatterns>,
    pub users: Vec<DomainUserEntry>,
    pub groups: Vec<DomainGroupEntry>,
    pub organizational_units: Vec<OrgUnitEntry>,
}

/// Resolve `instance_name` (or the sole instance, when omitted) into
/// its effective configuration. Any failure aborts resolution whole;
/// no partial configuration is produced.
pub fn resolve(doc: &ConfigDocument, instance_name: Option<&str>) -> Result<EffectiveConfig> {
    let (key, spec) = select_instance(doc, instance_name)?;
    debug!("resolving instance {:?}", key);

    validate_features(key, spec)?;

    let mut global_options = merge_globals(doc, key, spec)?;
    if spec.with_ctdb() {
        for (k, v) in CTDB_GLOBAL_OPTIONS {
            global_options.insert(k.to_string(), Value::String(v.to_string()));
        }
    }
    // the instance identity always wins over any global section
    if let Some(name) = &spec.instance_name {
        global_options.insert("netbios name".to_string(), Value::String(name.clone()));
    }

    let shares = resolve_shares(doc, key, spec)?;
    let (users, groups) = resolve_users_and_groups(doc);
    let domain = resolve_domain(doc, key, spec)?;
    let ctdb = spec.with_ctdb().then(|| resolve_ctdb(doc));

    Ok(EffectiveConfig {
        instance: key.to_string(),
        instance_name: spec.instance_name.clone(),
        features: spec.instance_features.clone(),
        global_options,
        shares,
        users,
        groups,
        domain,
        ctdb,
    })
}

fn select_instance<'a>(
    doc: &'a ConfigDocument,
    instance_name: Option<&'a str>,
) -> Result<(&'a str, &'a InstanceSpec)> {
    if let Some(name) = instance_name {
        let spec = doc
            .configs
            .get(name)
            .ok_or_else(|| Error::UnknownInstance {
                name: name.to_string(),
            })?;
        return Ok((name, spec));
    }
    // with no explicit identity only a single-instance config is unambiguous
    if doc.configs.len() != 1 {
        return Err(Error::AmbiguousInstance {
            count: doc.configs.len(),
        });
    }
    let (name, spec) = doc.configs.iter().next().expect("one entry");
    Ok((name.as_str(), spec))
}

fn validate_features(instance: &str, spec: &InstanceSpec) -> Result<()> {
    if spec.with_addc() {
        if !spec.shares.is_empty() {
            return Err(Error::Constraint {
                instance: instance.to_string(),
                reason: "AD DC instances must not reference shares".to_string(),
            });
        }
        if spec.domain_settings.is_none() {
            return Err(Error::Constraint {
                instance: instance.to_string(),
                reason: "AD DC instances require a \"domain_settings\" reference".to_string(),
            });
        }
    } else if spec.domain_settings.is_some() {
        return Err(Error::Constraint {
            instance: instance.to_string(),
            reason: "\"domain_settings\" is only valid with the addc feature".to_string(),
        });
    }
    Ok(())
}

/// Fold the instance's global sections into one mapping, in reference
/// order. A later section overwrites an earlier value for the same key
/// but keeps the key's original position.
fn merge_globals(doc: &ConfigDocument, instance: &str, spec: &InstanceSpec) -> Result<OptionMap> {
    let mut merged = OptionMap::new();
    for gname in &spec.globals {
        let section = doc.globals.get(gname).ok_or_else(|| Error::Constraint {
            instance: instance.to_string(),
            reason: format!("reference to undefined global section {:?}", gname),
        })?;
        for (key, value) in &section.options {
            let value = option_value(value).ok_or_else(|| Error::Constraint {
                instance: instance.to_string(),
                reason: format!("global option {:?} in {:?} is not a string", key, gname),
            })?;
            merged.insert(key.clone(), Value::String(value));
        }
    }
    Ok(merged)
}

fn resolve_shares(
    doc: &ConfigDocument,
    instance: &str,
    spec: &InstanceSpec,
) -> Result<Vec<EffectiveShare>> {
    let mut shares = Vec::with_capacity(spec.shares.len());
    for sname in &spec.shares {
        let share = doc.shares.get(sname).ok_or_else(|| Error::Constraint {
            instance: instance.to_string(),
            reason: format!("reference to undefined share {:?}", sname),
        })?;
        let mut options = OptionMap::new();
        for (key, value) in &share.options {
            let value = option_value(value).ok_or_else(|| Error::Constraint {
                instance: instance.to_string(),
                reason: format!("share option {:?} in {:?} is not a string", key, sname),
            })?;
            options.insert(key.clone(), Value::String(value));
        }
        // a share's own policy wins, then the instance default
        let permissions = share
            .permissions
            .clone()
            .or_else(|| spec.permissions.clone())
            .unwrap_or_default();
        shares.push(EffectiveShare {
            name: sname.clone(),
            options,
            permissions,
        });
    }
    Ok(shares)
}

/// Accept strings verbatim; render scalars that YAML/TOML may have
/// parsed as non-strings.
fn option_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_users_and_groups(doc: &ConfigDocument) -> (Vec<ResolvedUser>, Vec<ResolvedGroup>) {
    let users: Vec<ResolvedUser> = doc
        .users
        .all_entries
        .iter()
        .enumerate()
        .map(|(n, u)| ResolvedUser {
            name: u.name.clone(),
            uid: u.uid.unwrap_or(ID_BASE + n as u32),
            gid: u.gid.unwrap_or(ID_BASE + n as u32),
            nt_hash: u.nt_hash.clone(),
            password: u.password.clone(),
        })
        .collect();

    let mut groups: Vec<ResolvedGroup> = doc
        .groups
        .all_entries
        .iter()
        .enumerate()
        .map(|(n, g)| ResolvedGroup {
            name: g.name.clone(),
            gid: g.gid.unwrap_or(ID_BASE + n as u32),
        })
        .collect();

    // users whose gid no group covers get a group of their own
    for user in &users {
        if !groups.iter().any(|g| g.gid == user.gid) {
            groups.push(ResolvedGroup {
                name: user.name.clone(),
                gid: user.gid,
            });
        }
    }
    (users, groups)
}

fn resolve_domain(
    doc: &ConfigDocument,
    instance: &str,
    spec: &InstanceSpec,
) -> Result<Option<ResolvedDomain>> {
    let Some(ds_name) = &spec.domain_settings else {
        return Ok(None);
    };
    let settings = doc
        .domain_settings
        .get(ds_name)
        .ok_or_else(|| Error::Constraint {
            instance: instance.to_string(),
            reason: format!("reference to undefined domain settings {:?}", ds_name),
        })?;
    let short_domain = match &settings.short_domain {
        Some(short) => short.clone(),
        // derive from the first realm label, as samba-tool would
        None => settings
            .realm
            .split('.')
            .next()
            .unwrap_or_default()
            .to_uppercase(),
    };
    Ok(Some(ResolvedDomain {
        realm: settings.realm.clone(),
        short_domain,
        admin_password: settings.admin_password.clone(),
        dcname: spec.instance_name.clone(),
        interfaces: settings.interfaces.clone(),
        users: doc.domain_users.get(ds_name).cloned().unwrap_or_default(),
        groups: doc.domain_groups.get(ds_name).cloned().unwrap_or_default(),
        organizational_units: doc
            .organizational_units
            .get(ds_name)
            .cloned()
            .unwrap_or_default(),
    }))
}

fn resolve_ctdb(doc: &ConfigDocument) -> BTreeMap<String, String> {
    let mut ctdb: BTreeMap<String, String> = CTDB_DEFAULTS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (key, value) in &doc.ctdb {
        ctdb.insert(key.clone(), value.clone());
    }
    ctdb
}
