use regex::Regex;

use crate::errors::{Error, Result};
use crate::model::InterfacePatterns;

/// The loopback interface is always selected for DC binding.
const LOOPBACK: &str = "lo";

/// A host network interface as reported by the execution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NetInterface {
    pub name: String,
    pub addresses: Vec<String>,
}

impl NetInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
        }
    }
}

/// Filter host interfaces down to the names an AD DC should bind.
///
/// Exclude wins over include; an interface matching neither pattern is
/// kept only when no include pattern is set. Input order is preserved.
pub fn select_interfaces(
    interfaces: &[NetInterface],
    patterns: &InterfacePatterns,
) -> Result<Vec<String>> {
    let include = compile(patterns.include_pattern.as_deref())?;
    let exclude = compile(patterns.exclude_pattern.as_deref())?;

    let mut selected = Vec::new();
    for iface in interfaces {
        if iface.name == LOOPBACK {
            selected.push(iface.name.clone());
            continue;
        }
        if let Some(exclude) = &exclude {
            if exclude.is_match(&iface.name) {
                continue;
            }
        }
        if let Some(include) = &include {
            if !include.is_match(&iface.name) {
                continue;
            }
        }
        selected.push(iface.name.clone());
    }
    Ok(selected)
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(|err| Error::InterfacePattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            }),
    }
}
