use std::{
    cmp::Ordering,
    fmt::{self, Display},
};

use anyhow::{anyhow, Context, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Inclusive range of application versions a migration belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersionRange {
    pub min: Version,
    pub max: Version,
}

/// Where an application version falls relative to an `AppVersionRange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionWindow {
    NotYetApplicable,
    Within,
    Exceeded,
}

impl AppVersionRange {
    pub fn new(min: Version, max: Version) -> Result<Self> {
        if min > max {
            return Err(anyhow!("invalid version range: {} > {}", min, max));
        }
        Ok(Self { min, max })
    }

    pub fn parse(min: &str, max: &str) -> Result<Self> {
        Self::new(
            Version::parse(min).with_context(|| format!("parsing minimum version {min}"))?,
            Version::parse(max).with_context(|| format!("parsing maximum version {max}"))?,
        )
    }

    pub fn window(&self, version: &Version) -> VersionWindow {
        match (version.cmp(&self.min), version.cmp(&self.max)) {
            (Ordering::Less, _) => VersionWindow::NotYetApplicable,
            (_, Ordering::Greater) => VersionWindow::Exceeded,
            _ => VersionWindow::Within,
        }
    }
}

impl Display for AppVersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ">={}, <={}", self.min, self.max)
    }
}

/// A version range the named external service must satisfy before a
/// migration may start, e.g. `clickhouse >=21.6.0, <21.7.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersionRequirement {
    pub service: String,
    pub supported_version: VersionReq,
}

impl ServiceVersionRequirement {
    pub fn new(service: &str, supported_version: &str) -> Result<Self> {
        Ok(Self {
            service: service.to_string(),
            supported_version: VersionReq::parse(supported_version).with_context(|| {
                format!("parsing version requirement {supported_version} for {service}")
            })?,
        })
    }

    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.supported_version.matches(version)
    }
}

/// Parses a version reported by an external service. Services often report
/// more than three numeric components (`21.6.5.37`) or a suffix
/// (`15.4 (Debian 15.4-1)`); only `major.minor.patch` is kept and missing
/// components are treated as zero.
pub fn parse_service_version(raw: &str) -> Result<Version> {
    let numeric = raw
        .trim()
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or_default();
    let mut parts = numeric
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .with_context(|| format!("invalid version component {part} in {raw}"))
        });

    let major = parts
        .next()
        .ok_or_else(|| anyhow!("no version found in {:?}", raw))??;
    let minor = parts.next().transpose()?.unwrap_or(0);
    let patch = parts.next().transpose()?.unwrap_or(0);
    Ok(Version::new(major, minor, patch))
}
