//! Version strings as reported by providers and by the platform.
//!
//! Versions are dotted numeric releases with an optional pre-release tag
//! (`1.2`, `v2.10.0`, `3.0.0-beta.2`, `24.1.0.17+build5`). Ordering is numeric
//! per component, missing trailing components count as zero and a pre-release
//! sorts before its release. Build metadata is ignored.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Prerelease;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Version string is empty")]
    Empty,
    #[error("Invalid version component '{component}' in '{raw}'")]
    InvalidComponent { raw: String, component: String },
    #[error("Invalid pre-release tag in '{0}', error: '{1}'")]
    InvalidPrerelease(String, semver::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    release: Vec<u64>,
    pre: Prerelease,
}

impl Version {
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse()
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let body = raw
            .strip_prefix('v')
            .or_else(|| raw.strip_prefix('V'))
            .unwrap_or(raw);
        let body = body.split('+').next().unwrap_or_default();
        let (core, pre) = match body.split_once('-') {
            Some((core, pre)) => (core, pre),
            None => (body, ""),
        };
        if core.is_empty() {
            return Err(Error::Empty);
        }
        let release = core
            .split('.')
            .map(|component| {
                component
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidComponent {
                        raw: raw.to_owned(),
                        component: component.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let pre = Prerelease::new(pre).map_err(|e| Error::InvalidPrerelease(raw.to_owned(), e))?;
        Ok(Version {
            raw: raw.to_owned(),
            release,
            pre,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            let ours = self.release.get(i).copied().unwrap_or(0);
            let theirs = other.release.get(i).copied().unwrap_or(0);
            match ours.cmp(&theirs) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        // semver orders an empty pre-release above any non-empty one
        self.pre.cmp(&other.pre)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    #[test]
    fn components_compare_numerically() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.0.0") > v("1.99.99"));
        assert!(v("1.2") > v("1.1"));
    }

    #[test]
    fn missing_components_count_as_zero() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("v1"), v("1.0.0.0"));
        assert!(v("1.0.0.1") > v("1.0"));
    }

    #[test]
    fn prerelease_sorts_before_release() {
        assert!(v("3.0.0-beta.2") < v("3.0.0"));
        assert!(v("3.0.0-beta.2") > v("3.0.0-beta.1"));
        assert!(v("3.0.0-alpha") < v("3.0.0-beta"));
        assert!(v("3.0.0-rc.1") > v("2.9"));
    }

    #[test]
    fn build_metadata_is_ignored() {
        assert_eq!(v("24.1.0.17+build5"), v("24.1.0.17"));
        assert_eq!(v("24.1.0.17+build5").to_string(), "24.1.0.17+build5");
    }

    #[test]
    fn ordering_is_transitive_and_antisymmetric() {
        let raws = [
            "0.9", "1", "1.0.1", "1.0.1-rc.1", "1.2", "1.10", "2.0-beta", "2.0", "v2.0.1", "10.0",
        ];
        let versions: Vec<Version> = raws.iter().map(|r| v(r)).collect();
        for a in &versions {
            for b in &versions {
                if a > b {
                    assert!(b < a, "{} > {} but not {} < {}", a, b, b, a);
                }
                if a == b {
                    assert!(!(a > b) && !(a < b));
                }
                for c in &versions {
                    if a > b && b > c {
                        assert!(a > c, "{} > {} > {} but not {} > {}", a, b, c, a, c);
                    }
                }
            }
        }
    }

    #[test]
    fn invalid_versions_are_rejected() {
        assert!(matches!(Version::parse(""), Err(Error::Empty)));
        assert!(matches!(Version::parse("v"), Err(Error::Empty)));
        assert!(matches!(
            Version::parse("1.x.3"),
            Err(Error::InvalidComponent { .. })
        ));
        assert!(matches!(
            Version::parse("1.0-beta..1"),
            Err(Error::InvalidPrerelease(..))
        ));
    }

    #[test]
    fn serializes_as_the_reported_string() -> anyhow::Result<()> {
        let json = serde_json::to_string(&v("v1.2.3"))?;
        assert_eq!(json, "\"v1.2.3\"");
        let parsed: Version = serde_json::from_str("\"1.2.3\"")?;
        assert_eq!(parsed, v("1.2.3"));
        Ok(())
    }
}
