use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{RefError, Result};

/// Upper bound on the full repository name, separators included.
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_TAG_LEN: usize = 128;

static NAME_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("name component regex")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex"));

static REGISTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*(?::[0-9]{1,5})?$")
        .expect("registry regex")
});

/// Repository path: `/`-separated lowercase components, e.g. `org/team/os-image`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    name.split('/').all(|c| NAME_COMPONENT.is_match(c))
}

pub fn is_valid_tag(tag: &str) -> bool {
    tag.len() <= MAX_TAG_LEN && TAG.is_match(tag)
}

pub fn is_valid_registry(host: &str) -> bool {
    REGISTRY.is_match(host)
}

/// A fully qualified, tag-addressed image reference: `registry/name:tag`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    registry: String,
    name: String,
    tag: String,
}

impl ImageReference {
    pub fn new(registry: &str, name: &str, tag: &str) -> Result<Self> {
        if !is_valid_registry(registry) {
            return Err(RefError::Registry(registry.to_string()));
        }
        if !is_valid_name(name) {
            return Err(RefError::Name(name.to_string()));
        }
        if !is_valid_tag(tag) {
            return Err(RefError::Tag(tag.to_string()));
        }
        Ok(Self {
            registry: registry.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Same repository, different tag.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        Self::new(&self.registry, &self.name, tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.name, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = RefError;

    /// Parses `host[:port]/name[:tag]`. The registry host is mandatory and the
    /// tag defaults to `latest`. Digest references are not accepted.
    fn from_str(s: &str) -> Result<Self> {
        if s.contains('@') {
            return Err(RefError::Reference(s.to_string()));
        }
        let (registry, rest) = s
            .split_once('/')
            .ok_or_else(|| RefError::Reference(s.to_string()))?;
        let looks_like_host =
            registry.contains('.') || registry.contains(':') || registry == "localhost";
        if !looks_like_host {
            return Err(RefError::Reference(s.to_string()));
        }
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (&rest[..last_slash + i], &rest[last_slash + i + 1..]),
            None => (rest, "latest"),
        };
        Self::new(registry, name, tag)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = RefError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ImageReference> for String {
    fn from(r: ImageReference) -> Self {
        r.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_repository_names() {
        for name in [
            "fedora",
            "flightctl/device-os",
            "a/b/c/d",
            "my_image",
            "my__image",
            "my.image",
            "my---image",
            "0a",
        ] {
            assert!(is_valid_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_repository_names() {
        for name in [
            "",
            "INVALID_UPPER",
            "Fedora",
            "with space",
            "trailing/",
            "/leading",
            "double//slash",
            "-dash",
            "dash-",
            "a___b",
            "a._b",
            "image:tag",
            "image@sha256",
            "image;rm -rf /",
            "image\nname",
            "$(whoami)",
        ] {
            assert!(!is_valid_name(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn name_length_is_bounded() {
        let ok = "a".repeat(MAX_NAME_LEN);
        let too_long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(is_valid_name(&ok));
        assert!(!is_valid_name(&too_long));
    }

    #[test]
    fn tag_rules() {
        for tag in ["latest", "v1.2.3", "_hidden", "A-b_c.d", "1.0-", "x."] {
            assert!(is_valid_tag(tag), "{tag} should be valid");
        }
        for tag in ["", "a:b:c", ".dot", "-dash", "with space", "a/b", "v1;ls"] {
            assert!(!is_valid_tag(tag), "{tag:?} should be rejected");
        }
        assert!(is_valid_tag(&"t".repeat(MAX_TAG_LEN)));
        assert!(!is_valid_tag(&"t".repeat(MAX_TAG_LEN + 1)));
    }

    #[test]
    fn parse_and_display() {
        let r: ImageReference = "quay.io/flightctl/device-os:v1".parse().unwrap();
        assert_eq!(r.registry(), "quay.io");
        assert_eq!(r.name(), "flightctl/device-os");
        assert_eq!(r.tag(), "v1");
        assert_eq!(r.to_string(), "quay.io/flightctl/device-os:v1");

        let r: ImageReference = "localhost:5000/os".parse().unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.tag(), "latest");
    }

    #[test]
    fn parse_rejects_refs_without_host_or_with_digest() {
        assert!("fedora:40".parse::<ImageReference>().is_err());
        assert!("library/fedora:40".parse::<ImageReference>().is_err());
        assert!("quay.io/os@sha256:abcd".parse::<ImageReference>().is_err());
        assert!("quay.io/OS:1".parse::<ImageReference>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let r = ImageReference::new("registry.local:5000", "os", "1").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"registry.local:5000/os:1\"");
        let back: ImageReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
