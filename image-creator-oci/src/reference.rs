use std::fmt;

use crate::error::{OciError, Result};

/// Registry host used for Docker Hub references.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Tag applied when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_TRANSPORT: &str = "docker://";

/// Transport prefixes understood by other image tools that we cannot pull from.
const FOREIGN_TRANSPORTS: &[&str] = &[
    "oci:",
    "oci-archive:",
    "docker-archive:",
    "docker-daemon:",
    "dir:",
    "containers-storage:",
];

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Explicit tag, if the reference carried one.
    pub tag: Option<String>,
    /// Explicit digest (e.g. "sha256:abc123"), if the reference carried one.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference that may carry a `docker://` transport prefix.
    ///
    /// Bare references are registry references.  Any other transport prefix
    /// is rejected.
    pub fn parse_transport(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix(DOCKER_TRANSPORT) {
            return Self::parse(rest);
        }
        if trimmed.contains("://") || FOREIGN_TRANSPORTS.iter().any(|p| trimmed.starts_with(p)) {
            return Err(OciError::UnsupportedTransport(trimmed.to_string()));
        }
        Self::parse(trimmed)
    }

    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `localhost:5000/repo:tag@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::invalid_reference(raw, "empty image reference"));
        }

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                validate_digest(raw, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A tag colon always comes after the last '/', so "localhost:5000/repo"
        // is not mistaken for a tagged name.
        let after_last_slash = name_and_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match name_and_tag.rfind(':') {
            Some(colon_pos) if colon_pos >= after_last_slash => {
                let tag = &name_and_tag[colon_pos + 1..];
                validate_tag(raw, tag)?;
                (&name_and_tag[..colon_pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        // A leading component is a registry hostname when it contains a dot
        // or a port, or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (normalize_registry(first), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name_part.to_string()),
        };

        // Docker Hub official images live under "library/".
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        validate_repository(raw, &repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference sent to the registry: digest first, then tag, then `latest`.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Short repository name as users write it (`alpine`, `ghcr.io/org/app`).
    pub fn familiar_name(&self) -> String {
        if self.registry == DOCKER_HUB_REGISTRY {
            match self.repository.strip_prefix("library/") {
                Some(name) if !name.contains('/') => name.to_string(),
                _ => self.repository.clone(),
            }
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// `repository:tag` in familiar form, with `latest` when no tag was given.
    ///
    /// Digest-only references also get `latest`; the digest is not part of a
    /// docker-archive tag.
    pub fn tagged_name(&self) -> String {
        format!(
            "{}:{}",
            self.familiar_name(),
            self.tag.as_deref().unwrap_or(DEFAULT_TAG)
        )
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

fn validate_repository(raw: &str, repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(OciError::invalid_reference(raw, "missing repository name"));
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(OciError::invalid_reference(raw, "empty path component"));
        }
        if component.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(OciError::invalid_reference(
                raw,
                "repository name must be lowercase",
            ));
        }
        let valid = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));
        let bounded = component
            .chars()
            .next()
            .zip(component.chars().last())
            .is_some_and(|(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric());
        if !valid || !bounded {
            return Err(OciError::invalid_reference(
                raw,
                format!("invalid repository component {:?}", component),
            ));
        }
    }
    Ok(())
}

fn validate_tag(raw: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if !first_ok || !rest_ok || tag.len() > 128 {
        return Err(OciError::invalid_reference(
            raw,
            format!("invalid tag {:?}", tag),
        ));
    }
    Ok(())
}

fn validate_digest(raw: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algo, hex))
            if !algo.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(OciError::invalid_reference(
            raw,
            format!("invalid digest {:?}", digest),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
