//! Container image reference parsing.
//!
//! An [`ImageReference`] identifies an image by registry host, repository
//! path, and exactly one of a tag or a content digest. References that carry
//! both (`repo:tag@sha256:...`) keep only the digest, since that is what the
//! registry will be asked for.

use oci_distribution::Reference;

use crate::{Error, Result};

const DEFAULT_TAG: &str = "latest";

/// Parsed identity of a container image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port (e.g. `quay.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path below the registry (e.g. `org/widget`).
    pub repository: String,
    /// Tag, when the reference is not pinned by digest.
    pub tag: Option<String>,
    /// Content digest (`sha256:...`), when pinned.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a pullspec string.
    ///
    /// The registry part is required: a reference like `org/widget:1.0` with
    /// no registry host is rejected rather than silently defaulted, because
    /// release manifests always carry fully-qualified pullspecs.
    pub fn parse(reference: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::Reference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let spec = reference.trim();
        if spec.is_empty() {
            return Err(malformed("empty reference"));
        }

        // Digest first: everything after the last '@'.
        let (remainder, digest) = match spec.rsplit_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') || digest.ends_with(':') {
                    return Err(malformed("digest must have the form algorithm:hex"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (spec, None),
        };

        // Tag: a ':' after the last '/' (a ':' before it is a registry port).
        let last_slash = remainder.rfind('/');
        let (name, tag) = match remainder.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => (
                &remainder[..colon],
                Some(remainder[colon + 1..].to_string()),
            ),
            _ => (remainder, None),
        };

        let Some((registry, repository)) = name.split_once('/') else {
            return Err(malformed("missing registry host"));
        };
        if registry.is_empty() || repository.is_empty() || repository.ends_with('/') {
            return Err(malformed("empty registry or repository component"));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(malformed("empty tag"));
            }
        }

        // Exactly one of tag/digest survives parsing; the digest pins the
        // content, so it wins over a tag given alongside it.
        let tag = match digest {
            Some(_) => None,
            None => Some(tag.unwrap_or_else(|| DEFAULT_TAG.to_string())),
        };

        Ok(ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    pub(crate) fn to_oci(&self) -> Reference {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => Reference::with_digest(
                self.registry.clone(),
                self.repository.clone(),
                digest.clone(),
            ),
            (None, Some(tag)) => {
                Reference::with_tag(self.registry.clone(), self.repository.clone(), tag.clone())
            }
            (None, None) => Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                DEFAULT_TAG.to_string(),
            ),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
