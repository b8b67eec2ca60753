//! Registry mirror fallback policy.
//!
//! An image-content-source-policy file maps a source repository location to
//! an ordered list of mirror locations. When a registry operation fails, the
//! same operation is attempted against each mirror in turn; the original
//! location is always tried first.

use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::reference::ImageReference;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct PolicyFile {
    spec: PolicySpec,
}

#[derive(Debug, Deserialize)]
struct PolicySpec {
    #[serde(rename = "repositoryDigestMirrors", default)]
    repository_digest_mirrors: Vec<MirrorRule>,
}

/// One source-to-mirrors mapping from the policy file.
#[derive(Debug, Clone, Deserialize)]
struct MirrorRule {
    /// Repository location prefix the rule applies to, e.g. `quay.io/org`.
    source: String,
    /// Alternate locations to substitute for the source prefix, in order.
    #[serde(default)]
    mirrors: Vec<String>,
}

/// Ordered mirror rules for rewriting image references on failure.
#[derive(Debug, Default)]
pub struct MirrorPolicy {
    rules: Vec<MirrorRule>,
}

impl MirrorPolicy {
    /// A policy with no rules: every reference has itself as the only
    /// candidate.
    pub fn empty() -> Self {
        MirrorPolicy::default()
    }

    /// Load a policy from a YAML image-content-source-policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let failed = |reason: String| Error::Config {
            path: path.to_path_buf(),
            reason,
        };

        let data = std::fs::read(path).map_err(|e| failed(e.to_string()))?;
        let policy: PolicyFile = serde_yaml::from_slice(&data).map_err(|e| failed(e.to_string()))?;

        let rules = policy.spec.repository_digest_mirrors;
        debug!("loaded {} mirror rules", rules.len());
        Ok(MirrorPolicy { rules })
    }

    /// The ordered list of locations to try for an image: the reference
    /// itself first, then every applicable mirror rewrite.
    ///
    /// A rule applies when its source is a component-boundary prefix of
    /// `registry/repository`; the matched prefix is replaced by each mirror
    /// location in turn, keeping the tag or digest.
    pub fn candidates(&self, image: &ImageReference) -> Vec<ImageReference> {
        let mut candidates = vec![image.clone()];
        let location = format!("{}/{}", image.registry, image.repository);

        for rule in &self.rules {
            let Some(rest) = strip_location_prefix(&location, &rule.source) else {
                continue;
            };
            for mirror in &rule.mirrors {
                let rewritten = format!("{}{}", mirror, rest);
                let Some((registry, repository)) = rewritten.split_once('/') else {
                    // A mirror that is a bare registry only makes sense when
                    // the source matched the whole location.
                    continue;
                };
                let candidate = ImageReference {
                    registry: registry.to_string(),
                    repository: repository.to_string(),
                    tag: image.tag.clone(),
                    digest: image.digest.clone(),
                };
                if !candidates.contains(&candidate) {
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }
}

/// Strip `prefix` from `location` on a path-component boundary, returning
/// the remainder (empty or starting with '/').
fn strip_location_prefix<'a>(location: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = location.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy_from_yaml(yaml: &str) -> MirrorPolicy {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), yaml).unwrap();
        MirrorPolicy::load(file.path()).unwrap()
    }

    const POLICY: &str = "
apiVersion: operator.openshift.io/v1alpha1
kind: ImageContentSourcePolicy
spec:
  repositoryDigestMirrors:
    - source: registry.example/org
      mirrors:
        - mirror-a.example/cache/org
        - mirror-b.example/org
    - source: quay.io
      mirrors:
        - quay-mirror.example
";

    #[test]
    fn test_candidates_original_first() {
        let policy = policy_from_yaml(POLICY);
        let image = ImageReference::parse("registry.example/org/widget@sha256:deadbeef").unwrap();
        let candidates = policy.candidates(&image);

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], image);
        assert_eq!(
            candidates[1].to_string(),
            "mirror-a.example/cache/org/widget@sha256:deadbeef"
        );
        assert_eq!(
            candidates[2].to_string(),
            "mirror-b.example/org/widget@sha256:deadbeef"
        );
    }

    #[test]
    fn test_registry_wide_rule() {
        let policy = policy_from_yaml(POLICY);
        let image = ImageReference::parse("quay.io/other/thing:1").unwrap();
        let candidates = policy.candidates(&image);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].to_string(), "quay-mirror.example/other/thing:1");
    }

    #[test]
    fn test_prefix_respects_component_boundary() {
        let policy = policy_from_yaml(
            "
spec:
  repositoryDigestMirrors:
    - source: registry.example/or
      mirrors:
        - mirror.example/or
",
        );
        let image = ImageReference::parse("registry.example/org/widget:1").unwrap();
        assert_eq!(policy.candidates(&image).len(), 1);
    }

    #[test]
    fn test_no_rules() {
        let image = ImageReference::parse("registry.example/org/widget:1").unwrap();
        let candidates = MirrorPolicy::empty().candidates(&image);
        assert_eq!(candidates, vec![image]);
    }

    #[test]
    fn test_unreadable_policy_is_an_error() {
        assert!(matches!(
            MirrorPolicy::load(Path::new("/nonexistent/icsp.yaml")),
            Err(Error::Config { .. })
        ));
    }
}
