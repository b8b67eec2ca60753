//! Release component resolution.
//!
//! A release image carries its component manifest as a file,
//! `release-manifests/image-references`: an image-stream document whose
//! tags map logical component names to the pullspecs of the images that
//! compose the release. Resolving a component means extracting that one
//! file from the release image and looking the name up — the same
//! selective extraction used for the artifact itself, pointed at a
//! different image.

use log::{debug, info};
use serde::Deserialize;

use crate::extract::{extract, TraversalPolicy};
use crate::reference::ImageReference;
use crate::registry::BlobSource;
use crate::rules::MatchRule;
use crate::{Error, Result};

const MANIFEST_DIR: &str = "release-manifests";
const MANIFEST_NAME: &str = "image-references";

/// Image source kind for a tag that points directly at a registry image.
const DIRECT_IMAGE_KIND: &str = "DockerImage";

#[derive(Debug, Deserialize)]
struct ImageStream {
    spec: ImageStreamSpec,
}

#[derive(Debug, Deserialize)]
struct ImageStreamSpec {
    #[serde(default)]
    tags: Vec<TagReference>,
}

#[derive(Debug, Deserialize)]
struct TagReference {
    name: String,
    from: Option<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    kind: String,
    name: String,
}

/// Resolve the pullspec registered under `component` in a release image's
/// component manifest.
///
/// Fails with a resolution error when the release has no component
/// manifest, no tag with that name, or a tag whose image source is not a
/// direct registry reference.
pub async fn resolve_component(
    source: &impl BlobSource,
    release: &ImageReference,
    component: &str,
) -> Result<String> {
    let resolution_failed = |reason: String| Error::Resolution {
        release: release.to_string(),
        component: component.to_string(),
        reason,
    };

    let staging = tempfile::tempdir().map_err(|source| Error::Write {
        path: std::env::temp_dir(),
        source,
    })?;

    let rule = MatchRule::new(MANIFEST_DIR, MANIFEST_NAME)?;
    let result = extract(
        staging.path(),
        release,
        &[rule],
        source,
        TraversalPolicy::VisitAll,
    )
    .await?;

    let Some(manifest_path) = result.written(0).first() else {
        return Err(resolution_failed(
            "release image has no component manifest".to_string(),
        ));
    };

    let data = std::fs::read(manifest_path).map_err(|source| Error::Write {
        path: manifest_path.clone(),
        source,
    })?;
    let stream: ImageStream = serde_json::from_slice(&data)
        .map_err(|e| resolution_failed(format!("unparseable component manifest: {e}")))?;
    debug!(
        "component manifest of {release} lists {} tags",
        stream.spec.tags.len()
    );

    let Some(tag) = stream.spec.tags.into_iter().find(|t| t.name == component) else {
        return Err(resolution_failed("no tag with that name".to_string()));
    };

    match tag.from {
        Some(from) if from.kind == DIRECT_IMAGE_KIND && !from.name.is_empty() => {
            info!("component {component} of {release} is {}", from.name);
            Ok(from.name)
        }
        Some(from) => Err(resolution_failed(format!(
            "tag source is {}, not a direct registry reference",
            from.kind
        ))),
        None => Err(resolution_failed("tag has no image source".to_string())),
    }
}
