//! OCI and Docker manifest documents.
//!
//! Only the fields the registry needs are modelled: the descriptors a
//! manifest references (which become version parts), the optional subject
//! used by the referrers API, and the media types used to classify the
//! artifact for display.

use serde::{Deserialize, Serialize};

use crate::name::Digest;

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image configuration.
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const DOCKER_PREFIX: &str = "application/vnd.docker.";
const HELM_PREFIX: &str = "application/vnd.cncf.helm.";

/// Errors raised while reading a manifest body.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The body is not a manifest of the declared type.
    #[error("invalid manifest: {0}")]
    Invalid(String),

    /// The media type is not one the registry stores.
    #[error("unsupported manifest type: {0}")]
    Unsupported(String),
}

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Digest of the referenced content.
    pub digest: String,

    /// Size of the referenced content in bytes.
    pub size: i64,

    /// Artifact type, for descriptors in a referrers index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    artifact_type: Option<String>,
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    artifact_type: Option<String>,
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct SubjectPointer {
    subject: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct InlineBlobs {
    #[serde(default)]
    blobs: Option<serde_json::Value>,
}

/// A blob or manifest referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Declared size in bytes.
    pub size: i64,
}

/// The registry's view of a pushed manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    /// Media type of the manifest itself.
    pub media_type: String,
    /// Config, layers or child manifests, in document order.
    pub parts: Vec<Part>,
    /// Declared artifact type, falling back to the config media type.
    pub artifact_type: Option<String>,
}

/// Whether a media type describes a multi-platform index.
pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, OCI_INDEX | DOCKER_MANIFEST_LIST)
}

/// Strip parameters such as `; charset=utf-8` from a content type.
pub fn essence(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

/// Guess the media type from the body when the client did not send one.
pub fn detect_media_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }
        if json.get("manifests").is_some() {
            return OCI_INDEX.to_string();
        }
    }
    OCI_MANIFEST.to_string()
}

/// Parse a manifest body of the given media type.
///
/// The `mediaType` field inside the document, when present, must agree with
/// `media_type`. Every referenced digest must be well formed.
pub fn parse_manifest(media_type: &str, data: &[u8]) -> Result<ParsedManifest, ManifestError> {
    let media_type = essence(media_type);
    let invalid = |err: serde_json::Error| ManifestError::Invalid(err.to_string());

    let (declared, artifact_type, descriptors) = match media_type {
        OCI_INDEX | DOCKER_MANIFEST_LIST => {
            let index: ImageIndex = serde_json::from_slice(data).map_err(invalid)?;
            (index.media_type, index.artifact_type, index.manifests)
        }
        OCI_MANIFEST | DOCKER_MANIFEST => {
            let manifest: ImageManifest = serde_json::from_slice(data).map_err(invalid)?;
            let artifact_type = manifest
                .artifact_type
                .or_else(|| manifest.config.media_type.clone());
            let mut descriptors = Vec::with_capacity(manifest.layers.len() + 1);
            descriptors.push(manifest.config);
            descriptors.extend(manifest.layers);
            (manifest.media_type, artifact_type, descriptors)
        }
        other => return Err(ManifestError::Unsupported(other.to_owned())),
    };

    if let Some(declared) = declared.filter(|declared| declared != media_type) {
        return Err(ManifestError::Invalid(format!(
            "manifest declares media type {declared} but was sent as {media_type}"
        )));
    }

    let parts = descriptors
        .into_iter()
        .map(|descriptor| {
            let digest = Digest::parse(&descriptor.digest)
                .map_err(|err| ManifestError::Invalid(err.to_string()))?;
            if descriptor.size < 0 {
                return Err(ManifestError::Invalid(format!(
                    "negative size for {digest}"
                )));
            }
            Ok(Part {
                digest,
                size: descriptor.size,
            })
        })
        .collect::<Result<_, _>>()?;

    Ok(ParsedManifest {
        media_type: media_type.to_owned(),
        parts,
        artifact_type,
    })
}

/// Reject manifests carrying inline blob data, which the registry does not store.
pub fn reject_inline_blobs(data: &[u8]) -> Result<(), ManifestError> {
    let inline: InlineBlobs =
        serde_json::from_slice(data).map_err(|err| ManifestError::Invalid(err.to_string()))?;
    match inline.blobs {
        None | Some(serde_json::Value::Null) => Ok(()),
        Some(serde_json::Value::Array(blobs)) if blobs.is_empty() => Ok(()),
        Some(_) => Err(ManifestError::Invalid(
            "non-compliant manifest with blobs entry detected".to_owned(),
        )),
    }
}

/// The `subject` descriptor of a manifest, if it declares one.
///
/// Unparseable documents have no subject.
pub fn subject(data: &[u8]) -> Option<Descriptor> {
    serde_json::from_slice::<SubjectPointer>(data)
        .ok()
        .and_then(|pointer| pointer.subject)
}

/// The artifact type of a stored manifest, used by the referrers API.
pub fn artifact_type(media_type: &str, data: &[u8]) -> Option<String> {
    parse_manifest(media_type, data)
        .ok()
        .and_then(|manifest| manifest.artifact_type)
}

/// What kind of artifact a manifest describes, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    /// Any other OCI artifact.
    Generic,
    /// A runnable container image or image index.
    ContainerImage,
    /// A packaged Helm chart.
    HelmChart,
}

impl ManifestKind {
    /// Classify by media types alone.
    pub fn classify(
        content_type: &str,
        config_media_type: Option<&str>,
        layer_media_types: &[&str],
    ) -> Self {
        let content_type = essence(content_type);
        if content_type.starts_with(DOCKER_PREFIX) {
            return ManifestKind::ContainerImage;
        }
        if is_index(content_type) {
            return ManifestKind::Generic;
        }

        let helm = |media_type: &str| media_type.starts_with(HELM_PREFIX);
        if config_media_type.is_some_and(helm) || layer_media_types.iter().any(|m| helm(m)) {
            ManifestKind::HelmChart
        } else if config_media_type == Some(OCI_IMAGE_CONFIG) {
            ManifestKind::ContainerImage
        } else {
            ManifestKind::Generic
        }
    }

    /// Classify a stored manifest, reading its config and layer media types.
    pub fn infer(content_type: &str, data: &[u8]) -> Self {
        if is_index(essence(content_type)) || data.is_empty() {
            return Self::classify(content_type, None, &[]);
        }

        match serde_json::from_slice::<ImageManifest>(data) {
            Ok(manifest) => {
                let layers: Vec<&str> = manifest
                    .layers
                    .iter()
                    .filter_map(|layer| layer.media_type.as_deref())
                    .collect();
                Self::classify(content_type, manifest.config.media_type.as_deref(), &layers)
            }
            Err(_) => Self::classify(content_type, None, &[]),
        }
    }
}
