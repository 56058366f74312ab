use std::io::Write as _;
use std::path::Path;

use async_trait::async_trait;
use oci_distribution::{
    client::{ClientConfig, ClientProtocol, ImageData, ImageLayer},
    manifest::{self, ImageIndexEntry, OciImageIndex, OciImageManifest, OciManifest},
    secrets::RegistryAuth,
    Client, Reference,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{docker_config::CredentialResolver, Error, Result};

/// Base image whose entrypoint self-extracts the appended source layer.
pub const DEFAULT_BUNDLE_BASE: &str = "docker.io/mattmoor/kontext:latest";

const IMAGE_MEDIA_TYPES: &[&str] = &[
    manifest::OCI_IMAGE_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_MEDIA_TYPE,
];

const INDEX_MEDIA_TYPES: &[&str] = &[
    manifest::OCI_IMAGE_INDEX_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

/// One child of a composed index: the mutated image plus the descriptor it
/// replaces, so platform/annotation metadata carries forward untouched.
pub struct IndexEntry {
    pub image: ImageData,
    pub descriptor: ImageIndexEntry,
}

/// A re-assembled image index awaiting publication.
pub struct ComposedIndex {
    pub media_type: Option<String>,
    pub annotations: Option<std::collections::HashMap<String, String>>,
    pub entries: Vec<IndexEntry>,
}

/// The registry surface `map` needs. Publishing an index is a single call:
/// the implementation uploads the child manifests it contains as part of
/// that one publication.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> Result<OciManifest>;
    async fn fetch_image(&self, reference: &Reference, auth: &RegistryAuth) -> Result<ImageData>;
    async fn publish_image(
        &self,
        reference: &Reference,
        image: &ImageData,
        auth: &RegistryAuth,
    ) -> Result<String>;
    async fn publish_index(
        &self,
        reference: &Reference,
        index: &ComposedIndex,
        auth: &RegistryAuth,
    ) -> Result<String>;
}

/// Fetches `source`, applies `mutate` to each contained image (once for a
/// plain image, once per child manifest for an index), publishes the result
/// to `target` and returns `<target>@<digest>`.
///
/// Exactly one publish call happens per invocation: the image write path for
/// a plain image, the index write path for an index. Destination credentials
/// are only re-resolved when the target registry differs from the source
/// registry.
pub async fn map<M>(
    client: &dyn RegistryClient,
    credentials: &dyn CredentialResolver,
    source: &Reference,
    target: &Reference,
    mutate: M,
) -> Result<String>
where
    M: Fn(ImageData) -> Result<ImageData> + Send + Sync,
{
    let auth = credentials.resolve(source.registry())?;

    let digest = match client.fetch_manifest(source, &auth).await? {
        OciManifest::Image(image_manifest) => {
            if let Some(media_type) = &image_manifest.media_type {
                if !IMAGE_MEDIA_TYPES.contains(&media_type.as_str()) {
                    return Err(Error::UnsupportedMediaType(media_type.clone()));
                }
            }
            let image = mutate(client.fetch_image(source, &auth).await?)?;
            let auth = target_auth(credentials, source, target, auth)?;
            client.publish_image(target, &image, &auth).await?
        }
        OciManifest::ImageIndex(index) => {
            if let Some(media_type) = &index.media_type {
                if !INDEX_MEDIA_TYPES.contains(&media_type.as_str()) {
                    return Err(Error::UnsupportedMediaType(media_type.clone()));
                }
            }
            let mut entries = Vec::with_capacity(index.manifests.len());
            for descriptor in &index.manifests {
                let child = Reference::with_digest(
                    source.registry().to_string(),
                    source.repository().to_string(),
                    descriptor.digest.clone(),
                );
                let image = mutate(client.fetch_image(&child, &auth).await?)?;
                entries.push(IndexEntry {
                    image,
                    descriptor: descriptor.clone(),
                });
            }
            let composed = ComposedIndex {
                media_type: index.media_type.clone(),
                annotations: index.annotations.clone(),
                entries,
            };
            let auth = target_auth(credentials, source, target, auth)?;
            client.publish_index(target, &composed, &auth).await?
        }
    };

    Ok(format!("{}@{digest}", target.whole()))
}

fn target_auth(
    credentials: &dyn CredentialResolver,
    source: &Reference,
    target: &Reference,
    source_auth: RegistryAuth,
) -> Result<RegistryAuth> {
    if target.registry() == source.registry() {
        // Re-resolution can shell out to a credential helper; skip it when
        // the answer cannot differ.
        Ok(source_auth)
    } else {
        credentials.resolve(target.registry())
    }
}

/// Appends a gzipped layer to an image, recording its uncompressed diff id
/// in the config and rebuilding the manifest to match.
pub fn append_layer(mut image: ImageData, data: Vec<u8>, diff_id: &str) -> Result<ImageData> {
    let mut config: serde_json::Value =
        serde_json::from_slice(&image.config.data).map_err(Error::EncodeImageConfig)?;
    if let Some(diff_ids) = config
        .pointer_mut("/rootfs/diff_ids")
        .and_then(|v| v.as_array_mut())
    {
        diff_ids.push(serde_json::Value::String(diff_id.to_string()));
    }
    image.config.data = serde_json::to_vec(&config).map_err(Error::EncodeImageConfig)?;

    image.layers.push(ImageLayer {
        data,
        media_type: manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE.to_string(),
        annotations: None,
    });

    let annotations = image.manifest.take().and_then(|m| m.annotations);
    image.manifest = Some(OciImageManifest::build(
        &image.layers,
        &image.config,
        annotations,
    ));
    image.digest = None;
    Ok(image)
}

/// `sha256:<hex>` of the given bytes.
pub fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("sha256:{hex}")
}

fn manifest_bytes(manifest: &OciImageManifest) -> Result<Vec<u8>> {
    serde_json::to_vec(manifest).map_err(Error::EncodeImageConfig)
}

fn image_manifest(image: &ImageData) -> OciImageManifest {
    image
        .manifest
        .clone()
        .unwrap_or_else(|| OciImageManifest::build(&image.layers, &image.config, None))
}

/// Production registry client backed by `oci_distribution`.
pub struct OciRegistryClient {
    client: Mutex<Client>,
}

impl OciRegistryClient {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Mutex::new(Client::new(config)),
        }
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> Result<OciManifest> {
        let mut client = self.client.lock().await;
        let (manifest, _) = client.pull_manifest(reference, auth).await?;
        Ok(manifest)
    }

    async fn fetch_image(&self, reference: &Reference, auth: &RegistryAuth) -> Result<ImageData> {
        let mut client = self.client.lock().await;
        Ok(client
            .pull(
                reference,
                auth,
                vec![
                    manifest::IMAGE_LAYER_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                ],
            )
            .await?)
    }

    async fn publish_image(
        &self,
        reference: &Reference,
        image: &ImageData,
        auth: &RegistryAuth,
    ) -> Result<String> {
        let manifest = image_manifest(image);
        let digest = digest_of(&manifest_bytes(&manifest)?);
        let mut client = self.client.lock().await;
        client
            .push(
                reference,
                &image.layers,
                image.config.clone(),
                auth,
                Some(manifest),
            )
            .await?;
        Ok(digest)
    }

    async fn publish_index(
        &self,
        reference: &Reference,
        index: &ComposedIndex,
        auth: &RegistryAuth,
    ) -> Result<String> {
        let mut client = self.client.lock().await;

        let mut manifests = Vec::with_capacity(index.entries.len());
        for entry in &index.entries {
            let manifest = image_manifest(&entry.image);
            let bytes = manifest_bytes(&manifest)?;
            let child_digest = digest_of(&bytes);
            let child = Reference::with_digest(
                reference.registry().to_string(),
                reference.repository().to_string(),
                child_digest.clone(),
            );
            client
                .push(
                    &child,
                    &entry.image.layers,
                    entry.image.config.clone(),
                    auth,
                    Some(manifest),
                )
                .await?;

            let mut descriptor = entry.descriptor.clone();
            descriptor.digest = child_digest;
            descriptor.size = bytes.len() as i64;
            manifests.push(descriptor);
        }

        let composed = OciImageIndex {
            schema_version: 2,
            media_type: index.media_type.clone(),
            manifests,
            annotations: index.annotations.clone(),
        };
        let digest = digest_of(&serde_json::to_vec(&composed).map_err(Error::EncodeImageConfig)?);
        client
            .push_manifest(reference, &OciManifest::ImageIndex(composed))
            .await?;
        Ok(digest)
    }
}

/// Snapshots a local directory into a pushed bundle image, once per
/// resolution pass.
#[async_trait]
pub trait SourceBundler: Send + Sync {
    async fn bundle(&self, directory: &Path) -> Result<String>;
}

pub struct RegistryBundler {
    client: OciRegistryClient,
    credentials: Box<dyn CredentialResolver>,
    base: Reference,
    tag: Reference,
}

impl RegistryBundler {
    pub fn new(base: Reference, tag: Reference, credentials: Box<dyn CredentialResolver>) -> Self {
        Self {
            client: OciRegistryClient::new(),
            credentials,
            base,
            tag,
        }
    }
}

#[async_trait]
impl SourceBundler for RegistryBundler {
    async fn bundle(&self, directory: &Path) -> Result<String> {
        let (data, diff_id) = tarball(directory)?;
        map(
            &self.client,
            self.credentials.as_ref(),
            &self.base,
            &self.tag,
            move |image| append_layer(image, data.clone(), &diff_id),
        )
        .await
    }
}

fn tarball(directory: &Path) -> Result<(Vec<u8>, String)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", directory)?;
    let uncompressed = builder.into_inner()?;
    let diff_id = digest_of(&uncompressed);

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&uncompressed)?;
    let compressed = encoder.finish()?;
    Ok((compressed, diff_id))
}
