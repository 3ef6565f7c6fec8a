//! Registry client used by the metadata backend, the blob reconciler and
//! the publish driver.
//!
//! Wraps the `oci-distribution` client with the transport policy the
//! mirror needs: optional plain HTTP and disabled TLS verification for
//! disconnected registries, short connect timeouts, and credential lookup
//! from the Docker client config.

use std::time::Duration;

use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{self, OciImageIndex, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tokio_util::sync::CancellationToken;

use setmirror_core::error::{MirrorError, Result};
use setmirror_core::reference::ImageReference;

use crate::credentials::CredentialStore;

/// Connect timeout kept short so unreachable registries fail fast.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for blob and manifest transfers.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Look up credentials for `registry` in the Docker client config.
    /// Falls back to anonymous when the config has no entry.
    pub fn from_credential_store(registry: &str) -> Self {
        let creds = CredentialStore::default_path()
            .and_then(|store| store.get(registry).ok())
            .flatten();
        match creds {
            Some((username, password)) => Self::basic(username, password),
            None => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry client with the mirror's transport policy applied.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    /// Create a client. `insecure` enables plain HTTP and disables TLS
    /// verification.
    pub fn new(insecure: bool, auth: RegistryAuth) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: insecure,
            connect_timeout: Some(CONNECT_TIMEOUT),
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Fetch a manifest and its digest.
    pub async fn pull_manifest(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
    ) -> Result<(OciManifest, String)> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        race(ctx, self.client.pull_manifest(&oci_ref, &auth))
            .await?
            .map_err(|e| registry_error(reference, e))
    }

    /// Fetch one blob into memory.
    pub async fn fetch_blob(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let descriptor = manifest::OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::new();
        race(
            ctx,
            self.client.pull_blob(&oci_ref, &descriptor, &mut data),
        )
        .await?
        .map_err(|e| registry_error(reference, e))?;
        Ok(data)
    }

    /// Pull an image's layers (used to export the metadata image).
    pub async fn pull_layers(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
    ) -> Result<Vec<ImageLayer>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        let accepted = vec![
            manifest::IMAGE_LAYER_MEDIA_TYPE,
            manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
            manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
            manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
        ];
        let image = race(ctx, self.client.pull(&oci_ref, &auth, accepted))
            .await?
            .map_err(|e| registry_error(reference, e))?;
        Ok(image.layers)
    }

    /// Push an image assembled from raw layer bytes with an optional
    /// pre-built manifest.
    pub async fn push_image(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        layers: Vec<ImageLayer>,
        config: Config,
        image_manifest: Option<OciImageManifest>,
    ) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        race(
            ctx,
            self.client
                .push(&oci_ref, &layers, config, &auth, image_manifest),
        )
        .await?
        .map_err(|e| registry_error(reference, e))?;
        Ok(())
    }

    /// Push an image index referencing already-pushed child manifests.
    pub async fn push_index(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        index: OciImageIndex,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        race(ctx, self.client.push_manifest_list(&oci_ref, &auth, index))
            .await?
            .map_err(|e| registry_error(reference, e))
    }

    /// Push a single-layer image whose layer is an uncompressed tar built
    /// from `files` (relative path, contents). Used for the metadata image
    /// and the upgrade-graph image.
    pub async fn push_file_image(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        files: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data.as_slice())?;
        }
        let tar_bytes = builder.into_inner()?;

        let layers = vec![ImageLayer {
            data: tar_bytes,
            media_type: manifest::IMAGE_LAYER_MEDIA_TYPE.to_string(),
            annotations: None,
        }];
        let config = Config {
            data: b"{}".to_vec(),
            media_type: manifest::IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            annotations: None,
        };
        self.push_image(ctx, reference, layers, config, None).await
    }

    /// Probe for the existence of a manifest without failing the caller on
    /// registry status codes. The metadata backend maps the outcome onto
    /// its existence sentinel.
    pub async fn probe_manifest(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
    ) -> Result<ManifestProbe> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        match race(ctx, self.client.pull_manifest(&oci_ref, &auth)).await? {
            Ok(_) => Ok(ManifestProbe::Exists),
            Err(err) => Ok(classify_manifest_error(reference, err)),
        }
    }

    /// Probe whether the credentials grant push access. Performs the token
    /// handshake for push scope without uploading anything.
    pub async fn check_push_permission(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
    ) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        race(
            ctx,
            self.client.auth(&oci_ref, &auth, RegistryOperation::Push),
        )
        .await?
        .map_err(|e| registry_error(reference, e))?;
        Ok(())
    }
}

/// Race a registry future against cancellation.
async fn race<T>(
    ctx: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = ctx.cancelled() => Err(MirrorError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Convert a parsed reference into an `oci-distribution` reference.
pub fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    if reference.registry.is_empty() || reference.name.is_empty() {
        return Err(MirrorError::ConfigInvalid(format!(
            "reference {} has no registry or repository",
            reference
        )));
    }
    let repository = reference.repository();
    let oci_ref = if let Some(digest) = &reference.digest {
        Reference::with_digest(reference.registry.clone(), repository, digest.clone())
    } else {
        let tag = reference.tag.clone().unwrap_or_else(|| "latest".to_string());
        Reference::with_tag(reference.registry.clone(), repository, tag)
    };
    Ok(oci_ref)
}

/// Wrap a client error with the reference it concerned.
fn registry_error(reference: &ImageReference, err: OciDistributionError) -> MirrorError {
    MirrorError::RegistryTransport {
        reference: reference.to_string(),
        message: err.to_string(),
    }
}

/// Map a manifest-fetch failure onto the metadata-existence sentinel.
///
/// 404 means the metadata image was never pushed. 401 is ambiguous: some
/// registries answer 401 for repositories that do not exist yet, so the
/// caller is expected to follow up with a push-permission probe before
/// treating it as "not exist".
fn classify_manifest_error(reference: &ImageReference, err: OciDistributionError) -> ManifestProbe {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => ManifestProbe::NotFound,
        OciDistributionError::ServerError { code: 404, .. } => ManifestProbe::NotFound,
        OciDistributionError::ServerError { code: 401, .. } => ManifestProbe::Unauthorized,
        OciDistributionError::UnauthorizedError { .. } => ManifestProbe::Unauthorized,
        err => ManifestProbe::Failed(registry_error(reference, err)),
    }
}

/// Outcome classes of a metadata manifest probe.
#[derive(Debug)]
pub enum ManifestProbe {
    Exists,
    NotFound,
    Unauthorized,
    Failed(MirrorError),
}
