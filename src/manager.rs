use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::archive::{ArchiveExtractor, TarExtractor};
use crate::codec::{PatchCodec, ZstdDeltaCodec};
use crate::config::Config;
use crate::download;
use crate::error::{Result, UpdateError};
use crate::generation::{ActiveGeneration, GenerationStore};
use crate::install;
use crate::remote::RemoteClient;
use crate::rollback;

/// Everything the updater knows about versions, owned by one [`UpdateManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerState {
    /// Version the host is running: the active generation's, or the bundled one if higher.
    pub current_version: u32,
    /// Last version seen on the server (check, download or install).
    pub remote_version: u32,
    pub active: Option<ActiveGeneration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub current_version: u32,
    pub remote_version: u32,
    pub active: Option<ActiveGeneration>,
    /// `Temp` holds a downloaded patch waiting for install.
    pub temp_ready: bool,
}

pub struct UpdateManager {
    store: GenerationStore,
    remote: Option<RemoteClient>,
    codec: Arc<dyn PatchCodec>,
    extractor: Arc<dyn ArchiveExtractor>,
    bundled_version: u32,
    chunk_size: usize,
    state: ManagerState,
}

impl UpdateManager {
    /// Set up the store for this host build and resolve the active generation.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let stamp = config.resolve_install_stamp();
        std::fs::create_dir_all(&config.storage_root)
            .map_err(|e| UpdateError::storage(&config.storage_root, e))?;
        let store = GenerationStore::new(&config.storage_root, stamp, &config.bundle_name);
        store.prune_stale();

        let remote = config
            .server_uri
            .as_deref()
            .map(|uri| RemoteClient::new(uri, &config.platform, config.timeout()))
            .transpose()?;

        let mut manager = Self {
            store,
            remote,
            codec: Arc::new(ZstdDeltaCodec),
            extractor: Arc::new(TarExtractor),
            bundled_version: config.bundled_version,
            chunk_size: config.chunk_size,
            state: ManagerState::default(),
        };
        manager.refresh();
        info!(
            root = %config.storage_root.display(),
            stamp = manager.store.stamp(),
            version = manager.state.current_version,
            "update manager ready"
        );
        Ok(manager)
    }

    pub fn with_codec(mut self, codec: Arc<dyn PatchCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn state(&self) -> &ManagerState {
        &self.state
    }

    pub fn store(&self) -> &GenerationStore {
        &self.store
    }

    /// Bundle the host should load, or `None` for its own bundled asset.
    pub fn bundle_path(&self) -> Option<&Path> {
        self.state.active.as_ref().map(|a| a.bundle.as_path())
    }

    /// Re-resolve the active generation and recompute the current version.
    pub fn refresh(&mut self) -> Option<&ActiveGeneration> {
        self.state.active = self.store.resolve_active();
        let installed = self.state.active.as_ref().map_or(0, |a| a.version);
        self.state.current_version = installed.max(self.bundled_version);
        self.state.active.as_ref()
    }

    fn remote(&self) -> Result<&RemoteClient> {
        self.remote
            .as_ref()
            .ok_or_else(|| UpdateError::Config("a server URI to download patches from is required".into()))
    }

    fn patch_url(&self) -> Result<String> {
        let installed = self.state.active.as_ref().map(|a| a.version);
        Ok(self.remote()?.patch_url(installed))
    }

    /// Probe the newest published version. Touches no files.
    pub async fn check_for_update(&mut self) -> Result<u32> {
        let url = self.patch_url()?;
        let version = self.remote()?.fetch_version(&url).await?;
        self.state.remote_version = version;
        if version <= self.state.current_version {
            return Err(UpdateError::Stale {
                remote: version,
                local: self.state.current_version,
            });
        }
        Ok(version)
    }

    pub async fn download_patch<F>(&mut self, on_progress: F) -> Result<u32>
    where
        F: FnMut(u64, u64),
    {
        let url = self.patch_url()?;
        let version = download::download_patch(
            self.remote()?,
            &self.store,
            &url,
            self.state.current_version,
            self.chunk_size,
            on_progress,
        )
        .await?;
        self.state.remote_version = version;
        Ok(version)
    }

    /// The new version is adopted only after promotion succeeded.
    pub async fn install_patch(&mut self) -> Result<u32> {
        let version = install::install_patch(
            self.store.clone(),
            self.state.active.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.extractor),
        )
        .await?;

        self.state.remote_version = version;
        let resolved = self.refresh().map(|a| a.version);
        if resolved != Some(version) {
            warn!(version, ?resolved, "installed generation did not resolve as active");
        }
        Ok(version)
    }

    /// Called by the host's crash handler when the loaded bundle is suspect.
    ///
    /// `Err(NoActiveGeneration)` if no patch is active (the host's bundled asset has
    /// nothing to roll back to). `Ok(false)` if the demotion failed.
    pub fn rollback(&mut self) -> Result<bool> {
        let active = self.state.active.clone().ok_or(UpdateError::NoActiveGeneration)?;
        if !rollback::rollback(&self.store, &active) {
            return Ok(false);
        }
        self.refresh();
        Ok(true)
    }

    pub fn status(&self) -> Status {
        Status {
            current_version: self.state.current_version,
            remote_version: self.state.remote_version,
            active: self.state.active.clone(),
            temp_ready: self.store.temp_ready(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::generation::GenerationKind;
    use crate::patch_format::PatchMeta;

    fn config(root: &Path) -> Config {
        Config {
            storage_root: root.to_path_buf(),
            install_stamp: Some("42".into()),
            ..Config::default()
        }
    }

    fn populate(store: &GenerationStore, kind: GenerationKind, version: u32) {
        std::fs::create_dir_all(store.dir(kind)).unwrap();
        PatchMeta::seal(version, b"").save(&store.meta_file(kind)).unwrap();
        std::fs::write(store.bundle_file(kind), b"bundle").unwrap();
    }

    #[test]
    fn test_open_without_patches_uses_bundled_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.bundled_version = 3;
        let manager = UpdateManager::open(&cfg).unwrap();
        assert_eq!(manager.state().current_version, 3);
        assert_eq!(manager.bundle_path(), None);
    }

    #[test]
    fn test_open_picks_up_installed_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let store = GenerationStore::new(dir.path(), "42", "main.jsbundle");
        populate(&store, GenerationKind::Newest, 6);

        let manager = UpdateManager::open(&cfg).unwrap();
        assert_eq!(manager.state().current_version, 6);
        assert_eq!(manager.bundle_path(), Some(store.bundle_file(GenerationKind::Newest).as_path()));
    }

    #[test]
    fn test_rollback_requires_active_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = UpdateManager::open(&config(dir.path())).unwrap();
        assert!(matches!(manager.rollback(), Err(UpdateError::NoActiveGeneration)));
    }

    #[test]
    fn test_rollback_when_directory_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(dir.path(), "42", "main.jsbundle");
        populate(&store, GenerationKind::Newest, 6);
        let mut manager = UpdateManager::open(&config(dir.path())).unwrap();

        std::fs::remove_dir_all(store.dir(GenerationKind::Newest)).unwrap();
        assert!(manager.rollback().unwrap());
        assert_eq!(manager.state().active, None);
    }

    #[test]
    fn test_rollback_reports_failed_demotion() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = UpdateManager::open(&config(dir.path())).unwrap();

        // The kernel refuses to rename a path ending in `..`.
        std::fs::create_dir_all(dir.path().join("newest_patch/held")).unwrap();
        let store = GenerationStore::new(dir.path(), "held/..", "main.jsbundle");
        populate(&store, GenerationKind::Newest, 6);
        manager.store = store;
        let before = manager.refresh().cloned();
        assert_eq!(before.as_ref().map(|a| a.version), Some(6));

        assert!(!manager.rollback().unwrap());
        assert_eq!(manager.state().active, before);
        assert_eq!(manager.state().current_version, 6);
        assert_eq!(manager.refresh().cloned(), before);
    }

    struct PanickingCodec;

    impl PatchCodec for PanickingCodec {
        fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            panic!("decoder bug");
        }

        fn apply_patch(&self, _base: &[u8], _delta: &[u8]) -> Result<Vec<u8>> {
            panic!("decoder bug");
        }
    }

    #[tokio::test]
    async fn test_install_panic_is_not_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = UpdateManager::open(&config(dir.path()))
            .unwrap()
            .with_codec(Arc::new(PanickingCodec));

        let body = b"compressed archive";
        manager.store().reset_temp().unwrap();
        PatchMeta::seal(3, body)
            .save(&manager.store().meta_file(GenerationKind::Temp))
            .unwrap();
        std::fs::write(manager.store().data_file(GenerationKind::Temp), body).unwrap();

        let err = manager.install_patch().await.unwrap_err();
        assert!(matches!(err, UpdateError::Worker(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(manager.state().active, None);
    }

    #[tokio::test]
    async fn test_network_commands_need_server_uri() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = UpdateManager::open(&config(dir.path())).unwrap();
        assert!(matches!(manager.check_for_update().await, Err(UpdateError::Config(_))));
        assert!(matches!(
            manager.download_patch(|_, _| {}).await,
            Err(UpdateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_install_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = UpdateManager::open(&config(dir.path())).unwrap();
        assert!(matches!(manager.install_patch().await, Err(UpdateError::NoPatchFound(_))));
    }
}
