//! Shared service state

use keyward_core::{
    KeyStore, KeyringService, KeywardConfig, Result, RotationEngine, ShareService,
};
use std::sync::Arc;

/// Services built over one store
pub struct WorkerState<S: KeyStore> {
    pub config: KeywardConfig,
    pub store: Arc<S>,
    pub keyring: KeyringService<S>,
    pub shares: ShareService<S>,
    pub rotations: RotationEngine<S>,
}

impl<S: KeyStore> WorkerState<S> {
    /// Build the services; must run inside a Tokio runtime
    pub fn new(store: Arc<S>, config: KeywardConfig) -> Result<Self> {
        Ok(Self {
            keyring: KeyringService::new(Arc::clone(&store), &config),
            shares: ShareService::new(Arc::clone(&store), &config)?,
            rotations: RotationEngine::spawn(Arc::clone(&store), &config),
            store,
            config,
        })
    }
}
