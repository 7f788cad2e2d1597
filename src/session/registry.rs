//! The registry of issued client identifiers and their model grants.

use tokio::sync::Mutex;

use super::{
    store::{Records, RecordStore, StorageResult},
    ClientId,
};

/// The process-wide session registry.
///
/// The records live in memory behind one lock and are written through to the [`RecordStore`]
/// after every change, so the stored table is never more than one operation stale. A failed save
/// is logged and leaves the in-memory records authoritative: the whole table is rewritten by the
/// next save.
pub struct Registry {
    records: Mutex<Records>,
    store: Box<dyn RecordStore>,
}

impl Registry {
    /// Creates a registry initialized from the records held by `store`.
    ///
    /// # Errors
    /// Fails if the store cannot be read.
    pub async fn new<S: RecordStore>(store: S) -> StorageResult<Self> {
        let records = store.load().await?;
        info!("restored the records of {} clients", records.len());
        Ok(Self {
            records: Mutex::new(records),
            store: Box::new(store),
        })
    }

    /// Generates a fresh identifier and creates its empty record.
    pub async fn issue_identifier(&self) -> ClientId {
        let mut records = self.records.lock().await;
        let id = loop {
            let id = ClientId::new();
            if !records.contains_key(&id) {
                break id;
            }
        };
        records.insert(id, Default::default());
        self.write_through(&records).await;
        id
    }

    pub async fn is_client_registered(&self, id: &ClientId) -> bool {
        self.records.lock().await.contains_key(id)
    }

    pub async fn is_model_registered(&self, model: &str, id: &ClientId) -> bool {
        self.records
            .lock()
            .await
            .get(id)
            .map(|models| models.contains(model))
            .unwrap_or(false)
    }

    /// Grants `model` to the client. Granting twice has no further effect.
    pub async fn register_model_to_client(&self, model: &str, id: &ClientId) {
        let mut records = self.records.lock().await;
        if records.entry(*id).or_default().insert(model.to_string()) {
            self.write_through(&records).await;
        }
    }

    /// Revokes the grant of `model` and returns whether it existed.
    pub async fn remove_model_for_client(&self, model: &str, id: &ClientId) -> bool {
        let mut records = self.records.lock().await;
        let removed = records
            .get_mut(id)
            .map(|models| models.remove(model))
            .unwrap_or(false);
        if removed {
            self.write_through(&records).await;
        }
        removed
    }

    /// Forgets the client and all its grants and returns whether it was registered.
    pub async fn remove_client(&self, id: &ClientId) -> bool {
        let mut records = self.records.lock().await;
        let removed = records.remove(id).is_some();
        if removed {
            self.write_through(&records).await;
        }
        removed
    }

    /// Writes the full records to the store.
    ///
    /// # Errors
    /// Fails if the store cannot be written.
    pub async fn save(&self) -> StorageResult<()> {
        let records = self.records.lock().await;
        self.store.save(&records).await
    }

    async fn write_through(&self, records: &Records) {
        if let Err(err) = self.store.save(records).await {
            error!("failed to save the client records: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::*;
    use crate::session::store::{FlatFileStore, NoopStore};

    /// Counts the saves.
    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl RecordStore for Counting {
        async fn load(&self) -> StorageResult<Records> {
            Ok(Records::new())
        }

        async fn save(&self, _records: &Records) -> StorageResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_identifiers_are_distinct() {
        let registry = Registry::new(NoopStore).await.unwrap();
        let first = registry.issue_identifier().await;
        let second = registry.issue_identifier().await;
        assert_ne!(first, second);
        assert!(registry.is_client_registered(&first).await);
        assert!(registry.is_client_registered(&second).await);
        assert!(!registry.is_client_registered(&ClientId::new()).await);
    }

    #[tokio::test]
    async fn test_grants() {
        let registry = Registry::new(NoopStore).await.unwrap();
        let id = registry.issue_identifier().await;
        assert!(!registry.is_model_registered("mnist", &id).await);

        registry.register_model_to_client("mnist", &id).await;
        registry.register_model_to_client("mnist", &id).await;
        assert!(registry.is_model_registered("mnist", &id).await);

        assert!(registry.remove_model_for_client("mnist", &id).await);
        assert!(!registry.remove_model_for_client("mnist", &id).await);
        assert!(!registry.is_model_registered("mnist", &id).await);
        // the client outlives its last grant
        assert!(registry.is_client_registered(&id).await);

        registry.register_model_to_client("cifar", &id).await;
        assert!(registry.remove_client(&id).await);
        assert!(!registry.is_client_registered(&id).await);
        assert!(!registry.is_model_registered("cifar", &id).await);
    }

    #[tokio::test]
    async fn test_every_change_is_saved() {
        let saves = Counting::default();
        let registry = Registry::new(saves.clone()).await.unwrap();

        let id = registry.issue_identifier().await;
        registry.register_model_to_client("mnist", &id).await;
        // no change
        registry.register_model_to_client("mnist", &id).await;
        registry.remove_model_for_client("mnist", &id).await;
        registry.remove_client(&id).await;
        assert_eq!(saves.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_save_rewrites_the_table() {
        let path = env::temp_dir().join(format!("fedhub-registry-{}.txt", ClientId::new()));
        let registry = Registry::new(FlatFileStore::new(&path)).await.unwrap();
        let id = registry.issue_identifier().await;
        registry.register_model_to_client("mnist", &id).await;

        tokio::fs::write(&path, b"stale contents\n").await.unwrap();
        registry.save().await.unwrap();
        let table = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(table, format!("{} mnist\n", id));
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let dir = env::temp_dir().join(format!("fedhub-registry-{}", ClientId::new()));
        let registry = Registry::new(FlatFileStore::new(dir.join("missing").join("records.txt")))
            .await
            .unwrap();
        let id = registry.issue_identifier().await;
        registry.register_model_to_client("mnist", &id).await;
        assert!(registry.save().await.is_err());
        // the in-memory records stay authoritative
        assert!(registry.is_model_registered("mnist", &id).await);
    }

    #[tokio::test]
    async fn test_grants_survive_restart() {
        let path = env::temp_dir().join(format!("fedhub-registry-{}.txt", ClientId::new()));
        let registry = Registry::new(FlatFileStore::new(&path)).await.unwrap();
        let kept = registry.issue_identifier().await;
        let dropped = registry.issue_identifier().await;
        registry.register_model_to_client("mnist", &kept).await;

        let restored = Registry::new(FlatFileStore::new(&path)).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(restored.is_model_registered("mnist", &kept).await);
        assert!(!restored.is_client_registered(&dropped).await);
    }
}
