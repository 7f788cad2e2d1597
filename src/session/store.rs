//! Persistence of the client records.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::PathBuf,
};

use super::ClientId;

/// The result of a storage operation.
pub type StorageResult<T> = anyhow::Result<T>;

/// The model grants of every registered client.
pub type Records = BTreeMap<ClientId, BTreeSet<String>>;

#[async_trait]
/// A backend holding the client records between restarts.
pub trait RecordStore
where
    Self: Send + Sync + 'static,
{
    /// Loads the records. A backend that has never been written to yields no records.
    async fn load(&self) -> StorageResult<Records>;

    /// Replaces the stored records with `records`.
    async fn save(&self, records: &Records) -> StorageResult<()>;
}

/// A flat text table with one `<client id> <model name>` pair per line.
///
/// Clients without grants have no line, so they are not restored after a restart.
#[derive(Debug, Clone)]
pub struct FlatFileStore {
    path: PathBuf,
}

impl FlatFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str) -> Option<(ClientId, String)> {
    let mut fields = line.split_whitespace();
    let id = fields.next()?.parse().ok()?;
    let model = fields.next()?;
    match fields.next() {
        None => Some((id, model.to_string())),
        Some(_) => None,
    }
}

#[async_trait]
impl RecordStore for FlatFileStore {
    async fn load(&self) -> StorageResult<Records> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no client records at {}", self.path.display());
                return Ok(Records::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut records = Records::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some((id, model)) => {
                    records.entry(id).or_default().insert(model);
                }
                None => warn!(
                    "skipping malformed client record at {}:{}",
                    self.path.display(),
                    number + 1
                ),
            }
        }
        Ok(records)
    }

    async fn save(&self, records: &Records) -> StorageResult<()> {
        let mut contents = String::new();
        for (id, models) in records {
            for model in models {
                contents.push_str(&format!("{} {}\n", id, model));
            }
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

/// A store that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl RecordStore for NoopStore {
    async fn load(&self) -> StorageResult<Records> {
        Ok(Records::new())
    }

    async fn save(&self, _records: &Records) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    fn temp_path() -> PathBuf {
        env::temp_dir().join(format!("fedhub-records-{}.txt", ClientId::new()))
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let store = FlatFileStore::new(temp_path());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let path = temp_path();
        let store = FlatFileStore::new(&path);
        let (alice, bob, carol) = (ClientId::new(), ClientId::new(), ClientId::new());

        let mut records = Records::new();
        records.insert(alice, vec!["mnist".to_string(), "cifar".to_string()].into_iter().collect());
        records.insert(bob, vec!["mnist".to_string()].into_iter().collect());
        records.insert(carol, BTreeSet::new());
        store.save(&records).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains(&format!("{} mnist\n", bob)));

        let loaded = store.load().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        records.remove(&carol);
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let path = temp_path();
        let id = ClientId::new();
        tokio::fs::write(
            &path,
            format!("garbage mnist\n{} mnist\n\n{}\n{} a b\n", id, id, id),
        )
        .await
        .unwrap();

        let loaded = FlatFileStore::new(&path).load().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[&id].contains("mnist"));
    }
}
