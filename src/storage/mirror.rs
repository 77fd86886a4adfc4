use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::MirrorError;
use crate::storage::folder::{validate_id, Folder, ItemId};
use crate::storage::hasher;

type Result<T> = std::result::Result<T, MirrorError>;

/// Where and what `save` wrote.
#[derive(Debug, Clone, Serialize)]
pub struct SavedItem {
    pub location: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Per-path async locks so concurrent callers cannot interleave
/// save/move/delete on the same item. An entry lives only while some caller
/// holds or waits for it.
#[derive(Default)]
struct PathLocks {
    table: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock on one path; releases and prunes its table entry on drop.
struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters clone the slot under this same lock, so a count of one means
        // nobody else can be holding or queued on it.
        if table.get(&self.path).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            table.remove(&self.path);
        }
    }
}

impl PathLocks {
    async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(path.to_path_buf()).or_default().clone()
        };
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
            guard: Some(slot.lock_owned().await),
        }
    }

    /// Lock two paths in a fixed order so opposing moves cannot deadlock.
    async fn lock_pair(&self, a: &Path, b: &Path) -> (PathGuard<'_>, PathGuard<'_>) {
        if a <= b {
            let first = self.lock(a).await;
            (first, self.lock(b).await)
        } else {
            let second = self.lock(b).await;
            (self.lock(a).await, second)
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Durable, folder-scoped store of raw message bytes.
///
/// Layout: `<root>/{inbox,sent,archive}/<ItemId>`, each file holding exactly
/// the bytes passed to [`LocalMirrorStore::save`]. Items are only ever
/// removed by [`LocalMirrorStore::delete`] or relocated by
/// [`LocalMirrorStore::move_item`].
pub struct LocalMirrorStore {
    root: PathBuf,
    locks: PathLocks,
}

impl LocalMirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: PathLocks::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.as_str())
    }

    fn item_path(&self, folder: Folder, id: &ItemId) -> PathBuf {
        self.folder_path(folder).join(id.as_str())
    }

    /// Create the folder directory if it is missing.
    pub async fn ensure_folder(&self, folder: Folder) -> Result<PathBuf> {
        let path = self.folder_path(folder);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| MirrorError::storage(&path, e))?;
        Ok(path)
    }

    /// Same as [`ensure_folder`](Self::ensure_folder) for a caller-supplied
    /// name; unknown names fail before any I/O.
    pub async fn ensure_folder_named(&self, name: &str) -> Result<PathBuf> {
        let folder = name.parse::<Folder>()?;
        self.ensure_folder(folder).await
    }

    /// Write `content` to `(folder, id)`, replacing any previous item.
    ///
    /// Bytes go to a hidden temporary file first and are renamed into place,
    /// so a failed save never leaves a partial item behind.
    pub async fn save(&self, folder: Folder, id: &ItemId, content: &[u8]) -> Result<SavedItem> {
        let dir = self.ensure_folder(folder).await?;
        let path = self.item_path(folder, id);
        let _guard = self.locks.lock(&path).await;

        let tmp = dir.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_synced(&tmp, content).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(MirrorError::storage(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(MirrorError::storage(&path, e));
        }

        let saved = SavedItem {
            location: path,
            sha256: hasher::content_digest(content),
            size: content.len() as u64,
        };
        tracing::debug!(
            "Saved {} to {} ({} bytes, sha256 {})",
            id,
            folder,
            saved.size,
            saved.sha256
        );
        Ok(saved)
    }

    /// Exact bytes previously saved at `(folder, id)`. Always hits storage.
    pub async fn read(&self, folder: Folder, id: &ItemId) -> Result<Vec<u8>> {
        self.ensure_folder(folder).await?;
        let path = self.item_path(folder, id);
        tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_or_storage(e, folder, id, &path))
    }

    /// Relocate an item with a single rename. Never overwrites the target.
    pub async fn move_item(&self, source: Folder, dest: Folder, id: &ItemId) -> Result<PathBuf> {
        self.ensure_folder(source).await?;
        self.ensure_folder(dest).await?;
        let from = self.item_path(source, id);
        let to = self.item_path(dest, id);

        if source == dest {
            let _guard = self.locks.lock(&from).await;
            return Err(if exists(&from).await? {
                MirrorError::AlreadyExists {
                    folder: dest,
                    id: id.to_string(),
                }
            } else {
                MirrorError::NotFound {
                    folder: source,
                    id: id.to_string(),
                }
            });
        }

        let _guards = self.locks.lock_pair(&from, &to).await;

        if !exists(&from).await? {
            return Err(MirrorError::NotFound {
                folder: source,
                id: id.to_string(),
            });
        }
        if exists(&to).await? {
            return Err(MirrorError::AlreadyExists {
                folder: dest,
                id: id.to_string(),
            });
        }

        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| not_found_or_storage(e, source, id, &from))?;

        tracing::debug!("Moved {} from {} to {}", id, source, dest);
        Ok(to)
    }

    /// Item ids in `folder`, sorted. An empty folder yields an empty list.
    pub async fn list(&self, folder: Folder) -> Result<Vec<ItemId>> {
        let dir = self.ensure_folder(folder).await?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| MirrorError::storage(&dir, e))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MirrorError::storage(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| MirrorError::storage(entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            // Skips in-flight `.tmp` files and foreign files alike
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() {
                    ids.push(ItemId::parse(name)?);
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Remove an item irreversibly.
    pub async fn delete(&self, folder: Folder, id: &ItemId) -> Result<()> {
        self.ensure_folder(folder).await?;
        let path = self.item_path(folder, id);
        let _guard = self.locks.lock(&path).await;

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_storage(e, folder, id, &path))?;

        tracing::debug!("Deleted {} from {}", id, folder);
        Ok(())
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| MirrorError::storage(path, e))
}

fn not_found_or_storage(err: std::io::Error, folder: Folder, id: &ItemId, path: &Path) -> MirrorError {
    if err.kind() == ErrorKind::NotFound {
        MirrorError::NotFound {
            folder,
            id: id.to_string(),
        }
    } else {
        MirrorError::storage(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ItemId {
        ItemId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());
        let content = b"From: test@example.com\nSubject: Test\n\nTest content".to_vec();

        let saved = store.save(Folder::Inbox, &id("test1.eml"), &content).await.unwrap();
        assert_eq!(saved.location, dir.path().join("inbox").join("test1.eml"));
        assert_eq!(saved.size, content.len() as u64);
        assert_eq!(saved.sha256, hasher::content_digest(&content));

        let read = store.read(Folder::Inbox, &id("test1.eml")).await.unwrap();
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());

        store.save(Folder::Sent, &id("a.eml"), b"first").await.unwrap();
        store.save(Folder::Sent, &id("a.eml"), b"second").await.unwrap();

        assert_eq!(store.read(Folder::Sent, &id("a.eml")).await.unwrap(), b"second");
        assert_eq!(store.list(Folder::Sent).await.unwrap(), vec![id("a.eml")]);
    }

    #[tokio::test]
    async fn test_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());

        let err = store.read(Folder::Inbox, &id("missing.eml")).await.unwrap_err();
        assert!(matches!(err, MirrorError::NotFound { folder: Folder::Inbox, .. }));
    }

    #[tokio::test]
    async fn test_move_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());
        let item = id("dup.eml");

        store.save(Folder::Inbox, &item, b"inbox copy").await.unwrap();
        store.save(Folder::Archive, &item, b"archived copy").await.unwrap();

        let err = store
            .move_item(Folder::Inbox, Folder::Archive, &item)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::AlreadyExists { folder: Folder::Archive, .. }));

        // Neither side changed
        assert_eq!(store.read(Folder::Inbox, &item).await.unwrap(), b"inbox copy");
        assert_eq!(store.read(Folder::Archive, &item).await.unwrap(), b"archived copy");
    }

    #[tokio::test]
    async fn test_move_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());

        let err = store
            .move_item(Folder::Inbox, Folder::Archive, &id("nonexistent.eml"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::NotFound { folder: Folder::Inbox, .. }));
        assert!(store.list(Folder::Archive).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_moves_of_same_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalMirrorStore::new(dir.path()));
        let item = id("race.eml");
        store.save(Folder::Inbox, &item, b"payload").await.unwrap();

        let a = {
            let (store, item) = (store.clone(), item.clone());
            tokio::spawn(async move { store.move_item(Folder::Inbox, Folder::Archive, &item).await })
        };
        let b = {
            let (store, item) = (store.clone(), item.clone());
            tokio::spawn(async move { store.move_item(Folder::Inbox, Folder::Archive, &item).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(store.list(Folder::Inbox).await.unwrap().is_empty());
        assert_eq!(store.read(Folder::Archive, &item).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());

        assert!(store.list(Folder::Inbox).await.unwrap().is_empty());

        store.save(Folder::Inbox, &id("test2.eml"), b"2").await.unwrap();
        store.save(Folder::Inbox, &id("test1.eml"), b"1").await.unwrap();
        std::fs::write(dir.path().join("inbox").join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("inbox").join(".test3.eml.abc.tmp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("inbox").join("nested.eml")).unwrap();

        let ids = store.list(Folder::Inbox).await.unwrap();
        assert_eq!(ids, vec![id("test1.eml"), id("test2.eml")]);
    }

    #[tokio::test]
    async fn test_list_includes_dot_prefixed_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());
        let item = id(".notes.eml");

        store.save(Folder::Sent, &item, b"hello").await.unwrap();
        assert_eq!(store.read(Folder::Sent, &item).await.unwrap(), b"hello");
        assert_eq!(store.list(Folder::Sent).await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalMirrorStore::new(dir.path()));

        for n in 0..10 {
            let item = id(&format!("m{n}.eml"));
            store.save(Folder::Inbox, &item, b"x").await.unwrap();
            store.move_item(Folder::Inbox, Folder::Archive, &item).await.unwrap();
            store.move_item(Folder::Archive, Folder::Archive, &item).await.unwrap_err();
            store.delete(Folder::Archive, &item).await.unwrap();
        }
        assert_eq!(store.locks.len(), 0);

        let item = id("shared.eml");
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let (store, item) = (store.clone(), item.clone());
                tokio::spawn(async move { store.save(Folder::Sent, &item, format!("{n}").as_bytes()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.locks.len(), 0);
        assert_eq!(store.list(Folder::Sent).await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path());
        let item = id("test1.eml");

        store.save(Folder::Inbox, &item, b"bye").await.unwrap();
        store.delete(Folder::Inbox, &item).await.unwrap();
        assert!(!dir.path().join("inbox").join("test1.eml").exists());

        let err = store.delete(Folder::Inbox, &item).await.unwrap_err();
        assert!(matches!(err, MirrorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_folder_name_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMirrorStore::new(dir.path().join("root"));

        let err = store.ensure_folder_named("drafts").await.unwrap_err();
        assert!(matches!(err, MirrorError::InvalidFolder(_)));
        assert!(!dir.path().join("root").exists());

        store.ensure_folder_named("sent").await.unwrap();
        store.ensure_folder_named("sent").await.unwrap();
        assert!(dir.path().join("root").join("sent").is_dir());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("blocked");
        std::fs::write(&root, b"not a directory").unwrap();
        let store = LocalMirrorStore::new(&root);

        let err = store.save(Folder::Sent, &id("x.eml"), b"data").await.unwrap_err();
        assert!(matches!(err, MirrorError::Storage { .. }));
        assert_eq!(std::fs::read(&root).unwrap(), b"not a directory");
    }
}
