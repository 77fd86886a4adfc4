//! End-to-end behaviour of the local mirror store through the public API.

use mailmirror::{Folder, ItemId, LocalMirrorStore, MirrorError};

fn id(s: &str) -> ItemId {
    ItemId::parse(s).unwrap()
}

#[tokio::test]
async fn test_sent_to_archive_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalMirrorStore::new(dir.path());
    let item = id("abc123.eml");

    store.save(Folder::Sent, &item, b"hello").await.unwrap();
    assert_eq!(store.list(Folder::Sent).await.unwrap(), vec![item.clone()]);

    store.move_item(Folder::Sent, Folder::Archive, &item).await.unwrap();
    assert!(store.list(Folder::Sent).await.unwrap().is_empty());
    assert_eq!(store.list(Folder::Archive).await.unwrap(), vec![item.clone()]);
    assert_eq!(store.read(Folder::Archive, &item).await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_read_from_empty_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalMirrorStore::new(dir.path());

    let err = store.read(Folder::Inbox, &id("missing.eml")).await.unwrap_err();
    assert!(matches!(err, MirrorError::NotFound { .. }));
}

#[tokio::test]
async fn test_roundtrip_in_every_folder() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalMirrorStore::new(dir.path());
    let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

    for folder in Folder::ALL {
        let item = id(&format!("{}-item.eml", folder));
        store.save(folder, &item, &binary).await.unwrap();
        assert_eq!(store.read(folder, &item).await.unwrap(), binary);
        assert_eq!(
            std::fs::read(dir.path().join(folder.as_str()).join(item.as_str())).unwrap(),
            binary
        );
    }
}

#[tokio::test]
async fn test_move_between_every_pair() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalMirrorStore::new(dir.path());

    for source in Folder::ALL {
        for dest in Folder::ALL.into_iter().filter(|f| *f != source) {
            let item = id(&format!("{}-to-{}.eml", source, dest));
            store.save(source, &item, item.as_str().as_bytes()).await.unwrap();

            let location = store.move_item(source, dest, &item).await.unwrap();
            assert_eq!(location, dir.path().join(dest.as_str()).join(item.as_str()));
            assert!(!store.list(source).await.unwrap().contains(&item));
            assert_eq!(
                store.read(dest, &item).await.unwrap(),
                item.as_str().as_bytes()
            );
        }
    }
}

#[tokio::test]
async fn test_move_within_same_folder_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalMirrorStore::new(dir.path());
    let item = id("same.eml");

    store.save(Folder::Inbox, &item, b"x").await.unwrap();
    let err = store.move_item(Folder::Inbox, Folder::Inbox, &item).await.unwrap_err();
    assert!(matches!(err, MirrorError::AlreadyExists { .. }));
    assert_eq!(store.read(Folder::Inbox, &item).await.unwrap(), b"x");
}

#[test]
fn test_unknown_folders_and_bad_ids_are_rejected() {
    for name in ["drafts", "INBOX", "spam", "", "inbox/../sent"] {
        assert!(matches!(
            name.parse::<Folder>(),
            Err(MirrorError::InvalidFolder(_))
        ));
    }
    for raw in ["", "abc", "abc.txt", "a/b.eml", "a\\b.eml", "../../etc/passwd.eml"] {
        assert!(matches!(
            ItemId::parse(raw),
            Err(MirrorError::InvalidId { .. })
        ));
    }
}
