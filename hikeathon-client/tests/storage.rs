use hikeathon_client::{FileStore, storage::MAX_VALUE_BYTES};
use hikeathon_core::KeyValueStore;
use tempfile::TempDir;

#[test]
fn values_survive_reopening_the_directory() {
    let dir = TempDir::new().expect("tempdir");
    let store = FileStore::open(dir.path().join("nested")).expect("open");
    assert_eq!(store.get("team-session-backup"), None);

    store.set("team-session-backup", r#"{"teamName":"Blue Owls"}"#).expect("set");
    store.set("team-session-backup", r#"{"teamName":"Red Foxes"}"#).expect("overwrite");

    let reopened = FileStore::open(dir.path().join("nested")).expect("reopen");
    assert_eq!(
        reopened.get("team-session-backup").as_deref(),
        Some(r#"{"teamName":"Red Foxes"}"#)
    );

    reopened.remove("team-session-backup");
    reopened.remove("team-session-backup");
    assert_eq!(store.get("team-session-backup"), None);
}

#[test]
fn keys_cannot_escape_the_directory() {
    let dir = TempDir::new().expect("tempdir");
    let store = FileStore::open(dir.path()).expect("open");
    let path = store.path_for("../outside/key");
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("___outside_key.json"));
}

#[test]
fn oversized_files_are_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let store = FileStore::open(dir.path()).expect("open");
    let huge = "x".repeat(MAX_VALUE_BYTES as usize + 1);
    std::fs::write(store.path_for("chat-state"), huge).expect("write");
    assert_eq!(store.get("chat-state"), None);
}
