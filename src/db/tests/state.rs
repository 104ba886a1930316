use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "a fresh database has never seen a clean shutdown"
    );

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let previous = db.set_clean_start("instance-a").await.unwrap();
    assert!(previous.is_none());
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let temp_file = NamedTempFile::new().unwrap();

    // First session starts but never shuts down cleanly
    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.set_clean_start("instance-a").await.unwrap();
        db.close().await;
    }

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        assert!(db.was_unclean_shutdown().await.unwrap());

        let previous = db.set_clean_start("instance-b").await.unwrap();
        assert_eq!(previous.as_deref(), Some("instance-a"));
        db.close().await;
    }
}
