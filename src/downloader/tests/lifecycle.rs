use super::*;

#[tokio::test]
async fn shutdown_cancels_running_jobs_and_refuses_new_ones() {
    let rig = create_test_downloader_with(FakeExtractor::new(Behavior::Hang), |_| {}, None).await;
    let mut events = rig.downloader.subscribe();

    let running = spawn_submit(&rig.downloader, video(1, "https://example.com/v/1"));
    let other = spawn_submit(&rig.downloader, video(2, "https://example.com/v/2"));
    wait_until(|| rig.extractor.in_flight() == 2).await;

    rig.downloader.shutdown().await.unwrap();

    assert!(matches!(running.await.unwrap(), Err(Error::Cancelled)));
    assert!(matches!(other.await.unwrap(), Err(Error::Cancelled)));
    assert_idle(&rig.downloader);

    let err = rig
        .downloader
        .submit_job(video(3, "https://example.com/v/3"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));

    assert!(matches!(
        drain(&mut events).last(),
        Some(Event::Shutdown)
    ));
}

#[tokio::test]
async fn jobs_queued_on_a_permit_are_released_by_shutdown() {
    let rig = create_test_downloader_with(
        FakeExtractor::new(Behavior::Hang),
        |config| config.limits.bulk_video = 1,
        None,
    )
    .await;

    let holder = spawn_submit(&rig.downloader, video(1, "https://example.com/v/1"));
    wait_until(|| rig.extractor.in_flight() == 1).await;
    let queued = spawn_submit(&rig.downloader, video(2, "https://example.com/v/2"));
    wait_until(|| rig.downloader.running_tasks() == 2).await;

    rig.downloader.shutdown().await.unwrap();

    assert!(holder.await.unwrap().is_err());
    assert!(queued.await.unwrap().is_err());
    assert_eq!(rig.extractor.calls(), 1);
    assert_idle(&rig.downloader);
}

#[tokio::test]
async fn unclean_shutdown_is_detected_on_next_start() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("media-dl.db");
    let configure = |config: &mut Config| {
        config.persistence.database_path = Some(db_path.clone());
    };

    // First start on a fresh database is not a recovery
    let first = create_test_downloader_with(FakeExtractor::producing(1024), configure, None).await;
    assert!(!first.downloader.recovered_from_unclean_shutdown());
    first
        .downloader
        .submit_job(video(1, "https://example.com/v/1"))
        .await
        .unwrap();
    // Simulate crash: no shutdown()
    if let Some(db) = &first.downloader.db {
        db.close().await;
    }
    drop(first);

    let second = create_test_downloader_with(FakeExtractor::producing(1024), configure, None).await;
    assert!(second.downloader.recovered_from_unclean_shutdown());
    second.downloader.shutdown().await.unwrap();
    if let Some(db) = &second.downloader.db {
        db.close().await;
    }
    drop(second);

    let third = create_test_downloader_with(FakeExtractor::producing(1024), configure, None).await;
    assert!(!third.downloader.recovered_from_unclean_shutdown());
}

#[tokio::test]
async fn cache_survives_a_restart_through_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("media-dl.db");
    let configure = |config: &mut Config| {
        config.persistence.database_path = Some(db_path.clone());
    };

    let first = create_test_downloader_with(FakeExtractor::producing(1024), configure, None).await;
    let delivered = first
        .downloader
        .submit_job(video(1, "https://example.com/v/keep"))
        .await
        .unwrap();
    first.downloader.shutdown().await.unwrap();
    if let Some(db) = &first.downloader.db {
        db.close().await;
    }
    drop(first);

    let second = create_test_downloader_with(FakeExtractor::producing(1024), configure, None).await;
    let served = second
        .downloader
        .submit_job(video(2, "https://example.com/v/keep"))
        .await
        .unwrap();
    assert!(served.from_cache);
    assert_eq!(served.reference, delivered.reference);
    assert_eq!(second.extractor.calls(), 0);
}
