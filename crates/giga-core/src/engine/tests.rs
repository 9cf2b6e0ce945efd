use super::*;
use crate::mission::MissionFailure;
use crate::store::MemoryMissionStore;

async fn idle_engine(store: Arc<MemoryMissionStore>) -> DownloadEngine {
    EngineBuilder::new(EngineConfig::default(), store)
        .autostart(false)
        .open()
        .await
        .unwrap()
}

fn url() -> Vec<String> {
    vec!["http://127.0.0.1:9/file.bin".to_string()]
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let engine = idle_engine(Arc::new(MemoryMissionStore::new())).await;
    assert!(matches!(
        engine.create_mission(vec![], dir.path(), "a", None).await,
        Err(EngineError::NoUrls)
    ));
    assert!(matches!(
        engine
            .create_mission(vec!["ftp://host/x".into()], dir.path(), "a", None)
            .await,
        Err(EngineError::InvalidUrl { .. })
    ));
    assert!(matches!(
        engine.create_mission(url(), dir.path(), "../a", None).await,
        Err(EngineError::InvalidName(_))
    ));
}

#[tokio::test]
async fn create_derives_name_and_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryMissionStore::new());
    let engine = idle_engine(Arc::clone(&store)).await;
    let m = engine
        .create_mission(url(), dir.path(), "", Some(1024))
        .await
        .unwrap();
    assert_eq!(m.name, "file.bin");
    assert_eq!(m.block_size, 1024);
    assert_eq!(m.status, MissionStatus::Pending);
    assert_eq!(
        engine.check_existing(dir.path(), "file.bin"),
        MissionCheck::Pending
    );
    assert_eq!(engine.check_existing(dir.path(), "other"), MissionCheck::None);
    assert!(matches!(
        engine.create_mission(url(), dir.path(), "file.bin", None).await,
        Err(EngineError::Duplicate(_))
    ));
    assert_eq!(store.load_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn pause_resume_and_retry_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryMissionStore::new());
    let engine = idle_engine(Arc::clone(&store)).await;
    let m = engine
        .create_mission(url(), dir.path(), "f", None)
        .await
        .unwrap();
    let mut events = engine.subscribe();

    engine.pause(&m.id).await.unwrap();
    assert_eq!(engine.mission(&m.id).unwrap().status, MissionStatus::Paused);
    assert_eq!(store.load_all().await.unwrap()[0].status, MissionStatus::Paused);
    assert!(matches!(
        events.recv().await.unwrap(),
        MissionEvent::Status {
            status: MissionStatus::Paused,
            ..
        }
    ));
    // Pausing again is a no-op.
    engine.pause(&m.id).await.unwrap();

    assert!(matches!(
        engine.retry(&m.id).await,
        Err(EngineError::InvalidTransition {
            action: "retry",
            status: MissionStatus::Paused
        })
    ));

    engine.resume(&m.id).await.unwrap();
    assert_eq!(engine.mission(&m.id).unwrap().status, MissionStatus::Pending);
    // Resuming a pending mission is a no-op.
    engine.resume(&m.id).await.unwrap();
}

#[tokio::test]
async fn error_missions_need_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut failed = Mission::new(url(), dir.path().to_path_buf(), "f".into(), 4);
    failed.mode = TransferMode::Chunked;
    failed.length = 8;
    failed.chunks = vec![ChunkState::Done, ChunkState::Failed];
    failed.fail(MissionFailure::new(ErrorCode::Http(503), "chunk 1: HTTP 503"));
    std::fs::write(failed.temp_path(), [0u8; 8]).unwrap();
    let store = Arc::new(MemoryMissionStore::with_missions(vec![failed.clone()]));
    let engine = idle_engine(Arc::clone(&store)).await;

    assert!(matches!(
        engine.resume(&failed.id).await,
        Err(EngineError::InvalidTransition {
            action: "resume",
            status: MissionStatus::Error
        })
    ));
    engine.retry(&failed.id).await.unwrap();
    let m = engine.mission(&failed.id).unwrap();
    assert_eq!(m.status, MissionStatus::Pending);
    assert!(m.error.is_none());
    assert_eq!(m.chunks, vec![ChunkState::Done, ChunkState::Pending]);
    assert_eq!(store.load_all().await.unwrap()[0], m);
}

#[tokio::test]
async fn cancel_removes_record_and_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryMissionStore::new());
    let engine = idle_engine(Arc::clone(&store)).await;
    let m = engine
        .create_mission(url(), dir.path(), "f", None)
        .await
        .unwrap();
    std::fs::write(m.temp_path(), b"partial").unwrap();
    let mut events = engine.subscribe();

    engine.cancel(&m.id, true).await.unwrap();
    assert!(engine.mission(&m.id).is_none());
    assert!(store.load_all().await.unwrap().is_empty());
    assert!(!m.temp_path().exists());
    assert!(matches!(
        events.recv().await.unwrap(),
        MissionEvent::Removed { .. }
    ));
    assert!(matches!(
        engine.pause(&m.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn open_recovers_crashed_and_pruned_missions() {
    let dir = tempfile::tempdir().unwrap();
    let loc = dir.path().to_path_buf();

    let mut crashed = Mission::new(url(), loc.clone(), "crashed".into(), 4);
    crashed.status = MissionStatus::Running;

    let mut gone = Mission::new(url(), loc.clone(), "gone".into(), 4);
    gone.status = MissionStatus::Finished;

    let mut kept = Mission::new(url(), loc.clone(), "kept".into(), 4);
    kept.status = MissionStatus::Finished;
    std::fs::write(kept.path(), b"data").unwrap();

    let mut lost = Mission::new(url(), loc.clone(), "lost".into(), 4);
    lost.mode = TransferMode::Chunked;
    lost.length = 8;
    lost.chunks = vec![ChunkState::Done, ChunkState::Pending];
    lost.status = MissionStatus::Paused;

    let store = Arc::new(MemoryMissionStore::with_missions(vec![
        crashed.clone(),
        gone.clone(),
        kept.clone(),
        lost.clone(),
    ]));
    let engine = idle_engine(Arc::clone(&store)).await;

    assert_eq!(
        engine.mission(&crashed.id).unwrap().status,
        MissionStatus::Pending
    );
    assert!(engine.mission(&gone.id).is_none());
    assert_eq!(
        engine.check_existing(&loc, "kept"),
        MissionCheck::Finished
    );
    let lost = engine.mission(&lost.id).unwrap();
    assert_eq!(lost.chunks, vec![ChunkState::Pending; 2]);
    assert_eq!(store.load_all().await.unwrap().len(), 3);

    assert_eq!(engine.forget_finished().await.unwrap(), 1);
    assert!(kept.path().exists());
    assert_eq!(engine.missions().len(), 2);
}

#[tokio::test]
async fn renamed_but_unrecorded_mission_counts_as_finished() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Mission::new(url(), dir.path().to_path_buf(), "done".into(), 4);
    m.mode = TransferMode::Chunked;
    m.length = 8;
    m.chunks = vec![ChunkState::Done; 2];
    m.status = MissionStatus::Running;
    std::fs::write(m.path(), [7u8; 8]).unwrap();
    let engine = idle_engine(Arc::new(MemoryMissionStore::with_missions(vec![m.clone()]))).await;
    assert_eq!(
        engine.mission(&m.id).unwrap().status,
        MissionStatus::Finished
    );
    // Finished missions are never re-fetched.
    engine.resume(&m.id).await.unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
}

#[test]
fn url_validation() {
    assert!(validate_url("https://example.com/a").is_ok());
    assert!(validate_url("not a url").is_err());
    assert!(validate_url("file:///etc/passwd").is_err());
}

fn one_attempt_config() -> EngineConfig {
    EngineConfig {
        connect_timeout_secs: 2,
        retry: Some(crate::config::RetryConfig {
            max_attempts: 1,
            base_delay_secs: 0.01,
            max_delay_secs: 1,
        }),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn removed_slot_is_never_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = idle_engine(Arc::new(MemoryMissionStore::new())).await;
    let m = engine
        .create_mission(url(), dir.path(), "f", None)
        .await
        .unwrap();
    let slot = engine.inner.slot(&m.id).unwrap();
    slot.mark_removed();

    engine.set_autostart(true);
    assert!(!slot.is_active());
    assert_eq!(slot.status(), MissionStatus::Pending);
}

#[tokio::test]
async fn cancelled_pending_mission_stays_gone_after_autostart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryMissionStore::new());
    let engine = idle_engine(Arc::clone(&store)).await;
    let m = engine
        .create_mission(url(), dir.path(), "f", None)
        .await
        .unwrap();
    let slot = engine.inner.slot(&m.id).unwrap();

    engine.cancel(&m.id, true).await.unwrap();
    assert!(slot.is_removed());
    engine.set_autostart(true);

    assert!(!slot.is_active());
    assert!(engine.mission(&m.id).is_none());
    assert!(engine.missions().is_empty());
    assert!(store.load_all().await.unwrap().is_empty());
    assert!(matches!(
        engine.cancel(&m.id, true).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn set_autostart_works_from_a_plain_thread() {
    let dir = tempfile::tempdir().unwrap();
    let engine = EngineBuilder::new(one_attempt_config(), Arc::new(MemoryMissionStore::new()))
        .autostart(false)
        .open()
        .await
        .unwrap();
    let m = engine
        .create_mission(url(), dir.path(), "f", None)
        .await
        .unwrap();

    let remote = engine.clone();
    std::thread::spawn(move || remote.set_autostart(true))
        .join()
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(20), engine.wait(&m.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, MissionStatus::Error);
}

struct DenyAll;

impl FileProvider for DenyAll {
    fn prepare_location(&self, _: &Path) -> Result<(), FileAccessError> {
        Err(FileAccessError::Denied(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )))
    }

    fn open(&self, _: &Path, _: crate::storage::OpenMode) -> Result<std::fs::File, FileAccessError> {
        Err(FileAccessError::Denied(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )))
    }
}

#[tokio::test]
async fn denied_location_rejects_the_mission() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryMissionStore::new());
    let engine = EngineBuilder::new(EngineConfig::default(), Arc::clone(&store) as Arc<dyn MissionStore>)
        .files(Arc::new(DenyAll))
        .autostart(false)
        .open()
        .await
        .unwrap();

    let result = engine.create_mission(url(), dir.path(), "f", None).await;
    match result {
        Err(EngineError::WritePermissionDenied(location)) => {
            assert_eq!(location.as_path(), dir.path())
        }
        other => panic!("expected WritePermissionDenied, got {:?}", other.map(|m| m.id)),
    }
    assert!(engine.missions().is_empty());
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_request_waits_for_a_connection_slot() {
    use std::io::ErrorKind;
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        max_total_connections: 1,
        ..one_attempt_config()
    };
    let engine = EngineBuilder::new(config, Arc::new(MemoryMissionStore::new()))
        .autostart(false)
        .open()
        .await
        .unwrap();
    let held = crate::scheduler::BudgetLease::reserve(&engine.inner.budget, 1);
    assert_eq!(held.slots(), 1);

    let m = engine
        .create_mission(
            vec![format!("http://127.0.0.1:{}/f.bin", port)],
            dir.path(),
            "f.bin",
            None,
        )
        .await
        .unwrap();
    engine.set_autostart(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.mission(&m.id).unwrap().status, MissionStatus::Running);
    assert!(matches!(listener.accept(), Err(e) if e.kind() == ErrorKind::WouldBlock));

    drop(held);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match listener.accept() {
            // Closing without a response fails the one allowed attempt.
            Ok((stream, _)) => {
                drop(stream);
                break;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                assert!(std::time::Instant::now() < deadline, "no connection after release");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);
    assert_eq!(engine.inner.budget.in_use(), 0);
}
