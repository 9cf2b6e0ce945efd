//! End-to-end tests: the engine against a local range server.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::range_server::{self, RangeServerOptions};
use common::{body, test_config};
use giga_core::config::RetryConfig;
use giga_core::mission::{ErrorCode, FailureClass, TransferMode};
use giga_core::segmenter::ChunkState;
use giga_core::storage::{FileAccessError, FileProvider, LocalFiles, OpenMode};
use giga_core::{
    DownloadEngine, EngineBuilder, MissionEvent, MissionStatus, MissionStore, SqliteMissionStore,
};
use tempfile::tempdir;

const BLOCK: u64 = 4096;

async fn engine_with(
    config: giga_core::config::EngineConfig,
    store: Arc<dyn MissionStore>,
) -> DownloadEngine {
    EngineBuilder::new(config, store).open().await.unwrap()
}

async fn sqlite_store(dir: &std::path::Path) -> Arc<SqliteMissionStore> {
    Arc::new(SqliteMissionStore::open_at(dir.join("missions.db")).await.unwrap())
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<MissionEvent>) -> Vec<MissionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_chunks_with_one_flaky_chunk_complete() {
    let data = body(5 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            fail_start: Some(2 * BLOCK),
            fail_times: 2,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;
    let engine = engine_with(test_config(BLOCK), store.clone()).await;
    let mut events = engine.subscribe();

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "five.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);

    let on_disk = std::fs::read(downloads.path().join("five.bin")).unwrap();
    assert_eq!(on_disk, data);
    assert!(!m.temp_path().exists());

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|ev| match ev {
            MissionEvent::ChunkFailed { chunk, .. } => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![2, 2]);

    for i in 0..5u64 {
        let expected = if i == 2 { 3 } else { 1 };
        assert_eq!(server.hits(i * BLOCK, (i + 1) * BLOCK - 1), expected, "chunk {i}");
    }

    let stored = store.load_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MissionStatus::Finished);
    assert_eq!(stored[0].chunks, vec![ChunkState::Done; 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_ceiling_fails_the_mission() {
    let data = body(3 * BLOCK as usize);
    let server = range_server::start_with_options(
        data,
        RangeServerOptions {
            fail_start: Some(BLOCK),
            fail_times: usize::MAX,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let mut config = test_config(BLOCK);
    config.retry = Some(RetryConfig {
        max_attempts: 3,
        base_delay_secs: 0.01,
        max_delay_secs: 1,
    });
    let engine = engine_with(config, Arc::new(giga_core::MemoryMissionStore::new())).await;
    let mut events = engine.subscribe();

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "f.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);

    let m = engine.mission(&m.id).unwrap();
    let error = m.error.clone().unwrap();
    assert_eq!(error.code, ErrorCode::Http(500));
    assert!(error.message.starts_with("chunk 1:"), "{}", error.message);
    assert_eq!(m.chunks[1], ChunkState::Failed);
    assert_eq!(server.hits(BLOCK, 2 * BLOCK - 1), 3);

    let attempts = drain(&mut events)
        .into_iter()
        .filter(|ev| matches!(ev, MissionEvent::ChunkFailed { chunk: 1, .. }))
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirror_list_is_walked_in_order() {
    let data = body(2 * BLOCK as usize);
    let server = range_server::start(data.clone());
    let downloads = tempdir().unwrap();
    let mut config = test_config(BLOCK);
    config.retry = Some(RetryConfig {
        max_attempts: 2,
        base_delay_secs: 0.01,
        max_delay_secs: 1,
    });
    let engine = engine_with(config, Arc::new(giga_core::MemoryMissionStore::new())).await;

    // Nothing listens on port 1; connection refused is retryable.
    let urls = vec!["http://127.0.0.1:1/file.bin".to_string(), server.url.clone()];
    let m = engine
        .create_mission(urls, downloads.path(), "m.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_ranges_fall_back_to_single_stream() {
    let data = body(4 * BLOCK as usize + 100);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            support_ranges: false,
            honour_probe: true,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "s.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
    let m = engine.mission(&m.id).unwrap();
    assert_eq!(m.mode, TransferMode::Stream { resumable: false });
    // Only the first chunk was ever asked for before the gate closed.
    assert_eq!(server.hits(BLOCK, 2 * BLOCK - 1), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_without_ranges_streams_from_the_start() {
    let data = body(3 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            support_ranges: false,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "n.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
    assert_eq!(
        engine.mission(&m.id).unwrap().mode,
        TransferMode::Stream { resumable: false }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_fetches_only_unfinished_chunks() {
    let data = body(4 * BLOCK as usize);
    let server = range_server::start(data.clone());
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;

    // State left behind by an earlier process: chunks 0 and 1 on disk.
    let mut seeded = giga_core::Mission::new(
        vec![server.url.clone()],
        downloads.path().to_path_buf(),
        "r.bin".into(),
        BLOCK,
    );
    seeded.mode = TransferMode::Chunked;
    seeded.length = data.len() as u64;
    seeded.chunks = vec![
        ChunkState::Done,
        ChunkState::Done,
        ChunkState::InProgress,
        ChunkState::Pending,
    ];
    seeded.status = MissionStatus::Running;
    let mut partial = vec![0u8; data.len()];
    partial[..2 * BLOCK as usize].copy_from_slice(&data[..2 * BLOCK as usize]);
    std::fs::write(seeded.temp_path(), &partial).unwrap();
    store.add(&seeded).await.unwrap();

    let engine = engine_with(test_config(BLOCK), store.clone()).await;
    assert_eq!(engine.wait(&seeded.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(seeded.path()).unwrap(), data);
    assert_eq!(server.hits(0, BLOCK - 1), 0);
    assert_eq!(server.hits(BLOCK, 2 * BLOCK - 1), 0);
    assert_eq!(server.hits(2 * BLOCK, 3 * BLOCK - 1), 1);
    assert_eq!(server.hits(3 * BLOCK, 4 * BLOCK - 1), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_mission_is_never_fetched_again() {
    let data = body(2 * BLOCK as usize);
    let server = range_server::start(data.clone());
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;

    let id = {
        let engine = engine_with(test_config(BLOCK), store.clone()).await;
        let m = engine
            .create_mission(vec![server.url.clone()], downloads.path(), "d.bin", None)
            .await
            .unwrap();
        assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
        m.id
    };
    let before = server.total_hits();

    let engine = engine_with(test_config(BLOCK), store.clone()).await;
    engine.resume(&id).await.unwrap();
    engine.start_all().await.unwrap();
    engine.run_until_idle().await;
    assert_eq!(engine.mission(&id).unwrap().status, MissionStatus::Finished);
    assert_eq!(server.total_hits(), before);
    assert_eq!(std::fs::read(downloads.path().join("d.bin")).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_keeps_progress_and_resume_completes() {
    let data = body(8 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            throttle: Some(Duration::from_millis(40)),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;
    let mut config = test_config(BLOCK);
    config.connections_per_mission = 2;
    let engine = engine_with(config, store.clone()).await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "p.bin", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.pause(&m.id).await.unwrap();

    let paused = engine.mission(&m.id).unwrap();
    assert_eq!(paused.status, MissionStatus::Paused);
    assert!(!paused.chunks.contains(&ChunkState::InProgress));
    let stored = store.load_all().await.unwrap();
    assert_eq!(stored[0].status, MissionStatus::Paused);
    assert_eq!(stored[0].chunks, paused.chunks);

    engine.resume(&m.id).await.unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_flight_removes_record_and_file() {
    let data = body(8 * BLOCK as usize);
    let server = range_server::start_with_options(
        data,
        RangeServerOptions {
            throttle: Some(Duration::from_millis(40)),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;
    let engine = engine_with(test_config(BLOCK), store.clone()).await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "c.bin", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.cancel(&m.id, true).await.unwrap();

    assert!(engine.mission(&m.id).is_none());
    assert!(store.load_all().await.unwrap().is_empty());
    assert!(!m.temp_path().exists());
    assert!(!m.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_resource_is_a_permanent_error() {
    let server = range_server::start_with_options(
        body(10),
        RangeServerOptions {
            status: Some(404),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "x.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);
    let error = engine.mission(&m.id).unwrap().error.unwrap();
    assert_eq!(error.code, ErrorCode::Http(404));
    assert_eq!(server.total_hits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_resource_is_no_content() {
    let server = range_server::start(Vec::new());
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "e.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);
    assert_eq!(
        engine.mission(&m.id).unwrap().error.unwrap().code,
        ErrorCode::NoContent
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_remote_discards_progress() {
    let data = body(2 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            etag: Some("v2".into()),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let store = Arc::new(giga_core::MemoryMissionStore::new());

    let mut seeded = giga_core::Mission::new(
        vec![server.url.clone()],
        downloads.path().to_path_buf(),
        "v.bin".into(),
        BLOCK,
    );
    seeded.mode = TransferMode::Chunked;
    seeded.length = data.len() as u64;
    seeded.etag = Some("v1".into());
    seeded.chunks = vec![ChunkState::Done, ChunkState::Pending];
    std::fs::write(seeded.temp_path(), vec![0xAAu8; data.len()]).unwrap();
    store.add(&seeded).await.unwrap();

    let engine = engine_with(test_config(BLOCK), store).await;
    assert_eq!(engine.wait(&seeded.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(seeded.path()).unwrap(), data);
    assert_eq!(server.hits(0, BLOCK - 1), 1);
    assert_eq!(
        engine.mission(&seeded.id).unwrap().etag.as_deref(),
        Some("v2")
    );
}

#[tokio::test]
async fn corrupt_store_fails_engine_open() {
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;
    let m = giga_core::Mission::new(
        vec!["http://127.0.0.1:1/a".into()],
        state.path().to_path_buf(),
        "a".into(),
        BLOCK,
    );
    store.add(&m).await.unwrap();
    sqlx::query("UPDATE missions SET mode = 'sideways'")
        .execute(store.pool())
        .await
        .unwrap();

    let result = EngineBuilder::new(test_config(BLOCK), store).open().await;
    assert!(matches!(
        result,
        Err(giga_core::EngineError::Store(giga_core::StoreError::Corrupt { .. }))
    ));
}

/// Engine config with `connections` per mission and a server throttled to
/// one KiB per `throttle_ms`.
fn stream_setup(
    connections: usize,
    throttle_ms: u64,
) -> (giga_core::config::EngineConfig, RangeServerOptions) {
    let mut config = test_config(BLOCK);
    config.connections_per_mission = connections;
    let opts = RangeServerOptions {
        throttle: Some(Duration::from_millis(throttle_ms)),
        ..Default::default()
    };
    (config, opts)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn length_change_mid_run_restarts_once() {
    let old = body(3 * BLOCK as usize);
    let new: Vec<u8> = body(4 * BLOCK as usize).iter().map(|b| b ^ 0x5a).collect();
    // GET 0 is the one-byte length check and GET 1 the first chunk; later GETs see the new body.
    let server = range_server::start_with_options(
        old,
        RangeServerOptions {
            swap_body: Some((2, new.clone())),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "grow.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);

    let done = engine.mission(&m.id).unwrap();
    assert_eq!(done.length, new.len() as u64);
    assert_eq!(done.chunks, vec![ChunkState::Done; 4]);
    assert_eq!(std::fs::read(m.path()).unwrap(), new);
    assert_eq!(server.hits(0, 0), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_length_change_is_resource_gone() {
    let data = body(3 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            misreport_total: true,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let engine = engine_with(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .await;
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "shifty.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);

    let error = engine.mission(&m.id).unwrap().error.unwrap();
    assert_eq!(error.code, ErrorCode::ResourceGone);
    assert_eq!(error.class(), FailureClass::NetworkPermanent);
    assert!(error.message.contains(&(data.len() as u64 + 1).to_string()));
    assert_eq!(server.hits(0, 0), 2);
    assert!(!m.path().exists());
}

/// Lets the destination directory through but refuses every file handle.
struct DenyOpen;

impl FileProvider for DenyOpen {
    fn prepare_location(&self, location: &Path) -> Result<(), FileAccessError> {
        LocalFiles.prepare_location(location)
    }

    fn open(&self, _: &Path, _: OpenMode) -> Result<std::fs::File, FileAccessError> {
        Err(FileAccessError::Denied(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_partial_file_fails_with_permission_denied() {
    let server = range_server::start(body(2 * BLOCK as usize));
    let downloads = tempdir().unwrap();
    let engine = EngineBuilder::new(
        test_config(BLOCK),
        Arc::new(giga_core::MemoryMissionStore::new()),
    )
    .files(Arc::new(DenyOpen))
    .open()
    .await
    .unwrap();
    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "ro.bin", None)
        .await
        .unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Error);

    let error = engine.mission(&m.id).unwrap().error.unwrap();
    assert_eq!(error.code, ErrorCode::PermissionDenied);
    assert_eq!(error.class(), FailureClass::StorageFailure);
    // Only the one-byte length check reached the server.
    assert_eq!(server.total_hits(), 1);
    assert!(!m.temp_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumable_stream_pauses_and_continues_at_offset() {
    let data = body(4 * BLOCK as usize);
    let (config, opts) = stream_setup(1, 40);
    let server = range_server::start_with_options(data.clone(), opts);
    let downloads = tempdir().unwrap();
    let engine = engine_with(config, Arc::new(giga_core::MemoryMissionStore::new())).await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "s.bin", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.pause(&m.id).await.unwrap();

    let paused = engine.mission(&m.id).unwrap();
    assert_eq!(paused.status, MissionStatus::Paused);
    assert_eq!(paused.mode, TransferMode::Stream { resumable: true });
    let offset = paused.stream_offset;
    assert!(offset > 0 && offset < data.len() as u64, "offset {offset}");

    engine.resume(&m.id).await.unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
    assert_eq!(server.full_hits(), 1);
    assert_eq!(server.hits(offset, u64::MAX), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_resumable_stream_restarts_from_zero() {
    let data = body(3 * BLOCK as usize);
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            support_ranges: false,
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let store = Arc::new(giga_core::MemoryMissionStore::new());

    // An earlier run got part of the way and left junk past the real length.
    let mut seeded = giga_core::Mission::new(
        vec![server.url.clone()],
        downloads.path().to_path_buf(),
        "z.bin".into(),
        BLOCK,
    );
    seeded.mode = TransferMode::Stream { resumable: false };
    seeded.length = data.len() as u64;
    seeded.stream_offset = 5000;
    seeded.status = MissionStatus::Paused;
    std::fs::write(seeded.temp_path(), vec![0xAAu8; data.len() + 777]).unwrap();
    store.add(&seeded).await.unwrap();

    let engine = engine_with(test_config(BLOCK), store).await;
    engine.resume(&seeded.id).await.unwrap();
    assert_eq!(engine.wait(&seeded.id).await.unwrap(), MissionStatus::Finished);

    assert_eq!(std::fs::read(seeded.path()).unwrap(), data);
    assert_eq!(server.full_hits(), 1);
    assert_eq!(server.hits(5000, u64::MAX), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_resume_refused_by_server_restarts_from_zero() {
    let data = body(4 * BLOCK as usize);
    // Passes the one-byte check, then answers every ranged GET with 200.
    let server = range_server::start_with_options(
        data.clone(),
        RangeServerOptions {
            support_ranges: false,
            honour_probe: true,
            throttle: Some(Duration::from_millis(40)),
            ..Default::default()
        },
    );
    let downloads = tempdir().unwrap();
    let mut config = test_config(BLOCK);
    config.connections_per_mission = 1;
    let engine = engine_with(config, Arc::new(giga_core::MemoryMissionStore::new())).await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "r.bin", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.pause(&m.id).await.unwrap();
    let offset = engine.mission(&m.id).unwrap().stream_offset;
    assert!(offset > 0, "nothing written before pause");

    engine.resume(&m.id).await.unwrap();
    assert_eq!(engine.wait(&m.id).await.unwrap(), MissionStatus::Finished);

    let done = engine.mission(&m.id).unwrap();
    assert_eq!(done.mode, TransferMode::Stream { resumable: false });
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
    assert_eq!(server.hits(offset, u64::MAX), 1);
    assert_eq!(server.full_hits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_offset_is_checkpointed_while_running() {
    let data = body(4 * BLOCK as usize);
    let (config, opts) = stream_setup(1, 40);
    let server = range_server::start_with_options(data.clone(), opts);
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store = sqlite_store(state.path()).await;
    let engine = engine_with(config.clone(), store.clone()).await;

    let m = engine
        .create_mission(vec![server.url.clone()], downloads.path(), "k.bin", None)
        .await
        .unwrap();

    // What a crash would leave behind: the record as last written mid-run.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let crashed = loop {
        let stored = store.load_all().await.unwrap();
        if let Some(r) = stored.into_iter().next() {
            if r.status == MissionStatus::Running && r.stream_offset > 0 {
                break r;
            }
        }
        assert!(std::time::Instant::now() < deadline, "no checkpoint written");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    engine.pause(&m.id).await.unwrap();

    let offset = crashed.stream_offset;
    assert!(offset < data.len() as u64);
    let partial = std::fs::read(m.temp_path()).unwrap();
    assert_eq!(&partial[..offset as usize], &data[..offset as usize]);

    let restarted = engine_with(
        config,
        Arc::new(giga_core::MemoryMissionStore::with_missions(vec![crashed])),
    )
    .await;
    assert_eq!(restarted.wait(&m.id).await.unwrap(), MissionStatus::Finished);
    assert_eq!(std::fs::read(m.path()).unwrap(), data);
    assert_eq!(server.hits(offset, u64::MAX), 1);
}
