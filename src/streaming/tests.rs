use super::testing::{FakeControl, FakeProvider};
use super::*;
use crate::config::{HwAccel, RelayConfig};
use crate::error::{BackendError, VcamError};
use crate::frame::FrameData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

fn test_profile(token: &str) -> StreamProfile {
    StreamProfile {
        token: token.to_string(),
        name: format!("video_{}", token),
        width: 64,
        height: 36,
        fps: 30,
        bitrate_kbps: 1000,
        codec: "H264".to_string(),
    }
}

fn frame(id: u64) -> FrameData {
    FrameData::test_pattern(id, 64, 36)
}

fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        queue_capacity: 4,
        max_encode_errors: 3,
        readiness_timeout: Duration::from_millis(500),
        stop_timeout: Duration::from_millis(500),
        warmup_frames: 0,
        retry_interval: Duration::from_secs(60),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// relay (priority 1) and mjpeg (priority 3) fakes over one "main" profile
fn two_tier() -> (Arc<StreamOrchestrator>, Arc<FakeControl>, Arc<FakeControl>) {
    let (relay, relay_ctl) = FakeProvider::shared(BackendKind::Relay, 1);
    let (mjpeg, mjpeg_ctl) = FakeProvider::shared(BackendKind::Mjpeg, 3);
    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(mjpeg)
        .provider(relay)
        .settings(fast_settings())
        .build()
        .unwrap();
    (orchestrator, relay_ctl, mjpeg_ctl)
}

#[test]
fn test_queue_drops_oldest_when_full() {
    let queue = FrameQueue::new(2);
    assert!(!queue.push(frame(1)));
    assert!(!queue.push(frame(2)));
    assert!(queue.push(frame(3)));

    assert_eq!(queue.dropped(), 1);
    assert_eq!(queue.pushed(), 3);
    assert_eq!(queue.pop().map(|f| f.id), Some(2));
    assert_eq!(queue.pop().map(|f| f.id), Some(3));
    assert!(queue.pop().is_none());
}

#[tokio::test]
async fn test_queue_close_ends_consumer() {
    let queue = Arc::new(FrameQueue::new(2));
    queue.push(frame(7));
    queue.close();

    assert_eq!(queue.next().await.map(|f| f.id), Some(7));
    assert!(queue.next().await.is_none());

    // Pushing after close counts as a drop
    queue.push(frame(8));
    assert_eq!(queue.dropped(), 1);
}

#[test]
fn test_fps_window() {
    let mut window = FpsWindow::default();
    let start = Instant::now();
    for i in 0..11 {
        window.record(start + Duration::from_millis(100 * i));
    }
    let fps = window.fps(start + Duration::from_secs(1));
    assert!((fps - 10.0).abs() < 0.01, "fps was {}", fps);

    // Samples age out of the window
    assert_eq!(window.fps(start + Duration::from_secs(30)), 0.0);
}

#[test]
fn test_parse_bitrate() {
    assert_eq!(parse_bitrate("8M"), Some(8000));
    assert_eq!(parse_bitrate("1.5M"), Some(1500));
    assert_eq!(parse_bitrate("512K"), Some(512));
    assert_eq!(parse_bitrate("2500"), Some(2500));
    assert_eq!(parse_bitrate(""), None);
    assert_eq!(parse_bitrate("fast"), None);
    assert_eq!(parse_bitrate("-1M"), None);
}

#[test]
fn test_profile_validation() {
    assert!(test_profile("main").validate().is_ok());

    let mut odd = test_profile("main");
    odd.width = 641;
    assert!(odd.validate().is_err());

    let mut still = test_profile("main");
    still.fps = 0;
    assert!(still.validate().is_err());

    let mut silent = test_profile("main");
    silent.bitrate_kbps = 0;
    assert!(silent.validate().is_err());
}

#[test]
fn test_needs_restart_only_for_encoding_parameters() {
    let base = test_profile("main");
    assert!(!base.needs_restart(&base.clone()));

    let mut faster = base.clone();
    faster.fps = 60;
    assert!(base.needs_restart(&faster));
}

#[test]
fn test_encoder_fallback_order() {
    assert_eq!(
        EncoderKind::fallback_order(HwAccel::Auto),
        vec![EncoderKind::Nvenc, EncoderKind::Qsv, EncoderKind::Software]
    );
    assert_eq!(EncoderKind::fallback_order(HwAccel::Cpu), vec![EncoderKind::Software]);
    assert_eq!(
        EncoderKind::fallback_order(HwAccel::Qsv).last(),
        Some(&EncoderKind::Software)
    );
}

#[test]
fn test_ffmpeg_args() {
    let profile = test_profile("main");
    let args = ffmpeg_args(&profile, EncoderKind::Software, "rtsp://127.0.0.1:8554/video_main");
    let joined = args.join(" ");

    assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 64x36 -r 30 -i -"));
    assert!(joined.contains("-c:v libx264"));
    assert!(joined.contains("-tune zerolatency"));
    assert!(joined.contains("-b:v 1000k -maxrate 1000k -bufsize 2000k"));
    assert!(joined.contains("-g 60"));
    assert!(joined.ends_with("-f rtsp -rtsp_transport tcp rtsp://127.0.0.1:8554/video_main"));

    let nvenc = ffmpeg_args(&profile, EncoderKind::Nvenc, "rtsp://h/p").join(" ");
    assert!(nvenc.contains("-c:v h264_nvenc -preset p1"));
}

#[test]
fn test_relay_accelerator_change_reported_once() {
    let relay = RelayProvider::new(RelayConfig::default(), "10.0.0.5");
    assert_eq!(relay.accelerator(), HwAccel::Auto);
    assert!(relay.set_accelerator(HwAccel::Nvenc));
    assert!(!relay.set_accelerator(HwAccel::Nvenc));
    assert_eq!(relay.accelerator(), HwAccel::Nvenc);
}

#[tokio::test]
async fn test_selects_highest_priority_backend() {
    let (orchestrator, relay, mjpeg) = two_tier();
    orchestrator.start().await.unwrap();

    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Relay));
    assert_eq!(orchestrator.stream_uri("main").unwrap(), "fake://relay/main");
    assert_eq!(relay.starts(), 1);
    assert_eq!(mjpeg.starts(), 0);
    assert!(orchestrator.backend_state("main", BackendKind::Mjpeg).is_none());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_backend_is_skipped() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    relay.unavailable.store(true, Ordering::SeqCst);
    orchestrator.start().await.unwrap();

    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Mjpeg));
    assert_eq!(relay.starts(), 0);
    assert!(!orchestrator.capabilities()[&BackendKind::Relay].is_available());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_runtime_failure_falls_back() {
    let (orchestrator, relay, mjpeg) = two_tier();
    orchestrator.start().await.unwrap();
    let before = orchestrator.stream_uri("main").unwrap();

    relay.trigger_failure("encoder crashed");

    assert!(wait_until(|| orchestrator.active_backend("main") == Some(BackendKind::Mjpeg)).await);
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Failed)
    );
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Mjpeg),
        Some(BackendState::Active)
    );

    let after = orchestrator.stream_uri("main").unwrap();
    assert_ne!(before, after);
    assert_eq!(relay.stops.load(Ordering::SeqCst), 1);
    assert_eq!(mjpeg.starts(), 1);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_failure_tries_next() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    relay.fail_start.store(true, Ordering::SeqCst);
    orchestrator.start().await.unwrap();

    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Mjpeg));
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Failed)
    );

    let stats = orchestrator.stats();
    let relay_stats = stats
        .profile("main")
        .and_then(|p| p.backends.iter().find(|b| b.kind == BackendKind::Relay))
        .unwrap();
    assert!(relay_stats.last_error.is_some());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_readiness_timeout_counts_as_failure() {
    let (relay, relay_ctl) = FakeProvider::shared(BackendKind::Relay, 1);
    let (mjpeg, _) = FakeProvider::shared(BackendKind::Mjpeg, 3);
    relay_ctl.start_delay_ms.store(1_000, Ordering::SeqCst);

    let mut settings = fast_settings();
    settings.readiness_timeout = Duration::from_millis(50);

    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(relay)
        .provider(mjpeg)
        .settings(settings)
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Mjpeg));
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Failed)
    );

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_backend_discards_frames() {
    let (orchestrator, relay, mjpeg) = two_tier();
    relay.unavailable.store(true, Ordering::SeqCst);
    mjpeg.unavailable.store(true, Ordering::SeqCst);
    orchestrator.start().await.unwrap();

    assert!(orchestrator.active_backend("main").is_none());
    assert!(matches!(
        orchestrator.stream_uri("main"),
        Err(VcamError::Backend(BackendError::NoActiveBackend(_)))
    ));

    for id in 0..5 {
        orchestrator.publish("main", &frame(id)).unwrap();
    }

    let stats = orchestrator.stats();
    let main = stats.profile("main").unwrap();
    assert_eq!(main.frames_published, 5);
    assert_eq!(main.frames_discarded, 5);
    assert_eq!(stats.frames_dropped, 5);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_reprobe_picks_up_recovered_backend() {
    let (orchestrator, relay, mjpeg) = two_tier();
    relay.unavailable.store(true, Ordering::SeqCst);
    mjpeg.unavailable.store(true, Ordering::SeqCst);
    orchestrator.start().await.unwrap();
    assert!(orchestrator.active_backend("main").is_none());

    mjpeg.unavailable.store(false, Ordering::SeqCst);
    orchestrator.reprobe().await;
    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Mjpeg));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_never_blocks_on_stalled_backend() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    relay.stall.store(true, Ordering::SeqCst);
    orchestrator.start().await.unwrap();

    let started = Instant::now();
    for id in 0..100 {
        orchestrator.publish_all(&frame(id));
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = orchestrator.stats();
    let main = stats.profile("main").unwrap();
    assert_eq!(main.frames_published, 100);
    assert_eq!(main.frames_dropped(), 96);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_frames_reach_active_backend() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    orchestrator.start().await.unwrap();

    for id in 0..3 {
        orchestrator.publish("main", &frame(id)).unwrap();
        assert!(wait_until(|| relay.consumed.load(Ordering::SeqCst) > id).await);
    }

    let stats = orchestrator.stats();
    assert_eq!(stats.frames_delivered, 3);
    assert!(orchestrator.publish("ghost", &frame(9)).is_err());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_apply_invalid_profile_is_rejected() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    orchestrator.start().await.unwrap();

    let mut bad = test_profile("main");
    bad.width = 0;
    let outcome = orchestrator.apply_profile(bad).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome {
            restart_needed: true,
            restarted: false
        }
    );
    assert_eq!(orchestrator.profile("main").unwrap().width, 64);
    assert_eq!(relay.starts(), 1);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_apply_valid_profile_restarts() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    orchestrator.start().await.unwrap();

    let unchanged = orchestrator.apply_profile(test_profile("main")).await.unwrap();
    assert_eq!(unchanged, ApplyOutcome::unchanged());

    let mut wider = test_profile("main");
    wider.width = 128;
    wider.height = 72;
    let outcome = orchestrator.apply_profile(wider).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome {
            restart_needed: true,
            restarted: true
        }
    );
    assert_eq!(relay.starts(), 2);
    assert_eq!(relay.last_profile.lock().as_ref().map(|p| p.width), Some(128));
    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Relay));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_restart_restores_previous_profile() {
    let (relay, relay_ctl) = FakeProvider::shared(BackendKind::Relay, 1);
    relay_ctl.reject_width.store(128, Ordering::SeqCst);

    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(relay)
        .settings(fast_settings())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let mut wider = test_profile("main");
    wider.width = 128;
    let outcome = orchestrator.apply_profile(wider).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome {
            restart_needed: true,
            restarted: false
        }
    );
    assert_eq!(orchestrator.profile("main").unwrap().width, 64);
    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Relay));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_failed_apply_restores_latest_profile() {
    let (relay, relay_ctl) = FakeProvider::shared(BackendKind::Relay, 1);
    relay_ctl.reject_width.store(128, Ordering::SeqCst);

    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(relay)
        .settings(fast_settings())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();
    relay_ctl.start_delay_ms.store(30, Ordering::SeqCst);

    let with_width = |width| {
        let mut profile = test_profile("main");
        profile.width = width;
        profile
    };

    // The first apply holds the profile while the other two queue behind it
    let (first, second, rejected) = tokio::join!(
        orchestrator.apply_profile(with_width(96)),
        orchestrator.apply_profile(with_width(112)),
        orchestrator.apply_profile(with_width(128)),
    );

    assert!(first.unwrap().restarted);
    assert!(second.unwrap().restarted);
    assert!(!rejected.unwrap().restarted);
    assert_eq!(orchestrator.profile("main").unwrap().width, 112);
    assert_eq!(relay_ctl.last_profile.lock().as_ref().map(|p| p.width), Some(112));
    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Relay));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_backend_is_retried_after_interval() {
    let (relay, relay_ctl) = FakeProvider::shared(BackendKind::Relay, 1);
    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(relay)
        .settings(PipelineSettings {
            retry_interval: Duration::from_millis(50),
            ..fast_settings()
        })
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(relay_ctl.starts(), 1);

    relay_ctl.trigger_failure("transient encoder crash");

    assert!(wait_until(|| relay_ctl.starts() == 2).await);
    assert!(wait_until(|| orchestrator.active_backend("main") == Some(BackendKind::Relay)).await);
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Active)
    );
    assert_eq!(orchestrator.stream_uri("main").unwrap(), "fake://relay/main");

    let consumed = relay_ctl.consumed.load(Ordering::SeqCst);
    for id in 0..3 {
        orchestrator.publish("main", &frame(id)).unwrap();
    }
    assert!(wait_until(|| relay_ctl.consumed.load(Ordering::SeqCst) >= consumed + 3).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_failure_is_ignored() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    orchestrator.start().await.unwrap();
    let retired = relay.last_ctx.lock().clone().unwrap();

    let mut faster = test_profile("main");
    faster.fps = 15;
    orchestrator.apply_profile(faster).await.unwrap();

    retired.fail("late report from the old worker");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(orchestrator.active_backend("main"), Some(BackendKind::Relay));
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Active)
    );

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_encode_errors_degrade_then_fail() {
    let (orchestrator, relay, _mjpeg) = two_tier();
    orchestrator.start().await.unwrap();
    let ctx = relay.last_ctx.lock().clone().unwrap();

    ctx.encode_error("glitch");
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Degraded)
    );
    assert!(orchestrator.stream_uri("main").is_ok());

    ctx.delivered();
    assert_eq!(
        orchestrator.backend_state("main", BackendKind::Relay),
        Some(BackendState::Active)
    );

    for _ in 0..3 {
        ctx.encode_error("broken");
    }
    assert!(wait_until(|| orchestrator.active_backend("main") == Some(BackendKind::Mjpeg)).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_builder_rejects_duplicate_tokens() {
    let result = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .profile(test_profile("main"))
        .build();
    assert!(result.is_err());

    assert!(StreamOrchestrator::builder().build().is_err());
}

#[tokio::test]
async fn test_mjpeg_backend_serves_latest_jpeg() {
    let hub = MjpegHub::new();
    let provider = Arc::new(MjpegProvider::new(hub.clone(), 80, "http://10.0.0.5:8080"));
    let orchestrator = StreamOrchestrator::builder()
        .profile(test_profile("main"))
        .provider(provider)
        .settings(fast_settings())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    assert_eq!(
        orchestrator.stream_uri("main").unwrap(),
        "http://10.0.0.5:8080/mjpeg/main"
    );

    let mut frames = hub.subscribe("main").unwrap();
    let big = FrameData::test_pattern(42, 128, 72);
    orchestrator.publish("main", &big).unwrap();

    tokio::time::timeout(Duration::from_secs(5), frames.wait_for(|f| f.is_some()))
        .await
        .unwrap()
        .unwrap();
    let jpeg = frames.borrow().clone().unwrap();
    assert_eq!(jpeg.id, 42);
    assert_eq!(&jpeg.data[..2], &[0xFF, 0xD8]);

    orchestrator.stop().await.unwrap();
    assert!(!hub.is_open("main"));
}

#[tokio::test]
async fn test_native_serves_rtsp_per_profile() {
    let native = NativeProvider::new(8600, "10.0.0.5", &["main".to_string(), "sub".to_string()]);
    assert_eq!(native.port_for("sub"), Some(8601));
    assert_eq!(
        native.uri_for("sub").as_deref(),
        Some("rtsp://10.0.0.5:8601/sub")
    );
    assert!(native.uri_for("missing").is_none());

    if cfg!(not(all(feature = "native_transport", target_os = "linux"))) {
        assert!(!native.probe().await.is_available());
    }
}

#[cfg(unix)]
mod process {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exit_code_is_observed() {
        let process = ManagedProcess::start("sh", &args(&["-c", "exit 3"])).unwrap();
        let exit = process.wait_exit(Duration::from_secs(5)).await;

        assert_eq!(exit, Some(ProcessExit { code: Some(3) }));
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(3));

        // Already exited: answered without waiting
        assert_eq!(
            process.wait_exit(Duration::ZERO).await,
            Some(ProcessExit { code: Some(3) })
        );
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let mut process = ManagedProcess::start("sleep", &args(&["30"])).unwrap();
        assert!(process.is_alive());
        assert!(process.wait_exit(Duration::from_millis(100)).await.is_none());

        process.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let process = ManagedProcess::start(
            "sh",
            &args(&["-c", "echo 'Unknown encoder h264_nvenc' >&2; sleep 5"]),
        )
        .unwrap();

        assert!(wait_until(|| process.stderr_match(&["unknown encoder"]).is_some()).await);
        assert!(process.stderr_match(&["segmentation fault"]).is_none());
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let result = ManagedProcess::start("/nonexistent/vcam-encoder", &[]);
        assert!(matches!(
            result,
            Err(VcamError::Backend(BackendError::ChildProcess { .. }))
        ));
    }

    #[tokio::test]
    async fn test_frames_written_to_stdin() {
        let mut process = ManagedProcess::start("cat", &[]).unwrap();
        let mut stdin = process.take_stdin().unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stdin, b"frame").await.unwrap();
        drop(stdin);

        let exit = process.wait_exit(Duration::from_secs(5)).await;
        assert_eq!(exit, Some(ProcessExit { code: Some(0) }));
    }
}

#[test]
fn test_frame_timestamp_preserved() {
    let original = FrameData::new(5, SystemTime::UNIX_EPOCH, vec![0; 64 * 36 * 3], 64, 36);
    let fitted = original.fit_to(32, 18).unwrap();
    assert_eq!(fitted.timestamp, SystemTime::UNIX_EPOCH);
    assert_eq!(fitted.id, 5);
}
