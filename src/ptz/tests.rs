use super::*;
use crate::error::VcamError;
use crate::frame::FrameData;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<String>>,
}

impl PtzHardwareHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recorder"
    }

    fn set_position(&self, position: PtzPosition) -> crate::error::Result<()> {
        self.calls.lock().push(format!(
            "position {:.2} {:.2} {:.2}",
            position.pan, position.tilt, position.zoom
        ));
        Ok(())
    }

    fn set_velocity(&self, velocity: PtzVelocity) -> crate::error::Result<()> {
        self.calls.lock().push(format!(
            "velocity {:.2} {:.2} {:.2}",
            velocity.pan, velocity.tilt, velocity.zoom
        ));
        Ok(())
    }

    fn stop(&self) -> crate::error::Result<()> {
        self.calls.lock().push("stop".to_string());
        Ok(())
    }
}

struct FailingHandler;

impl PtzHardwareHandler for FailingHandler {
    fn set_position(&self, _: PtzPosition) -> crate::error::Result<()> {
        Err(VcamError::component("servo", "offline"))
    }

    fn set_velocity(&self, _: PtzVelocity) -> crate::error::Result<()> {
        Err(VcamError::component("servo", "offline"))
    }

    fn stop(&self) -> crate::error::Result<()> {
        Err(VcamError::component("servo", "offline"))
    }
}

fn in_range(state: &PtzState) -> bool {
    let p = state.position;
    (-1.0..=1.0).contains(&p.pan) && (-1.0..=1.0).contains(&p.tilt) && (0.0..=1.0).contains(&p.zoom)
}

#[test]
fn test_position_stays_in_range_for_any_input() {
    let engine = PtzEngine::new(PtzLimits::default());
    let inputs = [
        -1000.0, -2.0, -1.0, -0.3, 0.0, 0.7, 1.0, 5.0, f32::INFINITY, f32::NEG_INFINITY, f32::NAN,
    ];

    for &pan in &inputs {
        for &zoom in &inputs {
            let state = engine.continuous_move(pan, -pan, zoom);
            assert!(in_range(&state));
            assert!(state.velocity.pan.abs() <= 1.0 && state.velocity.zoom.abs() <= 1.0);

            for _ in 0..3 {
                assert!(in_range(&engine.tick(Duration::from_millis(700))));
            }

            assert!(in_range(&engine.absolute_move(PtzPosition { pan, tilt: zoom, zoom: pan })));
            assert!(in_range(&engine.relative_move(pan, zoom, -pan)));
        }
    }
}

#[test]
fn test_continuous_move_scenario() {
    let engine = PtzEngine::new(PtzLimits::default());

    let state = engine.continuous_move(0.5, 0.0, 0.0);
    assert!(state.is_moving());

    for _ in 0..4 {
        engine.tick(Duration::from_millis(500));
    }
    let state = engine.snapshot();
    assert_eq!(state.position.pan, 1.0);

    // A held command at the edge is a no-op, not an automatic stop
    let state = engine.tick(Duration::from_secs(1));
    assert_eq!(state.position.pan, 1.0);
    assert_eq!(state.velocity.pan, 0.5);
    assert!(state.is_moving());

    let state = engine.stop();
    assert_eq!(state.position.pan, 1.0);

    let status = engine.status();
    assert_eq!(status.position, PtzPosition::new(1.0, 0.0, 0.0));
    assert!(!status.moving);
}

#[test]
fn test_zero_move_is_idle() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.continuous_move(0.2, 0.0, 0.0);
    assert!(!engine.continuous_move(0.0, 0.0, 0.0).is_moving());
}

#[test]
fn test_advance_uses_frame_clock() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.continuous_move(0.0, 0.0, 0.25);

    let start = Instant::now();
    assert_eq!(engine.advance(start).position.zoom, 0.0);
    let state = engine.advance(start + Duration::from_secs(1));
    assert!((state.position.zoom - 0.25).abs() < 1e-6);

    // Long stalls are capped at one second
    let state = engine.advance(start + Duration::from_secs(30));
    assert!((state.position.zoom - 0.5).abs() < 1e-6);
}

#[test]
fn test_goto_unknown_preset_leaves_state() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.absolute_move(PtzPosition::new(0.3, -0.2, 0.4));
    engine.continuous_move(0.1, 0.0, 0.0);
    let before = engine.snapshot();

    let err = engine.goto_preset("missing").unwrap_err();
    assert!(matches!(err, VcamError::NotFound { kind: "preset", .. }));

    let after = engine.snapshot();
    assert_eq!(before.position, after.position);
    assert_eq!(before.velocity, after.velocity);
}

#[test]
fn test_save_then_goto_restores_position() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.absolute_move(PtzPosition::new(0.37, -0.81, 0.66));
    let preset = engine.save_preset(Some("door"), Some("Front door")).unwrap();
    assert_eq!(preset.token, "door");

    engine.home();
    engine.continuous_move(1.0, 1.0, 1.0);

    let position = engine.goto_preset("door").unwrap();
    assert_eq!(position, PtzPosition::new(0.37, -0.81, 0.66));

    let state = engine.snapshot();
    assert_eq!(state.position, position);
    assert!(!state.is_moving());
}

#[test]
fn test_save_preset_overwrites_and_generates_tokens() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.save_preset(Some("a"), Some("First")).unwrap();
    engine.absolute_move(PtzPosition::new(0.5, 0.0, 0.0));
    let again = engine.save_preset(Some("a"), None).unwrap();

    assert_eq!(again.name, "First");
    assert_eq!(again.pan, 0.5);
    assert_eq!(engine.presets().iter().filter(|p| p.token == "a").count(), 1);

    let generated = engine.save_preset(None, Some("Auto")).unwrap();
    assert!(generated.token.starts_with("preset_"));
    assert_eq!(generated.token.len(), "preset_".len() + 8);
    assert!(engine.preset(&generated.token).is_some());
}

#[test]
fn test_remove_preset() {
    let engine = PtzEngine::new(PtzLimits::default());
    engine.save_preset(Some("gate"), None).unwrap();

    engine.remove_preset("gate").unwrap();
    assert!(engine.preset("gate").is_none());
    assert!(matches!(
        engine.remove_preset("gate"),
        Err(VcamError::NotFound { .. })
    ));
}

#[test]
fn test_hardware_handlers_notified_on_commands() {
    let recorder = Arc::new(RecordingHandler::default());
    let engine = PtzEngineBuilder::new()
        .handler(recorder.clone())
        .handler(Arc::new(FailingHandler))
        .build()
        .unwrap();
    assert_eq!(engine.handler_count(), 2);

    engine.continuous_move(0.5, -0.5, 0.0);
    engine.tick(Duration::from_millis(100));
    engine.stop();
    engine.absolute_move(PtzPosition::new(0.25, 0.0, 0.5));
    engine.goto_preset("home").unwrap();

    let calls = recorder.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            "velocity 0.50 -0.50 0.00".to_string(),
            "stop".to_string(),
            "position 0.25 0.00 0.50".to_string(),
            "position 0.00 0.00 0.00".to_string(),
        ]
    );
}

#[test]
fn test_preset_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presets").join("ptz_presets.json");

    let engine = PtzEngineBuilder::new()
        .store(PresetStore::new(&path))
        .build()
        .unwrap();
    assert!(path.exists());
    assert!(engine.preset("home").is_some());

    engine.absolute_move(PtzPosition::new(-0.5, 0.25, 0.75));
    engine.save_preset(Some("driveway"), Some("Driveway")).unwrap();

    let reloaded = PtzEngineBuilder::new()
        .store(PresetStore::new(&path))
        .build()
        .unwrap();
    let preset = reloaded.preset("driveway").unwrap();
    assert_eq!(preset.name, "Driveway");
    assert_eq!(preset.position(), PtzPosition::new(-0.5, 0.25, 0.75));

    let raw = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["driveway"]["pan"], -0.5);
}

#[test]
fn test_corrupt_preset_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ptz_presets.json");
    std::fs::write(&path, "not json").unwrap();

    assert!(PtzEngineBuilder::new()
        .store(PresetStore::new(&path))
        .build()
        .is_err());
}

#[test]
fn test_transform_home_returns_same_frame() {
    let frame = FrameData::test_pattern(1, 64, 36);
    let out = transform(&frame, &PtzPosition::HOME, &PtzLimits::default()).unwrap();

    assert!(Arc::ptr_eq(&frame.data, &out.data));
    assert_eq!(out.dimensions(), (64, 36));
}

#[test]
fn test_transform_disabled_returns_same_frame() {
    let frame = FrameData::test_pattern(1, 64, 36);
    let limits = PtzLimits {
        digital: false,
        ..PtzLimits::default()
    };
    let out = transform(&frame, &PtzPosition::new(0.5, 0.5, 1.0), &limits).unwrap();
    assert!(Arc::ptr_eq(&frame.data, &out.data));
}

#[test]
fn test_transform_is_deterministic() {
    let frame = FrameData::test_pattern(9, 80, 60);
    let position = PtzPosition::new(0.3, -0.6, 0.45);
    let limits = PtzLimits::default();

    let a = transform(&frame, &position, &limits).unwrap();
    let b = transform(&frame, &position, &limits).unwrap();
    assert_eq!(a.data, b.data);
    assert_eq!(a.dimensions(), (80, 60));
}

#[test]
fn test_transform_output_size() {
    let frame = FrameData::test_pattern(2, 80, 60);
    let limits = PtzLimits {
        output: Some((40, 30)),
        ..PtzLimits::default()
    };
    let out = transform(&frame, &PtzPosition::new(0.0, 0.0, 0.5), &limits).unwrap();
    assert_eq!(out.dimensions(), (40, 30));
    assert!(out.is_valid());
}

#[test]
fn test_transform_rejects_invalid_frame() {
    let frame = FrameData::new(1, std::time::SystemTime::now(), vec![0; 5], 4, 4);
    assert!(transform(&frame, &PtzPosition::new(0.1, 0.0, 0.0), &PtzLimits::default()).is_err());
}

#[test]
fn test_crop_shrinks_with_zoom() {
    let limits = PtzLimits::default();
    let mut last = u32::MAX;
    for step in 0..=10 {
        let zoom = step as f32 / 10.0;
        let rect = crop_rect(1920, 1080, &PtzPosition::new(0.0, 0.0, zoom), &limits);
        assert!(rect.width <= last);
        last = rect.width;
    }

    let full = crop_rect(1920, 1080, &PtzPosition::new(0.0, 0.0, 1.0), &limits);
    assert_eq!((full.width, full.height), (480, 270));
    assert_eq!((full.x, full.y), (720, 405));
}

#[test]
fn test_crop_offsets_follow_pan_and_tilt() {
    let limits = PtzLimits::default();

    let right_up = crop_rect(1920, 1080, &PtzPosition::new(1.0, 1.0, 1.0), &limits);
    assert_eq!(right_up.x + right_up.width, 1920);
    assert_eq!(right_up.y, 0);

    let left_down = crop_rect(1920, 1080, &PtzPosition::new(-1.0, -1.0, 1.0), &limits);
    assert_eq!(left_down.x, 0);
    assert_eq!(left_down.y + left_down.height, 1080);

    // No zoom means no slack, so pan cannot move the crop
    let flat = crop_rect(1920, 1080, &PtzPosition::new(1.0, -1.0, 0.0), &limits);
    assert_eq!(flat, CropRect { x: 0, y: 0, width: 1920, height: 1080 });
}

#[test]
fn test_crop_never_leaves_source() {
    let limits = PtzLimits {
        max_zoom: 8.0,
        ..PtzLimits::default()
    };
    for pan in [-1.0, -0.5, 0.0, 0.5, 1.0] {
        for zoom in [0.0, 0.3, 0.9, 1.0] {
            let rect = crop_rect(33, 17, &PtzPosition::new(pan, -pan, zoom), &limits);
            assert!(rect.width >= 1 && rect.height >= 1);
            assert!(rect.x + rect.width <= 33);
            assert!(rect.y + rect.height <= 17);
        }
    }
}
