//! Integration tests for the DemoAdapter

use gst_adapters::demo::{CAR_ORDINAL, GEAR_RATIOS, REV_LIMIT};
use gst_adapters::DemoAdapter;
use gst_core::gear::{derive_gear_ratio, GearState};
use gst_core::{EngineEvent, Sample, SampleSource, ShiftConfig, ShiftEngine};

fn drive(count: usize) -> Vec<Sample> {
    let mut adapter = DemoAdapter::new();
    adapter.start().expect("start() should succeed");
    (0..count)
        .map(|i| {
            adapter
                .read_sample()
                .expect("read_sample() should not error")
                .unwrap_or_else(|| panic!("Sample {} should be Some", i))
        })
        .collect()
}

#[test]
fn test_demo_adapter_name() {
    let adapter = DemoAdapter::new();
    assert_eq!(adapter.name(), "Demo");
}

#[test]
fn test_demo_adapter_initially_inactive() {
    let adapter = DemoAdapter::new();
    assert!(
        !adapter.is_active(),
        "DemoAdapter should be inactive before start()"
    );
}

#[test]
fn test_demo_adapter_read_sample_when_inactive_returns_none() {
    let mut adapter = DemoAdapter::new();
    let sample = adapter.read_sample().unwrap();
    assert!(
        sample.is_none(),
        "read_sample() should return None when adapter is inactive"
    );
}

#[test]
fn test_demo_adapter_start_and_stop() {
    let mut adapter = DemoAdapter::new();

    adapter.start().expect("start() should succeed");
    assert!(adapter.is_active(), "Adapter should be active after start()");

    adapter.stop().expect("stop() should succeed");
    assert!(
        !adapter.is_active(),
        "Adapter should be inactive after stop()"
    );
    assert!(adapter.read_sample().unwrap().is_none());
}

#[test]
fn test_demo_adapter_default_trait() {
    let adapter = DemoAdapter::default();
    assert_eq!(adapter.name(), "Demo");
    assert!(!adapter.is_active());
}

#[test]
fn test_demo_adapter_first_sample() {
    let sample = drive(1).remove(0);

    assert_eq!(sample.index, 0);
    assert_eq!(sample.gear, 1);
    assert_eq!(sample.car_ordinal, CAR_ORDINAL);
    assert_eq!(sample.gear_count, Some(6));
    assert!(sample.on_track);
    assert!(sample.throttle.is_full());
    assert!(sample.clutch_engaged());
}

#[test]
fn test_demo_adapter_indices_increase() {
    let samples = drive(5);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.index, i as u64);
    }
}

#[test]
fn test_demo_adapter_restart_replays_cycle() {
    let first = drive(300);
    let second = drive(300);
    assert_eq!(first, second, "The drive cycle should be deterministic");
}

#[test]
fn test_demo_adapter_values_in_reasonable_range() {
    for sample in drive(4000) {
        let rpm = sample.rpm.0;
        assert!(
            rpm > 0.0 && rpm <= REV_LIMIT,
            "RPM {} at sample {} should be within the rev limit",
            rpm,
            sample.index
        );
        assert!(
            (1..=6).contains(&sample.gear),
            "Gear {} should be between 1 and 6",
            sample.gear
        );
        assert!(sample.speed.0 >= 0.0);
        for pedal in [sample.throttle, sample.brake, sample.clutch] {
            assert!((0.0..=1.0).contains(&pedal.0));
        }
    }
}

#[test]
fn test_demo_adapter_rpm_matches_wheels_when_engaged() {
    for sample in drive(4000) {
        if !sample.clutch_engaged() {
            continue;
        }
        let Some(ratio) = derive_gear_ratio(&sample, 3.0) else {
            continue;
        };
        let expected = GEAR_RATIOS[(sample.gear - 1) as usize] as f64;
        assert!(
            ((ratio - expected) / expected).abs() < 1e-4,
            "Sample {} in gear {}: ratio {} should be {}",
            sample.index,
            sample.gear,
            ratio,
            expected
        );
    }
}

#[test]
fn test_demo_adapter_cycle_contains_coast_and_limiter() {
    let samples = drive(3000);

    let coasting = samples
        .iter()
        .filter(|s| s.clutch_disengaged() && s.throttle.is_zero() && s.brake.is_zero())
        .count();
    assert!(coasting >= 300, "Expected a long coast, got {} samples", coasting);

    let at_limiter = samples.iter().filter(|s| s.rpm.0 == REV_LIMIT).count();
    assert!(at_limiter >= 15, "Expected limiter bounce, got {} samples", at_limiter);

    let out_of_gear = samples.iter().filter(|s| !s.in_gear).count();
    assert!(out_of_gear > 0, "Upshifts should show samples out of gear");
}

#[test]
fn test_demo_adapter_sample_serializes_to_json() {
    let sample = drive(1).remove(0);

    let json = serde_json::to_string(&sample).expect("Sample should serialize to JSON");
    let parsed: serde_json::Value =
        serde_json::from_str(&json).expect("JSON should be parseable");
    assert_eq!(parsed["gear"], 1);
    assert_eq!(parsed["car_ordinal"], CAR_ORDINAL);
}

#[test]
fn test_engine_learns_demo_car() {
    let mut engine = ShiftEngine::new(ShiftConfig::default());
    let mut cues = Vec::new();
    let mut events = Vec::new();

    for sample in drive(6000) {
        let out = engine.process(&sample);
        cues.extend(out.cue);
        events.extend(out.events);
    }

    assert_eq!(engine.car_ordinal(), Some(CAR_ORDINAL));

    let curve = engine.curve().expect("A curve should be built from the pulls");
    assert_eq!(curve.revlimit(), REV_LIMIT as f64);
    assert_eq!(curve.rpm().last().copied(), Some(REV_LIMIT as f64));

    for (i, expected) in GEAR_RATIOS.iter().enumerate() {
        let gear = engine.gears().gear(i + 1).expect("gear should exist");
        assert!(
            gear.state() >= GearState::Locked,
            "Gear {} should be locked",
            i + 1
        );
        let ratio = gear.ratio().expect("locked gear should have a ratio");
        assert!((ratio - *expected as f64).abs() < 1e-3);
    }

    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ShiftRpmCalculated { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ShiftObserved { .. })));

    assert!(!cues.is_empty(), "Cues should fire on the way to the limit");
    assert!(
        cues.iter().all(|c| c.gear < 6),
        "No cue should fire in top gear"
    );
}
