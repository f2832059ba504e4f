//! Acquisition engine driven against the mock instruments.

use async_trait::async_trait;
use daq_core::capabilities::LockIn;
use daq_core::data::ChannelSample;
use daq_core::error::DaqError;
use daq_driver_mock::{
    magnet_limits, smbv_limits, ErrorConfig, ErrorScenario, MockLockIn, MockMagnet,
    MockMicrowaveSource, MockMode,
};
use daq_experiment::{
    AcquisitionEngine, AcquisitionState, EngineConfig, EngineEvent, MeasurementSettings, ScanPlan,
    StopReason, SweepRequest,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn counting_lockin() -> MockLockIn {
    MockLockIn::builder()
        .generator(|index, _| [index as f64 + 1.0; 4])
        .build()
}

fn quick_config() -> EngineConfig {
    EngineConfig {
        retry_backoff: Duration::ZERO,
        ..EngineConfig::default()
    }
}

fn frequency_plan(
    start: f64,
    step: f64,
    stop: f64,
    repeats: usize,
    accumulations: usize,
) -> ScanPlan {
    let axis = SweepRequest::Frequency {
        start,
        step,
        stop,
        fixed_field: 3480.0,
        power: -30.0,
    }
    .normalize(&smbv_limits(), &magnet_limits())
    .unwrap();
    ScanPlan::new(axis, repeats, accumulations, Duration::ZERO).unwrap()
}

struct Rig {
    engine: Arc<AcquisitionEngine>,
    microwave: Arc<MockMicrowaveSource>,
    magnet: Arc<MockMagnet>,
}

fn rig(
    microwave: MockMicrowaveSource,
    magnet: MockMagnet,
    lockin: Arc<dyn LockIn>,
    config: EngineConfig,
) -> Rig {
    let microwave = Arc::new(microwave);
    let magnet = Arc::new(magnet);
    let engine = Arc::new(AcquisitionEngine::new(
        microwave.clone(),
        magnet.clone(),
        lockin,
        config,
    ));
    Rig {
        engine,
        microwave,
        magnet,
    }
}

fn default_rig(lockin: MockLockIn) -> Rig {
    rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        Arc::new(lockin),
        quick_config(),
    )
}

/// Holds the read with the given index until released.
struct GatedLockIn {
    inner: MockLockIn,
    gate_at: u64,
    reads: AtomicU64,
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl LockIn for GatedLockIn {
    async fn read_sample(&self) -> anyhow::Result<ChannelSample> {
        if self.reads.fetch_add(1, Ordering::SeqCst) == self.gate_at {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.read_sample().await
    }

    async fn time_constants(&self) -> anyhow::Result<Vec<f64>> {
        self.inner.time_constants().await
    }

    async fn set_time_constants(&self, tau_a: f64, tau_b: f64) -> anyhow::Result<(f64, f64)> {
        self.inner.set_time_constants(tau_a, tau_b).await
    }
}

#[tokio::test]
async fn test_full_run_fills_every_sample() {
    let lockin = Arc::new(counting_lockin());
    let Rig {
        engine, microwave, ..
    } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        lockin.clone(),
        quick_config(),
    );

    let plan = frequency_plan(2800e6, 2e6, 2949e6, 2, 10);
    assert_eq!(plan.axis.grid().stop, 2950e6);
    assert_eq!(plan.point_count(), 76);
    assert_eq!(plan.total_samples(), 1520);

    let reason = engine.run_plan(plan).await.unwrap();
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(lockin.read_count(), 1520);

    let cube = engine.raw_data().await.unwrap();
    assert_eq!(cube.len(), 1520 * 4);
    assert!(cube.as_slice().iter().all(|v| *v >= 1.0));

    // 75 steps per sweep, one reset at start and one per wrap
    assert_eq!(microwave.trigger_count(), 150);
    assert_eq!(microwave.reset_count(), 3);
    assert_eq!(microwave.frequency(), 2800e6);

    let series = engine.current_series();
    assert_eq!(series.len(), 76);
    assert_eq!(series.x()[75], 2950e6);
}

#[tokio::test]
async fn test_persistently_invalid_sample_faults_run() {
    // Valid readings for points 0..=4, then nothing but zeros
    let lockin = MockLockIn::builder()
        .generator(|index, _| {
            if index < 5 {
                [index as f64 + 1.0; 4]
            } else {
                [0.0; 4]
            }
        })
        .build();
    let Rig { engine, .. } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        Arc::new(lockin),
        EngineConfig {
            max_sample_retries: 3,
            ..quick_config()
        },
    );

    let plan = frequency_plan(2.8e9, 1e6, 2.809e9, 1, 1);
    assert_eq!(plan.point_count(), 10);

    let err = engine.run_plan(plan).await.unwrap_err();
    assert!(matches!(err, DaqError::SampleInvalid { point: 5, attempts: 4 }));
    assert_eq!(engine.state(), AcquisitionState::Faulted);
    assert_eq!(engine.stop_reason(), None);
    assert!(engine.last_fault().is_some());

    let series = engine.current_series();
    assert_eq!(series.len(), 10);
    for point in 0..5 {
        assert_eq!(series.get(point), Some(&[point as f64 + 1.0; 4]));
    }
    for point in 5..10 {
        assert_eq!(series.get(point), Some(&[0.0; 4]));
    }
}

#[tokio::test]
async fn test_transient_invalid_samples_are_reread() {
    // Every even read is below the noise floor, the odd reads carry 1, 3, 5, ...
    let lockin = Arc::new(
        MockLockIn::builder()
            .generator(|index, _| {
                if index % 2 == 0 {
                    [0.0; 4]
                } else {
                    [index as f64; 4]
                }
            })
            .build(),
    );
    let Rig { engine, .. } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        lockin.clone(),
        EngineConfig {
            max_sample_retries: 1,
            ..quick_config()
        },
    );
    let mut events = engine.subscribe();

    engine
        .start(frequency_plan(1e9, 1e6, 1.004e9, 1, 1))
        .await
        .unwrap();
    assert_eq!(engine.join().await.unwrap(), StopReason::Completed);

    assert_eq!(lockin.read_count(), 10);
    let counters = engine.counters();
    assert_eq!((counters.samples, counters.retries), (5, 5));

    let series = engine.current_series();
    for (point, expected) in [1.0, 3.0, 5.0, 7.0, 9.0].into_iter().enumerate() {
        assert_eq!(series.get(point), Some(&[expected; 4]));
    }
    let cube = engine.raw_data().await.unwrap();
    assert!(cube.as_slice().iter().all(|v| *v >= 1.0));

    // Recovered reads never reach observers as a fault
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(
            event,
            EngineEvent::StateChanged(AcquisitionState::Faulted)
        ));
    }
    assert!(engine.last_fault().is_none());

    let record = engine.run_record().await.unwrap();
    assert!(record
        .parameters
        .iter()
        .any(|(k, v)| k == "Sample Retries" && v == "5"));
}

#[tokio::test]
async fn test_start_alone_runs_to_completion() {
    let lockin = Arc::new(counting_lockin());
    let Rig {
        engine, microwave, ..
    } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        lockin.clone(),
        quick_config(),
    );

    engine
        .start(frequency_plan(1e9, 1e6, 1.004e9, 1, 1))
        .await
        .unwrap();
    // No tick, run or join from the host: the engine acquires on its own
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.state().is_active() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(engine.stop_reason(), Some(StopReason::Completed));
    assert_eq!(lockin.read_count(), 5);
    assert_eq!(microwave.trigger_count(), 4);
}

#[tokio::test]
async fn test_stop_mid_accumulation_keeps_in_flight_read() {
    // Read 123 is the fourth accumulation of point 12
    let lockin = Arc::new(GatedLockIn {
        inner: counting_lockin(),
        gate_at: 123,
        reads: AtomicU64::new(0),
        reached: Notify::new(),
        release: Notify::new(),
    });
    let Rig { engine, .. } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        lockin.clone(),
        quick_config(),
    );

    engine
        .start(frequency_plan(2.8e9, 1e6, 2.819e9, 1, 10))
        .await
        .unwrap();

    lockin.reached.notified().await;
    let position = engine.position();
    assert_eq!((position.point, position.accumulation), (12, 3));

    engine.request_stop();
    assert_eq!(engine.state(), AcquisitionState::StoppingAfterPoint);
    lockin.release.notify_one();

    let reason = engine.join().await.unwrap();
    assert_eq!(reason, StopReason::CancelledByUser);
    assert_eq!(engine.state(), AcquisitionState::Stopped);

    let position = engine.position();
    assert_eq!((position.repeat, position.point, position.accumulation), (0, 12, 4));

    let series = engine.current_series();
    assert_eq!(series.len(), 20);
    assert_eq!(series.get(11), Some(&[115.5; 4]));
    assert_eq!(series.get(12), Some(&[0.0; 4]));

    // Nothing stored is lost, including the read that was in flight
    let cube = engine.raw_data().await.unwrap();
    for accumulation in 0..4 {
        assert_eq!(
            cube.sample(0, accumulation, 12),
            Some([121.0 + accumulation as f64; 4])
        );
    }
    assert_eq!(cube.sample(0, 4, 12), Some([0.0; 4]));
    assert_eq!(engine.current_progress().remaining_time, Duration::ZERO);
}

#[tokio::test]
async fn test_stop_after_sweep_only_at_wrap() {
    const POINTS: usize = 5;
    const ACCUMULATIONS: usize = 2;

    for ticks_before_request in 0..POINTS * ACCUMULATIONS {
        let lockin = Arc::new(counting_lockin());
        let Rig { engine, .. } = rig(
            MockMicrowaveSource::new(),
            MockMagnet::new(),
            lockin.clone(),
            quick_config(),
        );
        engine
            .arm(frequency_plan(1e9, 1e6, 1.004e9, 3, ACCUMULATIONS))
            .await
            .unwrap();

        for _ in 0..ticks_before_request {
            engine.tick().await.unwrap();
        }
        engine.request_stop_after_current_sweep();

        loop {
            let state = engine.tick().await.unwrap();
            if state == AcquisitionState::Stopped {
                break;
            }
            assert_eq!(state, AcquisitionState::StoppingAfterSweep);
        }

        assert_eq!(engine.stop_reason(), Some(StopReason::StoppedAfterSweep));
        let position = engine.position();
        assert_eq!(
            (position.repeat, position.point, position.accumulation),
            (1, 0, 0),
            "request after {} ticks",
            ticks_before_request
        );
        assert_eq!(lockin.read_count(), (POINTS * ACCUMULATIONS) as u64);
    }
}

#[tokio::test]
async fn test_stop_after_sweep_ignored_when_not_running() {
    let Rig { engine, .. } = default_rig(counting_lockin());
    engine.request_stop_after_current_sweep();
    assert_eq!(engine.state(), AcquisitionState::Idle);

    engine
        .run_plan(frequency_plan(1e9, 1e6, 1.002e9, 1, 1))
        .await
        .unwrap();
    engine.request_stop_after_current_sweep();
    engine.request_stop();
    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(engine.stop_reason(), Some(StopReason::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_remaining_time_reaches_zero_on_stop() {
    let Rig { engine, .. } = default_rig(counting_lockin());
    let mut events = engine.subscribe();

    let axis = frequency_plan(1e9, 1e6, 1.004e9, 1, 1).axis;
    let plan = ScanPlan::new(axis, 2, 2, Duration::from_millis(10)).unwrap();
    engine.arm(plan).await.unwrap();
    assert_eq!(
        engine.current_progress().remaining_time,
        Duration::from_millis(200)
    );
    engine.run().await.unwrap();

    let mut remaining = Vec::new();
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Progress(estimate) => remaining.push(estimate.remaining_time),
            EngineEvent::StateChanged(state) => states.push(state),
            EngineEvent::PointUpdated { series, .. } => assert_eq!(series.len(), 5),
        }
    }

    assert!(remaining.windows(2).all(|w| w[1] <= w[0]), "{:?}", remaining);
    assert_eq!(remaining.first(), Some(&Duration::from_millis(200)));
    assert_eq!(remaining.last(), Some(&Duration::ZERO));
    assert!(remaining[..remaining.len() - 1].iter().all(|r| !r.is_zero()));
    assert_eq!(states.first(), Some(&AcquisitionState::Running));
    assert_eq!(states.last(), Some(&AcquisitionState::Stopped));

    let progress = engine.current_progress();
    assert_eq!(progress.remaining_time, Duration::ZERO);
    assert_eq!(progress.completed_repeats, 2);
    assert_eq!(progress.fraction_complete(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_field_sweep_counts_magnet_rehoming() {
    let magnet = MockMagnet::builder().mode(MockMode::Realistic).build();
    let Rig { engine, magnet, .. } = rig(
        MockMicrowaveSource::new(),
        magnet,
        Arc::new(counting_lockin()),
        quick_config(),
    );

    let axis = SweepRequest::Field {
        start: 3400.0,
        step: 10.0,
        stop: 3420.0,
        fixed_frequency: 9.4e9,
        power: -20.0,
    }
    .normalize(&smbv_limits(), &magnet_limits())
    .unwrap();
    let plan = ScanPlan::new(axis, 2, 1, Duration::from_millis(100)).unwrap();
    engine.arm(plan).await.unwrap();

    // 300ms for this sweep, 300ms for the next, 1s of re-homing after each
    assert_eq!(
        engine.current_progress().remaining_time,
        Duration::from_millis(2600)
    );

    assert_eq!(engine.run().await.unwrap(), StopReason::Completed);
    assert_eq!(magnet.reset_count(), 3);
    assert_eq!(magnet.field(), 3400.0);
}

#[tokio::test]
async fn test_series_length_constant_through_run() {
    let Rig { engine, .. } = default_rig(counting_lockin());
    engine
        .arm(frequency_plan(1e9, 1e6, 1.006e9, 2, 3))
        .await
        .unwrap();

    assert_eq!(engine.current_series().len(), 7);
    while engine.state().is_active() {
        engine.tick().await.unwrap();
        assert_eq!(engine.current_series().len(), 7);
    }
    assert_eq!(engine.state(), AcquisitionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_lockin_times_out() {
    let lockin = MockLockIn::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::Stall {
            operation: "read",
            delay: Duration::from_secs(60),
        }))
        .build();
    let Rig { engine, .. } = rig(
        MockMicrowaveSource::new(),
        MockMagnet::new(),
        Arc::new(lockin),
        EngineConfig {
            call_timeout: Duration::from_secs(1),
            ..quick_config()
        },
    );

    let err = engine
        .run_plan(frequency_plan(1e9, 1e6, 1.002e9, 1, 1))
        .await
        .unwrap_err();
    match err {
        DaqError::HardwareComm(msg) => assert!(msg.contains("timed out"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(engine.state(), AcquisitionState::Faulted);
}

#[tokio::test]
async fn test_trigger_failure_faults_run() {
    let microwave = MockMicrowaveSource::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "trigger",
            count: 2,
        }))
        .build();
    let Rig { engine, .. } = rig(
        microwave,
        MockMagnet::new(),
        Arc::new(counting_lockin()),
        quick_config(),
    );

    let err = engine
        .run_plan(frequency_plan(1e9, 1e6, 1.009e9, 1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::HardwareComm(_)));
    assert_eq!(engine.state(), AcquisitionState::Faulted);

    // Point 2 was averaged before the third step failed
    let series = engine.current_series();
    assert_eq!(series.get(2), Some(&[3.0; 4]));
    assert_eq!(series.get(3), Some(&[0.0; 4]));
}

#[tokio::test]
async fn test_companion_failure_faults_start() {
    let magnet = MockMagnet::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::CommunicationLoss))
        .build();
    let Rig { engine, .. } = rig(
        MockMicrowaveSource::new(),
        magnet,
        Arc::new(counting_lockin()),
        quick_config(),
    );

    let err = engine
        .start(frequency_plan(1e9, 1e6, 1.002e9, 1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::HardwareComm(_)));
    assert_eq!(engine.state(), AcquisitionState::Faulted);

    // Faulted is terminal, so a new start is attempted and hits the lost link again
    assert!(matches!(
        engine.start(frequency_plan(1e9, 1e6, 1.002e9, 1, 1)).await,
        Err(DaqError::HardwareComm(_))
    ));
}

#[tokio::test]
async fn test_settings_owned_by_active_run() {
    let Rig { engine, .. } = default_rig(counting_lockin());
    engine
        .arm(frequency_plan(1e9, 1e6, 1.004e9, 1, 2))
        .await
        .unwrap();
    engine.tick().await.unwrap();

    let settings = MeasurementSettings {
        repeats: 4,
        ..MeasurementSettings::default()
    };
    assert!(matches!(
        engine.update_settings(settings.clone()),
        Err(DaqError::EngineBusy(_))
    ));
    assert!(matches!(
        engine.set_time_constants(1.0, 1.0).await,
        Err(DaqError::EngineBusy(_))
    ));
    assert!(matches!(
        engine.start(frequency_plan(1e9, 1e6, 1.004e9, 1, 2)).await,
        Err(DaqError::EngineBusy(_))
    ));

    engine.request_stop();
    assert_eq!(engine.run().await.unwrap(), StopReason::CancelledByUser);
    engine.update_settings(settings).unwrap();
    assert_eq!(engine.settings().repeats, 4);
}

#[tokio::test]
async fn test_configured_run_uses_lockin_time_constants() {
    let Rig {
        engine, magnet, ..
    } = default_rig(counting_lockin());
    let applied = engine.set_time_constants(0.0009, 0.0003).await.unwrap();
    assert_eq!(applied, (0.001, 0.0002));

    engine
        .update_settings(MeasurementSettings {
            sweep: SweepRequest::Frequency {
                start: 2.87e9,
                step: 1e6,
                stop: 2.875e9,
                fixed_field: 120.0,
                power: -10.0,
            },
            repeats: 1,
            accumulations_per_point: 2,
            waiting_time_factor: 3.0,
        })
        .unwrap();

    let plan = engine.build_plan().await.unwrap();
    let settle = plan.settle_time.as_secs_f64();
    assert!((settle - 0.003).abs() < 1e-9, "settle {}", settle);
    assert_eq!(plan.point_count(), 6);

    engine.arm_configured().await.unwrap();
    assert_eq!(magnet.field(), 120.0);
    assert_eq!(engine.run().await.unwrap(), StopReason::Completed);

    let record = engine.run_record().await.unwrap();
    let lookup = |key: &str| {
        record
            .parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(lookup("Lockin tau A (s)").as_deref(), Some("0.001"));
    assert_eq!(lookup("Lockin Waiting Time Factor").as_deref(), Some("3"));
    assert_eq!(lookup("Magnetic Field (G)").as_deref(), Some("120"));
    assert_eq!(lookup("Elapsed Sweeps").as_deref(), Some("1"));
    assert_eq!(record.run_uid, engine.run_uid().unwrap());
}
