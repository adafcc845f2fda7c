//! End-to-end tests of the acquisition loop on simulated and scripted devices.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use hardware::clock::ManualClock;
use hardware::hrdl::{
    BlockMethod, ConversionTime, Drain, HrdlError, HrdlResult, HrdlUnit, Mains, Range, SimHrdl,
};
use hardware::mqtt::{MqttClient, MqttConfig, MqttError, MqttResult, QoS};
use hardware::{Clock, DataLogger};
use magnetometer::calibration::{calibrate_block, B_SCALE, R_IN, R_WIRES};
use magnetometer::configure::CANONICAL_CHANNELS;
use magnetometer::{
    configure_datalogger, Acquisition, AcquisitionConfig, AcquisitionError, BlockOutcome,
    BlockPlan, MagnetometerMessage, Publisher, ScalingTable,
};

// 2023-11-14T22:13:20Z
const T0: i64 = 1_700_000_000_000;

#[derive(Default)]
struct RecordingPublisher {
    published: Vec<(String, Vec<u8>)>,
    pumps: usize,
    closed: bool,
    fail_publish: bool,
    refuse_on_pump: bool,
    stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl RecordingPublisher {
    fn messages(&self) -> Vec<MagnetometerMessage> {
        self.published
            .iter()
            .map(|(_, payload)| MagnetometerMessage::from_bytes(payload).unwrap())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn pump(&mut self) -> MqttResult<()> {
        self.pumps += 1;
        if self.refuse_on_pump {
            return Err(MqttError::ConnectionRefused {
                code: 5,
                message: "Not authorized",
            });
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        assert_eq!(qos, QoS::AtMostOnce);
        if self.fail_publish {
            return Err(MqttError::NotConnected("Connection closed by broker".to_string()));
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        if let Some((limit, flag)) = &self.stop_after {
            if self.published.len() >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Data logger returning the same reading for every sample.
struct ScriptedLogger {
    active: Vec<i16>,
    reading: [i32; 4],
    samples: Option<usize>,
    overflow: bool,
    ready_after_polls: Option<usize>,
    polls: usize,
    closed: bool,
}

impl ScriptedLogger {
    fn new(reading: [i32; 4]) -> Self {
        Self {
            active: CANONICAL_CHANNELS.to_vec(),
            reading,
            samples: None,
            overflow: false,
            ready_after_polls: Some(3),
            polls: 0,
            closed: false,
        }
    }
}

impl DataLogger for ScriptedLogger {
    fn num_channels(&self) -> i16 {
        16
    }

    fn set_mains(&mut self, _mains: Mains) -> HrdlResult<()> {
        Ok(())
    }

    fn set_channel(
        &mut self,
        _channel: i16,
        _enabled: bool,
        _range: Range,
        _single_ended: bool,
    ) -> HrdlResult<()> {
        Ok(())
    }

    fn set_interval(
        &mut self,
        _sample_interval_ms: i32,
        _conversion_time: ConversionTime,
    ) -> HrdlResult<()> {
        Ok(())
    }

    fn min_max_counts(&self, _channel: i16) -> HrdlResult<(i32, i32)> {
        Ok((-1_000_000, 1_000_000))
    }

    fn active_channels(&self) -> &[i16] {
        &self.active
    }

    fn run(&mut self, n_samples: i32, method: BlockMethod) -> HrdlResult<()> {
        assert_eq!(n_samples, 4);
        assert_eq!(method, BlockMethod::Block);
        self.polls = 0;
        Ok(())
    }

    fn ready(&mut self) -> HrdlResult<bool> {
        self.polls += 1;
        Ok(self.ready_after_polls.is_some_and(|n| self.polls > n))
    }

    fn get_values(&mut self, values: &mut [i32], n_samples: i32) -> HrdlResult<Drain> {
        let samples = self.samples.unwrap_or(n_samples as usize);
        for chunk in values.chunks_exact_mut(4).take(samples) {
            chunk.copy_from_slice(&self.reading);
        }
        Ok(Drain {
            samples,
            overflow: self.overflow,
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn sim_unit(clock: &ManualClock) -> HrdlUnit<SimHrdl<ManualClock>> {
    HrdlUnit::open(SimHrdl::with_clock(clock.clone())).unwrap()
}

#[test]
fn test_happy_block_on_simulated_device() {
    let clock = ManualClock::new(T0);
    let mut unit = sim_unit(&clock);
    let scaling = configure_datalogger(&mut unit, &CANONICAL_CHANNELS, &BlockPlan::default()).unwrap();

    let mut publisher = RecordingPublisher::default();
    let mut acquisition = Acquisition::new(
        unit,
        &mut publisher,
        clock.clone(),
        scaling.clone(),
        AcquisitionConfig::default(),
    )
    .unwrap();

    let outcome = acquisition.run_block(&AtomicBool::new(false)).unwrap();
    assert_eq!(outcome, BlockOutcome::Published { block_start: T0 });
    assert_eq!(acquisition.blocks_published(), 1);
    drop(acquisition);

    assert_eq!(publisher.published.len(), 4);
    for (topic, payload) in &publisher.published {
        assert_eq!(topic, "Magnetometer");
        assert_eq!(payload.len(), 40);
    }
    let timestamps: Vec<i64> = publisher.messages().iter().map(|m| m.timestamp()).collect();
    assert_eq!(timestamps, vec![T0, T0 + 3000, T0 + 6000, T0 + 9000]);
    assert!(publisher.pumps > 0);
    assert!(publisher.closed);
    assert_eq!(clock.now_ms(), T0 + 12_000);

    // Same seed, same counts: the published values are the calibrated stream.
    let reference_clock = ManualClock::new(T0);
    let mut reference = sim_unit(&reference_clock);
    configure_datalogger(&mut reference, &CANONICAL_CHANNELS, &BlockPlan::default()).unwrap();
    reference.run(4, BlockMethod::Block).unwrap();
    let mut raw = [0i32; 16];
    reference.get_values(&mut raw, 4).unwrap();
    let mut expected = [0.0; 16];
    calibrate_block(&raw, &scaling, &mut expected).unwrap();

    for (message, reading) in publisher.messages().iter().zip(expected.chunks_exact(4)) {
        assert_eq!(message.data().as_slice(), reading);
    }
}

#[test]
fn test_consecutive_blocks_keep_timestamp_order() {
    let clock = ManualClock::new(T0);
    let mut unit = sim_unit(&clock);
    let scaling = configure_datalogger(&mut unit, &CANONICAL_CHANNELS, &BlockPlan::default()).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut publisher = RecordingPublisher {
        stop_after: Some((12, shutdown.clone())),
        ..Default::default()
    };
    let config = AcquisitionConfig {
        poll_interval: Duration::from_millis(50),
        ..AcquisitionConfig::default()
    };
    let mut acquisition =
        Acquisition::new(unit, &mut publisher, clock.clone(), scaling, config).unwrap();
    acquisition.run(&shutdown).unwrap();
    assert_eq!(acquisition.blocks_published(), 3);
    drop(acquisition);

    let timestamps: Vec<i64> = publisher.messages().iter().map(|m| m.timestamp()).collect();
    assert_eq!(timestamps.len(), 12);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    for block in timestamps.chunks_exact(4) {
        assert!(block.windows(2).all(|w| w[1] - w[0] == 3000));
    }
    assert!(timestamps[4] >= timestamps[3] + 3000);
}

#[test]
fn test_no_device_found() {
    let err = HrdlUnit::open(SimHrdl::new().with_available_units(0)).err().unwrap();
    assert_eq!(err, HrdlError::NoDevice);
    assert_eq!(err.to_string(), "No device found");
}

#[test]
fn test_timing_budget_rejection() {
    let clock = ManualClock::new(T0);
    let mut unit = sim_unit(&clock);
    let plan = BlockPlan {
        sample_interval_ms: 2000,
        ..BlockPlan::default()
    };
    let err = configure_datalogger(&mut unit, &CANONICAL_CHANNELS, &plan).unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Sample interval too short to perform conversion for all channels"));
}

#[test]
fn test_cross_talk_correction_end_to_end() {
    // One volt on Bx with 1 µV per count.
    let logger = ScriptedLogger::new([1_000_000, 0, 0, 0]);
    let mut publisher = RecordingPublisher::default();
    let mut acquisition = Acquisition::new(
        logger,
        &mut publisher,
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();
    acquisition.run_block(&AtomicBool::new(false)).unwrap();
    drop(acquisition);

    let r = R_WIRES / R_IN;
    let messages = publisher.messages();
    assert_eq!(messages.len(), 4);
    for message in messages {
        let [bx, by, bz, t] = message.data();
        assert_relative_eq!(bx, (1.0 + 2.0 * r) * B_SCALE, max_relative = 1e-12);
        assert_abs_diff_eq!(by, r * B_SCALE, epsilon = 1e-9);
        assert_abs_diff_eq!(bz, r * B_SCALE, epsilon = 1e-9);
        assert_abs_diff_eq!(t, 0.0248, epsilon = 1e-9);
    }
}

#[test]
fn test_overflow_warns_by_default() {
    let mut logger = ScriptedLogger::new([1, 2, 3, 4]);
    logger.overflow = true;
    let mut publisher = RecordingPublisher::default();
    let mut acquisition = Acquisition::new(
        logger,
        &mut publisher,
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();
    assert!(matches!(
        acquisition.run_block(&AtomicBool::new(false)),
        Ok(BlockOutcome::Published { .. })
    ));
    drop(acquisition);
    assert_eq!(publisher.published.len(), 4);
}

#[test]
fn test_strict_overflow_is_fatal() {
    let mut logger = ScriptedLogger::new([1, 2, 3, 4]);
    logger.overflow = true;
    let mut publisher = RecordingPublisher::default();
    let config = AcquisitionConfig {
        strict_overflow: true,
        ..AcquisitionConfig::default()
    };
    let mut acquisition = Acquisition::new(
        logger,
        &mut publisher,
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        config,
    )
    .unwrap();
    assert!(matches!(
        acquisition.run_block(&AtomicBool::new(false)),
        Err(AcquisitionError::Overflow { block_start: T0 })
    ));
    drop(acquisition);
    assert!(publisher.published.is_empty());
}

#[test]
fn test_short_drain_is_fatal() {
    let mut logger = ScriptedLogger::new([1, 2, 3, 4]);
    logger.samples = Some(3);
    let mut acquisition = Acquisition::new(
        logger,
        RecordingPublisher::default(),
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();
    let err = acquisition.run_block(&AtomicBool::new(false)).unwrap_err();
    assert!(matches!(
        err,
        AcquisitionError::SampleCount {
            expected: 4,
            got: 3
        }
    ));
    assert!(acquisition.publisher().published.is_empty());
}

#[test]
fn test_publish_failure_is_fatal() {
    let mut publisher = RecordingPublisher {
        fail_publish: true,
        ..Default::default()
    };
    let mut acquisition = Acquisition::new(
        ScriptedLogger::new([1, 2, 3, 4]),
        &mut publisher,
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();
    let err = acquisition.run_block(&AtomicBool::new(false)).unwrap_err();
    assert!(matches!(err, AcquisitionError::Broker(MqttError::NotConnected(_))));
    assert!(err.to_string().contains("Connection closed by broker"));
}

#[test]
fn test_refused_broker_stops_wait_loop() {
    let publisher = RecordingPublisher {
        refuse_on_pump: true,
        ..Default::default()
    };
    let mut acquisition = Acquisition::new(
        ScriptedLogger::new([1, 2, 3, 4]),
        publisher,
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();
    assert!(matches!(
        acquisition.run_block(&AtomicBool::new(false)),
        Err(AcquisitionError::Broker(MqttError::ConnectionRefused { code: 5, .. }))
    ));
    assert_eq!(acquisition.publisher().pumps, 1);
}

#[test]
fn test_shutdown_discards_pending_block() {
    let mut logger = ScriptedLogger::new([1, 2, 3, 4]);
    logger.ready_after_polls = None;
    let mut acquisition = Acquisition::new(
        logger,
        RecordingPublisher::default(),
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    )
    .unwrap();

    let shutdown = AtomicBool::new(true);
    assert_eq!(
        acquisition.run_block(&shutdown).unwrap(),
        BlockOutcome::Interrupted
    );
    acquisition.run(&shutdown).unwrap();
    assert_eq!(acquisition.blocks_published(), 0);
    assert!(acquisition.publisher().published.is_empty());

    acquisition.close();
    assert!(acquisition.logger().closed);
    assert!(acquisition.publisher().closed);
}

#[test]
fn test_requires_four_channels() {
    let mut logger = ScriptedLogger::new([0; 4]);
    logger.active = vec![13, 14, 15];
    let result = Acquisition::new(
        logger,
        RecordingPublisher::default(),
        ManualClock::new(T0),
        ScalingTable::uniform(4, 1e-6),
        AcquisitionConfig::default(),
    );
    assert!(matches!(
        result,
        Err(AcquisitionError::ChannelCount {
            expected: 4,
            got: 3
        })
    ));
}

fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header)?;
    let mut len = 0usize;
    let mut multiplier = 1usize;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        len += usize::from(byte[0] & 0x7F) * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((header[0], body))
}

#[test]
fn test_block_published_through_mqtt_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let (connect, _) = read_packet(&mut stream).unwrap();
        assert_eq!(connect, 0x10);
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap();

        let mut payloads = Vec::new();
        while payloads.len() < 4 {
            let (header, body) = read_packet(&mut stream).unwrap();
            if header & 0xF0 == 0x30 {
                let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                assert_eq!(&body[2..2 + topic_len], b"Magnetometer");
                payloads.push(body[2 + topic_len..].to_vec());
            }
        }
        payloads
    });

    let clock = ManualClock::new(T0);
    let mut unit = sim_unit(&clock);
    let scaling = configure_datalogger(&mut unit, &CANONICAL_CHANNELS, &BlockPlan::default()).unwrap();
    let client = MqttClient::connect(MqttConfig::new("127.0.0.1", port, "Magnetometer")).unwrap();
    let config = AcquisitionConfig {
        poll_interval: Duration::from_millis(10),
        ..AcquisitionConfig::default()
    };
    let mut acquisition = Acquisition::new(unit, client, clock, scaling, config).unwrap();
    acquisition.run_block(&AtomicBool::new(false)).unwrap();

    let payloads = broker.join().unwrap();
    let timestamps: Vec<i64> = payloads
        .iter()
        .map(|p| {
            assert_eq!(p.len(), 40);
            MagnetometerMessage::from_bytes(p).unwrap().timestamp()
        })
        .collect();
    assert_eq!(timestamps, vec![T0, T0 + 3000, T0 + 6000, T0 + 9000]);
}

/// Manual time that also yields real time on every sleep, so broker
/// threads and reconnect timers make progress during the wait loop.
#[derive(Clone)]
struct YieldingClock {
    time: ManualClock,
    real: Duration,
}

impl Clock for YieldingClock {
    fn now_ms(&self) -> i64 {
        self.time.now_ms()
    }

    fn sleep(&self, duration: Duration) {
        self.time.sleep(duration);
        thread::sleep(self.real);
    }
}

fn accept_session(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let (connect, _) = read_packet(&mut stream).unwrap();
    assert_eq!(connect, 0x10);
    stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap();
    stream
}

fn read_publishes(stream: &mut TcpStream, count: usize) -> Vec<i64> {
    let mut timestamps = Vec::new();
    while timestamps.len() < count {
        let (header, body) = read_packet(stream).unwrap();
        if header & 0xF0 == 0x30 {
            let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
            let record = MagnetometerMessage::from_bytes(&body[2 + topic_len..]).unwrap();
            timestamps.push(record.timestamp());
        }
    }
    timestamps
}

#[test]
fn test_broker_loss_between_blocks_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (dropped_tx, dropped_rx) = mpsc::channel();
    let broker = thread::spawn(move || {
        let mut first = accept_session(&listener);
        let before = read_publishes(&mut first, 4);
        drop(first);
        dropped_tx.send(()).unwrap();

        let mut second = accept_session(&listener);
        let after = read_publishes(&mut second, 4);
        (before, after)
    });

    let time = ManualClock::new(T0);
    let clock = YieldingClock {
        time: time.clone(),
        real: Duration::from_millis(5),
    };
    let mut unit = sim_unit(&time);
    let scaling = configure_datalogger(&mut unit, &CANONICAL_CHANNELS, &BlockPlan::default()).unwrap();
    let client = MqttClient::connect(MqttConfig {
        reconnect_interval: Duration::from_millis(20),
        ..MqttConfig::new("127.0.0.1", port, "Magnetometer")
    })
    .unwrap();
    let config = AcquisitionConfig {
        poll_interval: Duration::from_millis(50),
        ..AcquisitionConfig::default()
    };
    let mut acquisition = Acquisition::new(unit, client, clock, scaling, config).unwrap();
    let shutdown = AtomicBool::new(false);

    assert_eq!(
        acquisition.run_block(&shutdown).unwrap(),
        BlockOutcome::Published { block_start: T0 }
    );
    dropped_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert_eq!(
        acquisition.run_block(&shutdown).unwrap(),
        BlockOutcome::Published {
            block_start: T0 + 12_000
        }
    );
    assert_eq!(acquisition.publisher().reconnect_count(), 1);
    assert!(acquisition.publisher().is_connected());

    let (before, after) = broker.join().unwrap();
    assert_eq!(before, vec![T0, T0 + 3000, T0 + 6000, T0 + 9000]);
    assert_eq!(after, vec![T0 + 12_000, T0 + 15_000, T0 + 18_000, T0 + 21_000]);
}
