use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use resona::{
    backend::loopback::LoopbackSink, AssetSource, Config, Device, Emitter, Pcm, PlaybackState,
    SampleStore,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> Config {
    Config {
        frequency: 8000,
        latency: 0.016,
        ..Config::default()
    }
}

fn sine_store(rate: u32, seconds: f32) -> Arc<SampleStore> {
    let frames = (rate as f32 * seconds) as usize;
    let pcm: Vec<i16> = (0..frames)
        .map(|i| {
            let t = i as f32 / rate as f32;
            ((t * 220.0 * std::f32::consts::TAU).sin() * 20000.0) as i16
        })
        .collect();
    Arc::new(
        SampleStore::from_asset(&AssetSource {
            frequency: rate,
            channels: 1,
            bits_per_sample: 16,
            loop_start: 0,
            loop_end: 0,
            pcm: Pcm::I16(&pcm),
        })
        .unwrap(),
    )
}

#[test]
fn renders_to_loopback_device() {
    init_logging();
    let (sink, captured) = LoopbackSink::capturing();
    let device = Device::open(test_config(), Box::new(sink)).unwrap();

    let mut emitter = Emitter::new(sine_store(8000, 2.0));
    emitter.position = [0.5, 0.0, -1.0].into();
    emitter.play();
    device.mixer().lock().unwrap().register(emitter);

    device.play();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        thread::sleep(Duration::from_millis(20));
        let frames = captured.lock().unwrap().len() / 2;
        if frames >= 512 {
            break;
        }
        assert!(Instant::now() < deadline, "loopback never received audio");
    }
    device.close().unwrap();

    let data = captured.lock().unwrap();
    assert!(data.iter().any(|&s| s != 0), "captured audio is silent");
}

#[test]
fn captured_audio_survives_wav_round_trip() {
    init_logging();
    let (sink, captured) = LoopbackSink::capturing();
    let device = Device::open(test_config(), Box::new(sink)).unwrap();
    let mut emitter = Emitter::new(sine_store(8000, 1.0));
    emitter.play();
    device.mixer().lock().unwrap().register(emitter);
    device.play();
    thread::sleep(Duration::from_millis(120));
    device.close().unwrap();

    let data = captured.lock().unwrap().clone();
    assert!(!data.is_empty());

    let path = std::env::temp_dir().join("resona-loopback-test.wav");
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &s in &data {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.len() as usize, data.len());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn state_machine_transitions() {
    init_logging();
    let sink = LoopbackSink::new();
    let device = Device::open(test_config(), Box::new(sink)).unwrap();
    assert_eq!(device.state(), PlaybackState::Suspended);

    device.play();
    assert_eq!(device.state(), PlaybackState::Playing);
    thread::sleep(Duration::from_millis(50));

    device.pause();
    assert_eq!(device.state(), PlaybackState::Paused);
    thread::sleep(Duration::from_millis(30));

    device.play();
    assert_eq!(device.state(), PlaybackState::Playing);
    thread::sleep(Duration::from_millis(30));

    device.standby();
    assert_eq!(device.state(), PlaybackState::Standby);

    device.close().unwrap();
}

#[test]
fn emitter_controls_apply_between_ticks() {
    init_logging();
    let (sink, captured) = LoopbackSink::capturing();
    let device = Device::open(test_config(), Box::new(sink)).unwrap();
    let id = {
        let mut mixer = device.mixer().lock().unwrap();
        let mut emitter = Emitter::new(sine_store(8000, 4.0));
        emitter.play();
        mixer.register(emitter)
    };
    device.play();
    thread::sleep(Duration::from_millis(60));

    {
        let mut mixer = device.mixer().lock().unwrap();
        let em = mixer.emitter_mut(id).expect("emitter still registered");
        em.position = [20.0, 0.0, 0.0].into();
        em.stop();
    }
    thread::sleep(Duration::from_millis(60));
    {
        let mut mixer = device.mixer().lock().unwrap();
        assert!(mixer.emitter_mut(id).is_none(), "stopped emitter lingered");
    }
    device.close().unwrap();
    assert!(!captured.lock().unwrap().is_empty());
}
