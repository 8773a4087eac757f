//! An example showcasing how to drive the grain engine from a control thread while rendering
//! its output offline into a wave file.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use grainloop::{
    utils::time::duration_to_sample_time, Engine, EngineConfig, Error, GrainMode,
    GrainParameters, PlaybackMode, SampleBuffer, VoiceConfig,
};

// -------------------------------------------------------------------------------------------------

#[cfg(all(debug_assertions, feature = "assert-allocs"))]
#[global_allocator]
static A: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;

// -------------------------------------------------------------------------------------------------

const SAMPLE_RATE: u32 = 48000;
const BLOCK_FRAMES: usize = 512;
const RENDER_DURATION: Duration = Duration::from_secs(12);

/// A one bar drum like loop at the given tempo: decaying noise bursts on every beat.
fn create_loop(bpm: f64, pitch_hz: f32) -> Result<SampleBuffer, Error> {
    let frames_per_beat = (60.0 / bpm * SAMPLE_RATE as f64) as usize;
    let mut seed = 0x1234_5678_u32;
    let samples = (0..frames_per_beat * 4)
        .map(|frame| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (seed >> 8) as f32 / (1 << 24) as f32 * 2.0 - 1.0;
            let t = (frame % frames_per_beat) as f32 / SAMPLE_RATE as f32;
            let tone = (t * pitch_hz * std::f32::consts::TAU).sin();
            (noise * 0.3 + tone * 0.7) * (-t * 12.0).exp()
        })
        .collect();
    SampleBuffer::from_mono(samples, SAMPLE_RATE)
}

// -------------------------------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    // Create the engine and its controller
    let (mut engine, mut controller) = Engine::new(EngineConfig {
        sample_rate: SAMPLE_RATE,
        max_block_frames: BLOCK_FRAMES,
        ..EngineConfig::default()
    })?;

    // Add a plain, tempo synced loop and a pitch shifted, scattered one-shot
    let beat = controller.share_buffer(create_loop(100.0, 80.0)?);
    let beat_voice = engine.add_voice(
        VoiceConfig {
            loop_id: "beat".to_string(),
            loop_bpm: 100.0,
            ..VoiceConfig::default()
        },
        Some(beat),
    )?;
    let texture = controller.share_buffer(create_loop(90.0, 440.0)?);
    let texture_voice = engine.add_voice(
        VoiceConfig {
            loop_id: "texture".to_string(),
            loop_bpm: 90.0,
            playback_mode: PlaybackMode::Retrigger,
            grain: GrainParameters {
                mode: GrainMode::Scatter,
                grain_rate_hz: 40.0,
                overlap: 0.7,
                scatter: 0.4,
                pan_spread: 0.6,
                ..GrainParameters::default()
            },
            gain: 0.5,
            ..VoiceConfig::default()
        },
        Some(texture),
    )?;

    // Control thread: tap in a tempo, start the voices and tweak them while rendering
    let sender = controller.sender();
    let is_running = Arc::new(AtomicBool::new(true));
    let control_thread = thread::spawn({
        let is_running = Arc::clone(&is_running);
        move || -> Result<(), Error> {
            let start = sender.elapsed();
            for tap in 0..4 {
                // 500ms apart: 120 BPM
                sender.tap_at(start + Duration::from_millis(tap * 500));
            }
            sender.trigger(beat_voice);
            sender.trigger(texture_voice);
            thread::sleep(Duration::from_millis(200));
            sender.set_pitch(texture_voice, 7.0)?;
            thread::sleep(Duration::from_millis(200));
            sender.mute(beat_voice);
            thread::sleep(Duration::from_millis(200));
            sender.unmute(beat_voice);
            sender.trigger(texture_voice);
            sender.set_bpm(132.0)?;
            sender.resync(beat_voice);
            is_running.store(false, Ordering::Release);
            Ok(())
        }
    });

    // Render in audio driver sized blocks. A real application would call the engine from its
    // audio callback instead.
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create("render-loop.wav", spec)?;
    let block_count = duration_to_sample_time(RENDER_DURATION, SAMPLE_RATE) as usize / BLOCK_FRAMES;
    let status = controller.status_reader();
    for block in 0..block_count {
        for sample in engine.render_callback(BLOCK_FRAMES) {
            writer.write_sample(*sample)?;
        }
        // pace rendering while the control thread is busy
        if is_running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        if block % 64 == 0 {
            controller.maintain();
            let snapshot = status.snapshot();
            println!(
                "Bar {}: {:.1} BPM, {} grains, CPU {}",
                snapshot.bar(),
                snapshot.bpm,
                snapshot.active_grains,
                snapshot.cpu_load
            );
        }
    }
    writer.finalize()?;

    control_thread
        .join()
        .map_err(|_| "Control thread panicked")??;
    println!("Wrote render-loop.wav");
    Ok(())
}
