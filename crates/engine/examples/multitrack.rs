//! Play audio files on separate tracks through the default output device.
//!
//! ```text
//! cargo run -p daw_engine --example multitrack -- drums.wav bass.wav@2.5
//! ```
//!
//! `file@seconds` places the clip at that timeline position.

use std::path::Path;
use std::time::Duration;

use daw_core::{
    EngineConfig, Player, PlayerEvent, PlayerEventKind, Sequence, TrackError, format_time,
};
use daw_engine::CpalDevice;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        anyhow::bail!("usage: multitrack <file[@seconds]>...");
    }

    let mut player = Player::with_config(CpalDevice::new(), EngineConfig::load());

    for arg in &args {
        let (path, time) = match arg.rsplit_once('@') {
            Some((path, time)) => (path, time.parse::<f64>()?),
            None => (arg.as_str(), 0.0),
        };
        let buffer = daw_decode::decode_file(Path::new(path))?;
        log::info!("{path}: {:?}", buffer);

        let id = player.create_track(path);
        let track = player
            .track_by_id_mut(id)
            .ok_or_else(|| anyhow::anyhow!("track vanished"))?;
        // InsertError hands the clip back and is not Send
        track
            .add_sequence(Sequence::new(buffer, time)?)
            .map_err(TrackError::from)?;
    }

    player.add_listener(PlayerEventKind::TimeUpdate, |event| {
        if let PlayerEvent::TimeUpdate {
            current_time,
            frame,
        } = event
        {
            let samples = frame.samples();
            let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
            print!("\r{}  peak {peak:.3}   ", format_time(*current_time));
        }
    });

    log::info!(
        "playing {} tracks, {}",
        player.track_count(),
        format_time(player.total_duration())
    );
    player.play()?;

    while player.poll().is_some() {
        std::thread::sleep(Duration::from_millis(16));
    }
    println!();

    Ok(())
}
