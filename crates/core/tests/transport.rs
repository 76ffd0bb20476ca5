use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use daw_core::{
    AudioArc, Event, Player, PlayerError, PlayerEventKind, PlayerState, Sequence, Track,
    TrackError,
};
use daw_graph::manual::ManualDevice;

fn clip(duration: f64, time: f64) -> Sequence {
    Sequence::new(AudioArc::silence(duration, 48000, 2), time).unwrap()
}

fn track_with(clips: &[(f64, f64)]) -> Track {
    let mut track = Track::new("track");
    for &(time, duration) in clips {
        track.add_sequence(clip(duration, time)).unwrap();
    }
    track
}

fn record(player: &Player<ManualDevice>) -> Rc<RefCell<Vec<PlayerEventKind>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    for kind in [
        PlayerEventKind::Play,
        PlayerEventKind::Pause,
        PlayerEventKind::Seek,
        PlayerEventKind::Stop,
    ] {
        let events = events.clone();
        player.add_listener(kind, move |event| events.borrow_mut().push(event.kind()));
    }
    events
}

#[test]
fn two_clips_with_a_gap() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    let track = track_with(&[(0.0, 2.0), (3.0, 2.0)]);
    assert_relative_eq!(track.duration(), 5.0);
    player.add_track(track, None);

    player.play().unwrap();
    device.advance(2.5);

    assert_relative_eq!(player.current_time(), 2.5);
    assert!(device.audible_sources_at(2.5).is_empty());
    assert_eq!(device.audible_sources_at(1.0).len(), 1);
    assert_eq!(device.audible_sources_at(3.5).len(), 1);

    let second = &device.sources()[1];
    let schedule = second.schedule.unwrap();
    assert_relative_eq!(schedule.when, 3.0);
    assert_relative_eq!(schedule.offset, 0.0);
}

#[test]
fn seek_while_ready_sets_the_start_position() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(9.5, 1.0), (10.5, 1.0)]), None);

    player.seek(10.0).unwrap();
    assert_relative_eq!(player.current_time(), 10.0);
    player.play().unwrap();

    let sources = device.sources();
    let straddling = sources[0].schedule.unwrap();
    assert_relative_eq!(straddling.when, 0.0);
    assert_relative_eq!(straddling.offset, 0.5);

    let ahead = sources[1].schedule.unwrap();
    assert_relative_eq!(ahead.when, 0.5);
    assert_relative_eq!(ahead.offset, 0.0);
}

#[test]
fn seek_while_playing_reschedules_from_now() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 10.0)]), None);

    player.play().unwrap();
    device.advance(1.0);
    player.seek(4.0).unwrap();

    assert_relative_eq!(player.current_time(), 4.0);
    let sources = device.sources();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].stopped_at, Some(1.0));
    let schedule = sources[1].schedule.unwrap();
    assert_relative_eq!(schedule.when, 1.0);
    assert_relative_eq!(schedule.offset, 4.0);

    device.advance(0.5);
    assert_relative_eq!(player.current_time(), 4.5);
}

#[test]
fn seek_back_restarts_tracks_that_already_finished() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0)]), None);
    player.add_track(track_with(&[(0.0, 4.0)]), None);

    player.play().unwrap();
    device.advance(1.5);
    assert!(player.poll().is_some());
    assert!(!player.track(0).unwrap().is_active());

    player.seek(0.5).unwrap();

    assert_eq!(device.audible_sources_at(1.6).len(), 2);
    assert!(player.track(0).unwrap().is_active());
}

#[test]
fn pause_and_resume_keep_position() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 10.0)]), None);
    let events = record(&player);

    player.play().unwrap();
    device.advance(1.0);
    player.pause();
    assert_eq!(player.state(), PlayerState::Paused);
    assert_relative_eq!(player.current_time(), 1.0);

    device.advance(5.0);
    assert_relative_eq!(player.current_time(), 1.0);
    assert!(device.audible_sources_at(3.0).is_empty());
    assert!(device.is_open());

    player.resume().unwrap();
    device.advance(0.5);
    assert_relative_eq!(player.current_time(), 1.5);

    let resumed = device.sources()[1].schedule.unwrap();
    assert_relative_eq!(resumed.when, 6.0);
    assert_relative_eq!(resumed.offset, 1.0);
    assert_eq!(device.sessions_opened(), 1);
    assert_eq!(
        *events.borrow(),
        vec![
            PlayerEventKind::Play,
            PlayerEventKind::Pause,
            PlayerEventKind::Play
        ]
    );
}

#[test]
fn natural_end_stops_once() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0), (1.5, 0.5)]), None);
    player.add_track(track_with(&[(0.5, 1.0)]), None);
    let events = record(&player);

    player.play().unwrap();
    for _ in 0..3 {
        device.advance(0.6);
        assert!(player.poll().is_some());
    }
    device.advance(0.3);
    assert!(player.poll().is_none());
    assert!(player.poll().is_none());

    assert_eq!(player.state(), PlayerState::Ready);
    assert!(!device.is_open());
    assert_eq!(player.current_time(), 0.0);
    assert_eq!(
        *events.borrow(),
        vec![PlayerEventKind::Play, PlayerEventKind::Stop]
    );
}

#[test]
fn current_time_is_monotonic_and_bounded() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0), (2.0, 1.0)]), None);

    player.play().unwrap();
    let mut last = player.current_time();
    for _ in 0..40 {
        device.advance(1.0 / 60.0);
        let now = player.current_time();
        assert!(now >= last);
        assert!(now <= player.total_duration());
        last = now;
    }
}

#[test]
fn failed_device_open_stays_ready() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0)]), None);

    device.fail_next_open();
    assert!(matches!(player.play(), Err(PlayerError::Device(_))));
    assert_eq!(player.state(), PlayerState::Ready);

    player.play().unwrap();
    assert_eq!(player.state(), PlayerState::Playing);
}

#[test]
fn failed_track_start_rolls_everything_back() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0)]), None);
    player.add_track(track_with(&[(0.0, 1.0)]), None);
    let events = record(&player);

    device.fail_start_after(1);
    let result = player.play();

    assert!(matches!(result, Err(PlayerError::Track(TrackError::Sequence(_)))));
    assert_eq!(player.state(), PlayerState::Ready);
    assert!(device.audible_sources_at(0.5).is_empty());
    assert!(!device.is_open());
    assert_eq!(device.connected_gains(), 0);
    assert!(player.tracks().iter().all(|track| !track.is_active()));
    assert!(events.borrow().is_empty());
}

#[test]
fn stop_before_scheduled_start_stays_silent() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 0.5), (2.0, 1.0)]), None);

    player.play().unwrap();
    device.advance(1.0);
    player.stop();

    let later = device.sources()[1].clone();
    assert!(later.is_aborted());
    assert!(!later.is_audible_at(2.5));
}

#[test]
fn muted_track_is_silenced_through_its_gain() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 1.0)]), None);
    player.add_track(track_with(&[(0.0, 1.0)]), None);
    player.track_mut(1).unwrap().set_muted(true);

    player.play().unwrap();

    let sources = device.sources();
    assert_eq!(device.gain_of(sources[0].output), Some(1.0));
    assert_eq!(device.gain_of(sources[1].output), Some(0.0));
}

#[test]
fn removing_a_track_stops_playback() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 4.0)]), None);
    player.add_track(track_with(&[(0.0, 4.0)]), None);

    player.play().unwrap();
    device.advance(1.0);
    let removed = player.remove_track(0).unwrap();

    assert_eq!(player.state(), PlayerState::Ready);
    assert!(!removed.is_active());
    assert!(device.audible_sources_at(1.5).is_empty());
}

#[test]
fn play_from_starts_at_the_given_time() {
    let device = ManualDevice::new();
    let mut player = Player::new(device.clone());
    player.add_track(track_with(&[(0.0, 4.0)]), None);

    player.play_from(2.0).unwrap();
    device.advance(0.25);

    assert_relative_eq!(player.current_time(), 2.25);
    assert_relative_eq!(device.sources()[0].schedule.unwrap().offset, 2.0);
}
