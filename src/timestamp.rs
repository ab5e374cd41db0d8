use std::time::Duration;

/// Formats `duration` as `HH:MM:SS.mmm`.
pub fn time_str(duration: Duration) -> String {
    let ms = duration.as_millis();
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1000;
    let milliseconds = ms % 1000;

    format!(
        "{hours:0width$}:{minutes:02}:{seconds:02}.{milliseconds:03}",
        width = if hours >= 100 { 0 } else { 2 }
    )
}

/// Playback duration of `frames` at `fps`.
pub fn frames_duration(frames: u64, fps: f64) -> Duration {
    if fps <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / fps)
}

#[test]
fn formats_durations() {
    assert_eq!(time_str(Duration::from_millis(3_723_004)), "01:02:03.004");
    assert_eq!(time_str(frames_duration(45, 30.0)), "00:00:01.500");
    assert_eq!(frames_duration(10, 0.0), Duration::ZERO);
}
