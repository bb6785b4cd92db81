use crate::sync::PresentationSchedule;
use std::time::Duration;
use tokio::time::Instant;

const FRAME: Duration = Duration::from_micros(7_981); // 352 samples at 44.1 kHz

#[tokio::test]
async fn t0_is_now_plus_global_delay() {
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::from_millis(500), 0, FRAME);
    assert_eq!(schedule.t0() - now, Duration::from_millis(500));
    assert_eq!(schedule.presentation_time(0), schedule.t0());
}

#[tokio::test]
async fn presentation_times_step_by_frame_duration() {
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::from_millis(500), 100, FRAME);

    let p100 = schedule.presentation_time(100);
    let p101 = schedule.presentation_time(101);
    let p200 = schedule.presentation_time(200);
    assert_eq!(p101 - p100, FRAME);
    assert_eq!(p200 - p100, FRAME * 100);
}

#[tokio::test]
async fn receivers_share_the_common_term_modulo_their_delay() {
    // P(f, r) - D_r must be identical across receivers for any frame
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::from_millis(500), 0, FRAME);

    let d_r1 = Duration::from_millis(0);
    let d_r2 = Duration::from_millis(80);
    for seq in [0u64, 1, 17, 5000] {
        let p1 = schedule.presentation_time_for(seq, d_r1);
        let p2 = schedule.presentation_time_for(seq, d_r2);
        assert_eq!(p1 - d_r1, p2 - d_r2, "seq {seq}");
        assert_eq!(p2 - p1, d_r2);
    }
}

#[tokio::test]
async fn zero_global_delay_still_anchors() {
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::ZERO, 0, FRAME);
    assert_eq!(schedule.t0(), now);
    assert_eq!(schedule.presentation_time(1), now + FRAME);
}

#[tokio::test]
async fn join_boundary_is_the_first_future_frame() {
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::from_millis(100), 0, FRAME);

    // Before T0 the boundary is seq0 itself
    assert_eq!(schedule.first_seq_at_or_after(now), 0);
    assert_eq!(schedule.first_seq_at_or_after(schedule.t0()), 0);

    // 200 ms past T0 is just over 25 frames of 7.981 ms
    let boundary = schedule.first_seq_at_or_after(schedule.t0() + Duration::from_millis(200));
    assert_eq!(boundary, 26);

    // The boundary frame really is at or after the deadline
    let deadline = schedule.t0() + Duration::from_millis(200);
    assert!(schedule.presentation_time(boundary) >= deadline);
    assert!(schedule.presentation_time(boundary - 1) < deadline);
}

#[tokio::test]
async fn frames_before_seq0_collapse_onto_t0() {
    let now = Instant::now();
    let schedule = PresentationSchedule::anchor(now, Duration::from_millis(100), 500, FRAME);
    assert_eq!(schedule.presentation_time(100), schedule.t0());
}
