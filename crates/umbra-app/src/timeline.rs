//! Timeline counter values of the three-submission frame protocol.
//!
//! Frame `k` owns three consecutive values starting at `3k + 1`:
//!
//! | value    | signaled by                 |
//! |----------|-----------------------------|
//! | `3k + 1` | graphics pre-pass           |
//! | `3k + 2` | sparse bind (if any binds)  |
//! | `3k + 3` | graphics main pass          |
//!
//! The main pass waits on the bind value when the frame has binds and on
//! the pre-pass value otherwise, so the counter never has to skip ahead.

/// Counter values used by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimeline {
    frame: u64,
}

impl FrameTimeline {
    /// Values consumed per frame.
    pub const STRIDE: u64 = 3;

    pub const fn new(frame: u64) -> Self {
        Self { frame }
    }

    /// Signaled when the visibility buffer and page mask are done.
    pub const fn prepass_done(&self) -> u64 {
        self.frame * Self::STRIDE + 1
    }

    /// Signaled by the sparse queue once this frame's binds are applied.
    pub const fn binds_done(&self) -> u64 {
        self.prepass_done() + 1
    }

    /// Signaled when the whole frame finished on the GPU.
    pub const fn frame_done(&self) -> u64 {
        self.prepass_done() + 2
    }

    /// Value the main pass waits on before touching the clipmap levels.
    pub const fn main_wait(&self, has_binds: bool) -> u64 {
        if has_binds {
            self.binds_done()
        } else {
            self.prepass_done()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_starts_above_initial_value() {
        let timeline = FrameTimeline::new(0);
        assert_eq!(timeline.prepass_done(), 1);
        assert_eq!(timeline.binds_done(), 2);
        assert_eq!(timeline.frame_done(), 3);
    }

    #[test]
    fn frames_never_share_values() {
        for frame in 0..100 {
            let current = FrameTimeline::new(frame);
            let next = FrameTimeline::new(frame + 1);
            assert!(next.prepass_done() > current.frame_done());
            assert_eq!(next.prepass_done(), current.frame_done() + 1);
        }
    }

    #[test]
    fn main_pass_waits_on_the_last_signaled_value() {
        let timeline = FrameTimeline::new(7);
        assert_eq!(timeline.main_wait(true), timeline.binds_done());
        assert_eq!(timeline.main_wait(false), timeline.prepass_done());
        assert!(timeline.main_wait(true) < timeline.frame_done());
    }

    /// Replays the submission order of a run where only some frames bind
    /// pages and checks that every signal raises the counter.
    #[test]
    fn signals_are_monotonic_with_and_without_binds() {
        let counter = std::cell::Cell::new(0);
        let signal = |value: u64| {
            assert!(value > counter.get(), "{value} does not advance {}", counter.get());
            counter.set(value);
        };

        for frame in 0..32 {
            let timeline = FrameTimeline::new(frame);
            signal(timeline.prepass_done());
            let has_binds = frame % 3 == 0;
            if has_binds {
                signal(timeline.binds_done());
            }
            assert!(timeline.main_wait(has_binds) <= counter.get());
            signal(timeline.frame_done());
        }
    }
}
