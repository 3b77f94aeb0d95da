use crate::config::SenderConfig;
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterStats {
    pub frames_emitted: u64,
    pub underruns: u64,
    pub overflows: u64,
    pub dropped_bytes: u64,
    pub padded_frames: u64,
    pub target_raises: u32,
    pub target_lowers: u32,
}

/// What a tick got from the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Frame(Bytes),
    /// Nothing queued; the stream is idle.
    Idle,
    /// Data queued but not enough to emit; the tick is skipped.
    Underrun,
}

/// Byte-oriented playout buffer that turns arbitrary-sized chunks into
/// fixed-size frames, growing its target on starvation and shrinking it
/// (dropping the oldest bytes) on sustained overflow.
pub struct JitterBuffer {
    buf: BytesMut,
    frame_bytes: usize,
    target_bytes: usize,
    min_bytes: usize,
    max_bytes: usize,
    silence: u8,
    underrun_adapt_after: u32,
    overflow_adapt_after: u32,
    tail_flush_ticks: u32,
    consecutive_underruns: u32,
    consecutive_overflows: u32,
    // Set after a starvation; emission resumes once `target_bytes` are queued
    // or the input has been quiet for `tail_flush_ticks`.
    refilling: bool,
    quiet_ticks: u32,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: &SenderConfig, frame_bytes: usize, silence: u8) -> Self {
        Self {
            buf: BytesMut::with_capacity(frame_bytes * config.max_frames * 2),
            frame_bytes,
            target_bytes: frame_bytes * config.target_frames,
            min_bytes: frame_bytes * config.min_frames,
            max_bytes: frame_bytes * config.max_frames,
            silence,
            underrun_adapt_after: config.underrun_adapt_after.max(1),
            overflow_adapt_after: config.overflow_adapt_after.max(1),
            tail_flush_ticks: config.tail_flush_ticks,
            consecutive_underruns: 0,
            consecutive_overflows: 0,
            refilling: false,
            quiet_ticks: 0,
            stats: JitterStats::default(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
        self.quiet_ticks = 0;
        if self.buf.len() <= self.max_bytes {
            self.consecutive_overflows = 0;
            return;
        }
        self.stats.overflows += 1;
        self.consecutive_overflows += 1;
        if self.consecutive_overflows < self.overflow_adapt_after {
            return;
        }
        let excess = self.buf.len() - self.max_bytes;
        self.buf.advance(excess);
        self.stats.dropped_bytes += excess as u64;
        self.consecutive_overflows = 0;
        if self.target_bytes > self.min_bytes {
            self.target_bytes = (self.target_bytes - self.frame_bytes).max(self.min_bytes);
            self.stats.target_lowers += 1;
        }
        debug!(
            excess,
            target_bytes = self.target_bytes,
            "jitter buffer overflow, dropped oldest bytes"
        );
    }

    pub fn next_frame(&mut self) -> FrameOutcome {
        let queued = self.buf.len();
        if queued == 0 {
            self.refilling = false;
            self.consecutive_underruns = 0;
            self.quiet_ticks = 0;
            return FrameOutcome::Idle;
        }

        if self.refilling && queued < self.target_bytes {
            if queued < self.frame_bytes {
                return self.starve();
            }
            // enough for a frame but still rebuilding the cushion
            self.stats.underruns += 1;
            self.quiet_ticks += 1;
            if self.quiet_ticks < self.tail_flush_ticks.max(1) {
                return FrameOutcome::Underrun;
            }
            // no more input is coming, play out what is queued
            debug!(queued, target_bytes = self.target_bytes, "jitter buffer refill abandoned");
        }

        if queued < self.frame_bytes {
            return self.starve();
        }

        self.refilling = false;
        self.consecutive_underruns = 0;
        self.quiet_ticks = 0;
        self.stats.frames_emitted += 1;
        FrameOutcome::Frame(self.buf.split_to(self.frame_bytes).freeze())
    }

    fn starve(&mut self) -> FrameOutcome {
        self.stats.underruns += 1;
        self.consecutive_underruns += 1;
        if self.consecutive_underruns % self.underrun_adapt_after == 0
            && self.target_bytes < self.max_bytes
        {
            self.target_bytes = (self.target_bytes + self.frame_bytes).min(self.max_bytes);
            self.stats.target_raises += 1;
            self.refilling = true;
            debug!(target_bytes = self.target_bytes, "jitter buffer target raised");
        }
        if self.tail_flush_ticks > 0 && self.consecutive_underruns >= self.tail_flush_ticks {
            // the stream ended on a partial frame
            let mut frame = BytesMut::with_capacity(self.frame_bytes);
            frame.extend_from_slice(&self.buf.split());
            frame.resize(self.frame_bytes, self.silence);
            self.consecutive_underruns = 0;
            self.refilling = false;
            self.stats.padded_frames += 1;
            self.stats.frames_emitted += 1;
            return FrameOutcome::Frame(frame.freeze());
        }
        FrameOutcome::Underrun
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.refilling = false;
        self.consecutive_underruns = 0;
        self.consecutive_overflows = 0;
        self.quiet_ticks = 0;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn target_bytes(&self) -> usize {
        self.target_bytes
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 160;

    fn buffer() -> JitterBuffer {
        JitterBuffer::new(&SenderConfig::default(), FRAME, 0xFF)
    }

    #[test]
    fn test_steady_input_never_underruns() {
        let mut jb = buffer();
        for i in 0..500u32 {
            jb.push(&[(i % 256) as u8; FRAME]);
            match jb.next_frame() {
                FrameOutcome::Frame(frame) => assert_eq!(frame.len(), FRAME),
                other => panic!("tick {} produced {:?}", i, other),
            }
        }
        assert_eq!(jb.stats().underruns, 0);
        assert_eq!(jb.stats().frames_emitted, 500);
    }

    #[test]
    fn test_irregular_chunks_are_reframed_in_order() {
        let mut jb = buffer();
        let data: Vec<u8> = (0..480).map(|i| (i % 251) as u8).collect();
        jb.push(&data[..100]);
        jb.push(&data[100..390]);
        jb.push(&data[390..]);
        let mut out = Vec::new();
        while let FrameOutcome::Frame(frame) = jb.next_frame() {
            out.extend_from_slice(&frame);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_empty_buffer_is_idle_not_underrun() {
        let mut jb = buffer();
        assert_eq!(jb.next_frame(), FrameOutcome::Idle);
        assert_eq!(jb.stats().underruns, 0);
    }

    #[test]
    fn test_repeated_underruns_raise_target() {
        let mut jb = buffer();
        let initial = jb.target_bytes();
        jb.push(&[1u8; 50]);
        for _ in 0..3 {
            assert_eq!(jb.next_frame(), FrameOutcome::Underrun);
        }
        assert_eq!(jb.target_bytes(), initial + FRAME);
        assert_eq!(jb.stats().underruns, 3);
        // after raising, a single frame is not enough: wait for the new target
        jb.push(&[1u8; FRAME]);
        assert_eq!(jb.next_frame(), FrameOutcome::Underrun);
        jb.push(&[1u8; FRAME * 4]);
        assert!(matches!(jb.next_frame(), FrameOutcome::Frame(_)));
    }

    #[test]
    fn test_queued_frames_play_out_after_target_raise() {
        let mut jb = buffer();
        jb.push(&[1u8; 50]);
        for _ in 0..3 {
            assert_eq!(jb.next_frame(), FrameOutcome::Underrun);
        }
        assert_eq!(jb.target_bytes(), FRAME * 5);

        // the response ends with less than the raised target queued
        jb.push(&[2u8; FRAME * 2]);
        for _ in 0..4 {
            assert_eq!(jb.next_frame(), FrameOutcome::Underrun);
        }
        assert_eq!(jb.stats().underruns, 7);

        let mut out = Vec::new();
        for _ in 0..20 {
            if let FrameOutcome::Frame(frame) = jb.next_frame() {
                out.extend_from_slice(&frame);
            }
        }
        assert!(jb.is_empty());
        assert_eq!(out.len(), FRAME * 3);
        assert_eq!(&out[..50], &[1u8; 50]);
        assert_eq!(&out[50..50 + FRAME * 2], &[2u8; FRAME * 2]);
        assert!(out[50 + FRAME * 2..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_target_never_exceeds_max() {
        let config = SenderConfig {
            tail_flush_ticks: 0,
            ..SenderConfig::default()
        };
        let mut jb = JitterBuffer::new(&config, FRAME, 0xFF);
        jb.push(&[1u8; 10]);
        for _ in 0..100 {
            jb.next_frame();
        }
        assert_eq!(jb.target_bytes(), FRAME * config.max_frames);
    }

    #[test]
    fn test_sustained_overflow_drops_oldest_and_lowers_target() {
        let mut jb = buffer();
        let initial = jb.target_bytes();
        let max = FRAME * 8;
        jb.push(&vec![0u8; max]);
        // three consecutive over-max pushes
        jb.push(&[1u8; 10]);
        jb.push(&[2u8; 10]);
        assert_eq!(jb.len(), max + 20);
        jb.push(&[3u8; 10]);
        assert_eq!(jb.len(), max);
        assert_eq!(jb.stats().dropped_bytes, 30);
        assert_eq!(jb.target_bytes(), initial - FRAME);
        // newest bytes survive
        let mut tail = Vec::new();
        while let FrameOutcome::Frame(frame) = jb.next_frame() {
            tail = frame.to_vec();
        }
        assert_eq!(&tail[tail.len() - 10..], &[3u8; 10]);
    }

    #[test]
    fn test_target_never_below_min() {
        let mut jb = buffer();
        for _ in 0..50 {
            jb.push(&vec![0u8; FRAME * 9]);
        }
        assert_eq!(jb.target_bytes(), FRAME * 2);
    }

    #[test]
    fn test_trailing_partial_frame_is_padded() {
        let mut jb = buffer();
        jb.push(&[7u8; FRAME + 40]);
        assert!(matches!(jb.next_frame(), FrameOutcome::Frame(_)));
        let mut padded = None;
        for _ in 0..10 {
            if let FrameOutcome::Frame(frame) = jb.next_frame() {
                padded = Some(frame);
                break;
            }
        }
        let padded = padded.expect("tail flushed");
        assert_eq!(padded.len(), FRAME);
        assert_eq!(&padded[..40], &[7u8; 40]);
        assert!(padded[40..].iter().all(|b| *b == 0xFF));
        assert!(jb.is_empty());
        assert_eq!(jb.stats().padded_frames, 1);
    }
}
