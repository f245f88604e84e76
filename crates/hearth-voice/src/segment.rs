//! Gap-based speech segmentation over per-frame VAD decisions.
//!
//! Silence → Speech → Gap → (commit) → Silence. Time is counted in frames,
//! so the segmenter is deterministic and needs no clock.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Silence,
    Speech,
    /// Speech stopped; counting silence toward the gap.
    Gap { silent_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub frame_ms: u64,
    /// Silence that closes a segment.
    pub gap_ms: u64,
    /// Segments with less voiced audio than this are dropped as noise.
    pub min_speech_ms: u64,
    /// Segments are cut here even mid-speech.
    pub max_segment_ms: u64,
}

/// A closed stretch of speech, ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub samples: Vec<f32>,
    pub speech_ms: u64,
}

/// What one frame did.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentStep {
    Silent,
    SpeechStarted,
    /// Still inside a segment.
    Continuing,
    Committed(Segment),
    /// A segment closed but was too short to be speech.
    Dropped,
}

pub struct Segmenter {
    config: SegmenterConfig,
    phase: Phase,
    samples: Vec<f32>,
    speech_ms: u64,
    total_ms: u64,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            phase: Phase::Silence,
            samples: Vec::new(),
            speech_ms: 0,
            total_ms: 0,
        }
    }

    /// Inside a segment (speaking or in a short pause).
    pub fn in_segment(&self) -> bool {
        self.phase != Phase::Silence
    }

    /// Samples gathered so far for the open segment.
    pub fn open_samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn push(&mut self, is_speech: bool, frame: &[f32]) -> SegmentStep {
        let frame_ms = self.config.frame_ms;
        match (self.phase, is_speech) {
            (Phase::Silence, false) => SegmentStep::Silent,
            (Phase::Silence, true) => {
                self.phase = Phase::Speech;
                self.samples.clear();
                self.samples.extend_from_slice(frame);
                self.speech_ms = frame_ms;
                self.total_ms = frame_ms;
                SegmentStep::SpeechStarted
            }
            (Phase::Speech, true) | (Phase::Gap { .. }, true) => {
                self.phase = Phase::Speech;
                self.samples.extend_from_slice(frame);
                self.speech_ms += frame_ms;
                self.total_ms += frame_ms;
                if self.total_ms >= self.config.max_segment_ms {
                    debug!(total_ms = self.total_ms, "segment hit max length");
                    return self.close();
                }
                SegmentStep::Continuing
            }
            (Phase::Speech, false) => {
                self.phase = Phase::Gap {
                    silent_ms: frame_ms,
                };
                self.samples.extend_from_slice(frame);
                self.total_ms += frame_ms;
                self.close_if_gap(frame_ms)
            }
            (Phase::Gap { silent_ms }, false) => {
                let silent_ms = silent_ms + frame_ms;
                self.phase = Phase::Gap { silent_ms };
                self.samples.extend_from_slice(frame);
                self.total_ms += frame_ms;
                self.close_if_gap(silent_ms)
            }
        }
    }

    /// Close whatever is open, e.g. when the run is ending.
    pub fn flush(&mut self) -> Option<Segment> {
        if !self.in_segment() {
            return None;
        }
        match self.close() {
            SegmentStep::Committed(segment) => Some(segment),
            _ => None,
        }
    }

    fn close_if_gap(&mut self, silent_ms: u64) -> SegmentStep {
        if silent_ms >= self.config.gap_ms || self.total_ms >= self.config.max_segment_ms {
            self.close()
        } else {
            SegmentStep::Continuing
        }
    }

    fn close(&mut self) -> SegmentStep {
        let speech_ms = self.speech_ms;
        let samples = std::mem::take(&mut self.samples);
        self.phase = Phase::Silence;
        self.speech_ms = 0;
        self.total_ms = 0;
        if speech_ms < self.config.min_speech_ms {
            debug!(speech_ms, "segment too short; dropped");
            return SegmentStep::Dropped;
        }
        SegmentStep::Committed(Segment { samples, speech_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: [f32; 4] = [0.1; 4];

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmenterConfig {
            frame_ms: 30,
            gap_ms: 90,
            min_speech_ms: 60,
            max_segment_ms: 600,
        })
    }

    #[test]
    fn gap_closes_segment() {
        let mut s = segmenter();
        assert_eq!(s.push(false, &FRAME), SegmentStep::Silent);
        assert_eq!(s.push(true, &FRAME), SegmentStep::SpeechStarted);
        assert_eq!(s.push(true, &FRAME), SegmentStep::Continuing);
        assert_eq!(s.push(false, &FRAME), SegmentStep::Continuing);
        assert_eq!(s.push(false, &FRAME), SegmentStep::Continuing);
        match s.push(false, &FRAME) {
            SegmentStep::Committed(seg) => {
                assert_eq!(seg.speech_ms, 60);
                // Trailing silence stays in the audio.
                assert_eq!(seg.samples.len(), 5 * FRAME.len());
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(!s.in_segment());
    }

    #[test]
    fn short_pause_does_not_split() {
        let mut s = segmenter();
        s.push(true, &FRAME);
        s.push(false, &FRAME);
        s.push(false, &FRAME);
        assert_eq!(s.push(true, &FRAME), SegmentStep::Continuing);
        assert!(s.in_segment());
    }

    #[test]
    fn blip_is_dropped() {
        let mut s = segmenter();
        s.push(true, &FRAME);
        s.push(false, &FRAME);
        s.push(false, &FRAME);
        assert_eq!(s.push(false, &FRAME), SegmentStep::Dropped);
    }

    #[test]
    fn max_length_forces_commit() {
        let mut s = segmenter();
        let mut committed = false;
        for _ in 0..20 {
            if let SegmentStep::Committed(seg) = s.push(true, &FRAME) {
                assert_eq!(seg.speech_ms, 600);
                committed = true;
                break;
            }
        }
        assert!(committed);
    }

    #[test]
    fn flush_returns_open_speech() {
        let mut s = segmenter();
        assert!(s.flush().is_none());
        s.push(true, &FRAME);
        s.push(true, &FRAME);
        s.push(true, &FRAME);
        assert_eq!(s.flush().map(|seg| seg.speech_ms), Some(90));
        assert!(!s.in_segment());
    }
}
