//! Squiggle reads: per-strand pore models and borrowed event streams.

use crate::params::KhmmParameters;
use crate::NUM_STRANDS;
use serde::{Deserialize, Serialize};

/// Scaled Gaussian for one k-mer state of the pore.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KmerState {
    pub level_mean: f64,
    pub level_stdv: f64,
    pub sd_mean: f64,
    pub sd_stdv: f64,
}

/// Per-strand pore model. `states` must hold exactly 1024 entries,
/// indexed by k-mer rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoreModel {
    pub scale: f64,
    pub shift: f64,
    pub drift: f64,
    pub var: f64,
    pub states: Vec<KmerState>,
}

impl PoreModel {
    /// Model mean of the drift-corrected level for `rank`.
    #[inline]
    pub fn scaled_mean(&self, rank: u32) -> f64 {
        self.states[rank as usize].level_mean * self.scale + self.shift
    }
    /// Model stdv of the drift-corrected level for `rank`.
    #[inline]
    pub fn scaled_stdv(&self, rank: u32) -> f64 {
        self.states[rank as usize].level_stdv * self.var
    }
    /// K-mer level used by the skip-probability lookup and by training.
    #[inline]
    pub fn transition_level(&self, rank: u32) -> f64 {
        (self.states[rank as usize].level_mean + self.shift) * self.scale
    }
}

/// Measured events of one strand, borrowed from the caller.
/// `time` has one more entry than `level`; `time[i + 1]` closes event `i`.
#[derive(Debug, Clone, Copy)]
pub struct EventSequence<'a> {
    pub level: &'a [f64],
    pub stdv: &'a [f64],
    pub time: &'a [f64],
}

impl<'a> EventSequence<'a> {
    pub fn n_events(&self) -> usize {
        self.level.len()
    }
    /// Duration of event `i`.
    #[inline]
    pub fn duration(&self, i: usize) -> f64 {
        self.time[i + 1] - self.time[i]
    }
}

/// One nanopore read: a pore model, an event stream and learned HMM
/// parameters for each of the two strands.
#[derive(Debug, Clone)]
pub struct SquiggleRead<'a> {
    pub pore_model: [PoreModel; NUM_STRANDS],
    pub events: [EventSequence<'a>; NUM_STRANDS],
    pub parameters: [KhmmParameters; NUM_STRANDS],
}

impl<'a> SquiggleRead<'a> {
    /// Event level corrected for the linear drift of the pore.
    #[inline]
    pub fn drift_corrected_level(&self, event_idx: usize, strand: usize) -> f64 {
        let events = &self.events[strand];
        let time = events.time[event_idx] - events.time[0];
        events.level[event_idx] - time * self.pore_model[strand].drift
    }
    #[inline]
    pub fn duration(&self, event_idx: usize, strand: usize) -> f64 {
        self.events[strand].duration(event_idx)
    }
}

/// A read strand spanning one segment: the window of events between two
/// anchors, with the orientation needed to walk and rank them.
#[derive(Debug, Clone, Copy)]
pub struct ReadState {
    pub read_idx: usize,
    pub anchor_index: usize,
    pub strand: usize,
    pub event_start_idx: usize,
    pub event_stop_idx: usize,
    /// +1 when events run forward between the anchors, -1 otherwise.
    pub stride: i64,
    /// Read strand is reverse-complemented with respect to the consensus.
    pub rc: bool,
}

impl ReadState {
    pub fn n_events(&self) -> usize {
        self.event_start_idx.abs_diff(self.event_stop_idx) + 1
    }
    /// Event index for DP row `row` (row 0 is the null row).
    #[inline]
    pub fn event_at(&self, row: usize) -> usize {
        (self.event_start_idx as i64 + (row as i64 - 1) * self.stride) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    #[test]
    fn drift_correction() {
        let mut model = sim::test_pore_model();
        model.drift = 2.0;
        let level = vec![100.0, 100.0, 100.0];
        let stdv = vec![1.0; 3];
        let time = vec![0.0, 0.5, 1.0, 1.5];
        let read = SquiggleRead {
            pore_model: [model.clone(), model],
            events: [
                EventSequence {
                    level: &level,
                    stdv: &stdv,
                    time: &time,
                },
                EventSequence {
                    level: &level,
                    stdv: &stdv,
                    time: &time,
                },
            ],
            parameters: [KhmmParameters::default(), KhmmParameters::default()],
        };
        assert_eq!(read.drift_corrected_level(0, 0), 100.0);
        assert_eq!(read.drift_corrected_level(1, 0), 99.0);
        assert_eq!(read.drift_corrected_level(2, 0), 98.0);
        assert_eq!(read.duration(1, 0), 0.5);
    }

    #[test]
    fn scaled_model_values() {
        let mut model = sim::test_pore_model();
        model.scale = 2.0;
        model.shift = 10.0;
        model.var = 3.0;
        let mean = model.states[5].level_mean;
        let stdv = model.states[5].level_stdv;
        assert_eq!(model.scaled_mean(5), mean * 2.0 + 10.0);
        assert_eq!(model.scaled_stdv(5), stdv * 3.0);
        assert_eq!(model.transition_level(5), (mean + 10.0) * 2.0);
    }
}
