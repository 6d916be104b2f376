//! Harvest transition and emission observations from posterior decodes.
//! Parameter re-estimation itself lives with the parameters
//! ([`crate::params::KhmmParameters::train`]).

use crate::khmm::{get_rank, posterior_decode, AlignOp};
use crate::params::TransitionObservation;
use crate::read::{ReadState, SquiggleRead};
use crate::K;
use log::trace;

// Decoded steps this close to either anchor are ignored; the alignment
// there is dominated by edge effects.
const EDGE_IGNORE: usize = 5;

/// Observations of one decode, ready to merge into a strand's
/// [`crate::params::TrainingData`].
#[derive(Debug, Clone, Default)]
pub(crate) struct DecodeObservations {
    pub transitions: Vec<TransitionObservation>,
    pub match_residuals: Vec<f64>,
    pub n_matches: usize,
    pub n_merges: usize,
    pub n_skips: usize,
}

/// Decode `sequence` against one read strand and collect training
/// observations from the interior of the alignment.
pub(crate) fn collect_observations(
    sequence: &[u8],
    read: &SquiggleRead,
    state: &ReadState,
) -> DecodeObservations {
    let decode = posterior_decode(sequence, read, state);
    let pm = &read.pore_model[state.strand];
    let n_kmers = sequence.len() - K + 1;
    let mut obs = DecodeObservations::default();

    for (pi, step) in decode.iter().enumerate() {
        let (ei, ki) = (step.event_idx, step.kmer_idx);

        if pi > EDGE_IGNORE && pi < decode.len() - EDGE_IGNORE {
            // Merge steps carry no k-mer transition; skips record only
            // the first skipped transition.
            if step.op != AlignOp::Extend {
                let transition_kmer_from = decode[pi - 1].kmer_idx;
                let transition_kmer_to = match step.op {
                    AlignOp::Skip => transition_kmer_from + 1,
                    _ => ki,
                };
                assert!(transition_kmer_from < n_kmers && transition_kmer_to < n_kmers);
                let rank1 = get_rank(state, sequence, transition_kmer_from);
                let rank2 = get_rank(state, sequence, transition_kmer_to);
                let ke1 = pm.transition_level(rank1);
                let ke2 = pm.transition_level(rank2);
                trace!("TRAIN_SKIP\t{}\t{:.3}\t{:.3}\t{:?}", state.anchor_index, ke1, ke2, step.op);
                obs.transitions.push(TransitionObservation {
                    level_from: ke1,
                    level_to: ke2,
                    kind: step.op,
                });
            }

            let level = read.drift_corrected_level(ei, state.strand);
            assert!(ki < n_kmers);
            let rank = get_rank(state, sequence, ki);
            let model_m = pm.transition_level(rank);
            let model_s = pm.states[rank as usize].level_stdv * pm.scale;
            let norm_level = (level - model_m) / model_s;
            if step.op == AlignOp::Match {
                obs.match_residuals.push(norm_level);
            }
            trace!(
                "TRAIN_EMISSION\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:?}",
                state.anchor_index,
                ei,
                level,
                read.events[state.strand].stdv[ei],
                model_m,
                model_s,
                norm_level,
                step.op,
            );
        }

        obs.n_matches += (step.op == AlignOp::Match) as usize;
        obs.n_merges += (step.op == AlignOp::Extend) as usize;
        obs.n_skips += (step.op == AlignOp::Skip) as usize;
    }
    obs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::ReadState;
    use crate::sim;

    #[test]
    fn interior_matches_yield_observations() {
        let seq = b"ACGTAACCGGTTACGTACGTAACC";
        let buffers = sim::ideal_events(seq, &sim::test_pore_model());
        let read = sim::read_from(&buffers);
        let state = ReadState {
            read_idx: 0,
            anchor_index: 0,
            strand: 0,
            event_start_idx: 0,
            event_stop_idx: buffers.n_events() - 1,
            stride: 1,
            rc: false,
        };
        let obs = collect_observations(seq, &read, &state);
        let n_kmers = seq.len() - K + 1;
        // one match per k-mer, no merges or skips under the exact model
        assert_eq!(obs.n_matches, n_kmers);
        assert_eq!(obs.n_merges, 0);
        assert_eq!(obs.n_skips, 0);
        // only the interior of the decode is recorded
        assert_eq!(obs.transitions.len(), n_kmers - 2 * EDGE_IGNORE - 1);
        assert_eq!(obs.match_residuals.len(), n_kmers - 2 * EDGE_IGNORE - 1);
        // exact events sit exactly on the (unshifted) model mean
        assert!(obs.match_residuals.iter().all(|x| x.abs() < 1e-9));
        assert!(obs
            .transitions
            .iter()
            .all(|t| t.kind == AlignOp::Match));
    }

    #[test]
    fn doubled_events_count_merges() {
        let seq = b"ACGTAACCGGTTACGTACGT";
        let buffers = sim::events_with_repeats(seq, &sim::test_pore_model(), 2);
        let read = sim::read_from(&buffers);
        let state = ReadState {
            read_idx: 0,
            anchor_index: 0,
            strand: 0,
            event_start_idx: 0,
            event_stop_idx: buffers.n_events() - 1,
            stride: 1,
            rc: false,
        };
        let obs = collect_observations(seq, &read, &state);
        let n_kmers = seq.len() - K + 1;
        assert_eq!(obs.n_matches, n_kmers);
        assert_eq!(obs.n_merges, n_kmers);
        assert_eq!(obs.n_skips, 0);
    }
}
