//! Alternative scorers sharing the forward scorer's contract. Kept for
//! comparison runs and for merge-aware rescoring of a decoded alignment.

use super::{
    fill_transitions, get_rank, log_probability_match, log_probability_range_match,
    posterior_decode,
};
use crate::matrix::Matrix;
use crate::read::{ReadState, SquiggleRead};
use crate::{K, KHMM_MAX_JUMP, KHMM_MAX_MERGE};

/// Viterbi over (event-run, k-mer) blocks: a k-mer may own up to
/// [`KHMM_MAX_MERGE`] consecutive events, entered by a jump of up to
/// [`KHMM_MAX_JUMP`] k-mers.
pub fn score_skip_merge(seq: &[u8], read: &SquiggleRead, state: &ReadState) -> f64 {
    let n_kmers = seq.len() - K + 1;
    let n_states = n_kmers + 2;
    let tm = fill_transitions(seq, read, state);

    let n_rows = state.n_events() + 1;
    let mut m = Matrix::new(n_rows, n_states, 0.0);
    super::initialize_forward(&mut m);

    for row in 1..n_rows {
        for col in 1..n_states - 1 {
            let first_possible_row = if row > KHMM_MAX_MERGE {
                row - KHMM_MAX_MERGE
            } else {
                1
            };
            let first_possible_col = col.saturating_sub(KHMM_MAX_JUMP);
            let mut max = f64::NEG_INFINITY;
            for start_row in first_possible_row..=row {
                for start_col in first_possible_col..col {
                    let m_prev = m.get(start_row - 1, start_col);
                    let start_event = state.event_at(start_row);
                    let end_event = state.event_at(row);
                    let rank = get_rank(state, seq, col - 1);
                    let lp_r_e = log_probability_range_match(
                        read,
                        rank,
                        start_event,
                        end_event,
                        state.stride,
                        state.strand,
                    );
                    let t_jump = tm.get(start_col, col);
                    let n_merges = (row - start_row) as f64;
                    let t_merge = n_merges * tm.get(col, col);
                    max = max.max(m_prev + lp_r_e + t_jump + t_merge);
                }
            }
            m.set(row, col, max);
        }
    }

    let tcol = n_states - 1;
    let lrow = n_rows - 1;
    (0..n_states - 1)
        .map(|col| tm.get(col, tcol) + m.get(lrow, col))
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Emission-only grid with moves up/diag (emitting) and left (free).
/// A cheap baseline with no transition model at all.
pub fn score_emission_dp(seq: &[u8], read: &SquiggleRead, state: &ReadState) -> f64 {
    let n_kmers = seq.len() - K + 1;
    let n_cols = n_kmers + 1;
    let n_rows = state.n_events() + 1;

    let mut m = Matrix::new(n_rows, n_cols, f64::NEG_INFINITY);
    m.set(0, 0, 0.0);

    for row in 1..n_rows {
        for col in 1..n_cols {
            let event_idx = state.event_at(row);
            let rank = get_rank(state, seq, col - 1);
            let lp_e = log_probability_match(read, rank, event_idx, state.strand);
            let up = lp_e + m.get(row - 1, col);
            let diag = lp_e + m.get(row - 1, col - 1);
            let left = m.get(row, col - 1);
            m.set(row, col, up.max(diag).max(left));
        }
    }
    m.get(n_rows - 1, n_cols - 1)
}

/// Rescore a posterior decode after collapsing same-k-mer runs: the run's
/// transitions plus a single range emission per k-mer.
pub fn score_postmerge(seq: &[u8], read: &SquiggleRead, state: &ReadState) -> f64 {
    let decode = posterior_decode(seq, read, state);
    let mut lp = 0.0;
    let mut di = 0;
    while di < decode.len() {
        let ki = decode[di].kmer_idx;
        let start = di;
        while di < decode.len() && decode[di].kmer_idx == ki {
            di += 1;
        }
        for step in &decode[start..di] {
            lp += step.log_transition;
        }
        let start_event = decode[start].event_idx;
        let end_event = decode[di - 1].event_idx;
        let rank = get_rank(state, seq, ki);
        lp += log_probability_range_match(
            read,
            rank,
            start_event,
            end_event,
            state.stride,
            state.strand,
        );
    }
    lp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    fn forward_state(n_events: usize) -> ReadState {
        ReadState {
            read_idx: 0,
            anchor_index: 0,
            strand: 0,
            event_start_idx: 0,
            event_stop_idx: n_events - 1,
            stride: 1,
            rc: false,
        }
    }

    #[test]
    fn skip_merge_prefers_the_true_sequence() {
        let seq = b"ACGTACGTACGTACGT".to_vec();
        let buffers = sim::events_with_repeats(&seq, &sim::test_pore_model(), 2);
        let read = sim::read_from(&buffers);
        let state = forward_state(buffers.n_events());
        let base = score_skip_merge(&seq, &read, &state);
        assert!(base.is_finite());
        let mut mutated = seq.clone();
        mutated[seq.len() / 2] = b'C';
        assert_ne!(mutated, seq);
        let worse = score_skip_merge(&mutated, &read, &state);
        assert!(worse < base);
    }

    #[test]
    fn emission_dp_is_a_relaxation() {
        // Dropping the transition model can only raise the score of the
        // best path over the same emissions.
        let seq = b"ACGTACGTACGT";
        let buffers = sim::ideal_events(seq, &sim::test_pore_model());
        let read = sim::read_from(&buffers);
        let state = forward_state(buffers.n_events());
        let emission_only = score_emission_dp(seq, &read, &state);
        let forward = crate::khmm::score_forward(
            seq,
            &read,
            &state,
            crate::khmm::AlignmentPolicy::Global,
        );
        assert!(emission_only >= forward);
    }

    #[test]
    fn postmerge_rescore_is_finite_and_negative() {
        let seq = b"ACGTACGTACGT";
        let buffers = sim::events_with_repeats(seq, &sim::test_pore_model(), 3);
        let read = sim::read_from(&buffers);
        let state = forward_state(buffers.n_events());
        let lp = score_postmerge(seq, &read, &state);
        assert!(lp.is_finite());
        assert!(lp < 0.0);
    }
}
