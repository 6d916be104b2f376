//! The k-mer hidden Markov model: emissions under the scaled pore model,
//! the sequence-conditional transition matrix, and the forward/backward
//! dynamic programs with their posterior decoder.

pub mod alternates;

use crate::kmer::{kmer_rank, rc_kmer_rank};
use crate::matrix::Matrix;
use crate::read::{ReadState, SquiggleRead};
use crate::{K, KHMM_MAX_JUMP};
use serde::{Deserialize, Serialize};

/// Rate of the exponential duration prior used by range emissions.
pub(crate) const EVENT_RATE: f64 = 27.777;

/// Decoded alignment operation between consecutive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignOp {
    /// Advance one k-mer.
    Match,
    /// Stay on the same k-mer.
    Extend,
    /// Jump two or more k-mers.
    Skip,
}

/// How the forward score is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentPolicy {
    /// Terminate from the last event row only.
    Global,
    /// Best termination over all event rows.
    SemiKmer,
}

/// The scorer dispatched at the scoring boundary; the DP loops below
/// stay monomorphic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringModel {
    #[default]
    ForwardGlobal,
    ForwardSemiKmer,
    ViterbiSkipMerge,
    EmissionOnly,
}

/// One step of a posterior decode: an event assigned to a k-mer.
#[derive(Debug, Clone, Copy)]
pub struct PosteriorStep {
    pub event_idx: usize,
    pub kmer_idx: usize,
    pub l_posterior: f64,
    pub l_fm: f64,
    pub log_transition: f64,
    pub op: AlignOp,
}

/// Add two log-scaled values, short-circuiting the doubly-degenerate case.
#[inline]
pub fn add_logs(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

#[inline]
fn log_normal_pdf(x: f64, m: f64, s: f64) -> f64 {
    const LOG_INV_SQRT_2PI: f64 = -0.9189385332046727;
    let a = (x - m) / s;
    LOG_INV_SQRT_2PI - s.ln() - 0.5 * a * a
}

/// Rank of the `ki`-th k-mer of `seq` on the strand this state reads.
#[inline]
pub(crate) fn get_rank(state: &ReadState, seq: &[u8], ki: usize) -> u32 {
    if state.rc {
        rc_kmer_rank(&seq[ki..])
    } else {
        kmer_rank(&seq[ki..])
    }
}

/// Log-probability of one event being emitted by the k-mer of `rank`.
pub(crate) fn log_probability_match(
    read: &SquiggleRead,
    rank: u32,
    event_idx: usize,
    strand: usize,
) -> f64 {
    let pm = &read.pore_model[strand];
    let level = read.drift_corrected_level(event_idx, strand);
    log_normal_pdf(level, pm.scaled_mean(rank), pm.scaled_stdv(rank))
}

/// Log-probability of a run of events all emitted by one k-mer: the
/// duration-weighted mean log-density plus an exponential duration prior.
pub(crate) fn log_probability_range_match(
    read: &SquiggleRead,
    rank: u32,
    event_start: usize,
    event_end: usize,
    stride: i64,
    strand: usize,
) -> f64 {
    let (event_start, event_end) = if stride == -1 {
        (event_end, event_start)
    } else {
        (event_start, event_end)
    };
    let pm = &read.pore_model[strand];
    let m = pm.scaled_mean(rank);
    let s = pm.scaled_stdv(rank);
    let mut duration = 0.0;
    let mut lp = 0.0;
    for ei in event_start..=event_end {
        let d = read.duration(ei, strand);
        let level = read.drift_corrected_level(ei, strand);
        duration += d;
        lp += d * log_normal_pdf(level, m, s);
    }
    lp /= duration;
    lp + EVENT_RATE.ln() - EVENT_RATE * duration.abs()
}

/// Build the state-transition matrix for `seq` in log space. States are
/// one start state, one state per k-mer, one terminal state; entries not
/// reachable within [`KHMM_MAX_JUMP`] stay at -inf.
pub(crate) fn fill_transitions(seq: &[u8], read: &SquiggleRead, state: &ReadState) -> Matrix<f64> {
    let pm = &read.pore_model[state.strand];
    let parameters = &read.parameters[state.strand];
    let n_kmers = seq.len() - K + 1;
    let n_states = n_kmers + 2;
    let terminal_state = n_states - 1;

    let mut tm = Matrix::new(n_states, n_states, f64::NEG_INFINITY);

    // The start state feeds the first k-mer only.
    tm.set(0, 1, 0.0);

    for si in 1..n_states - 1 {
        let ki = si - 1;
        let mut sum = 0.0;
        let last_valid_state = (si + KHMM_MAX_JUMP).min(terminal_state - 1);
        for sj in si..=last_valid_state {
            let kj = sj - 1;
            let p_i_j = if ki == kj {
                parameters.self_transition
            } else {
                let rank_i = get_rank(state, seq, ki);
                let rank_j = get_rank(state, seq, kj);
                let level_i = pm.transition_level(rank_i);
                let level_j = pm.transition_level(rank_j);
                let p_skip = parameters.skip_probability(level_i, level_j);
                let p = (1.0 - sum) * (1.0 - p_skip);
                assert!((0.0..=1.0).contains(&p), "{}", p);
                p
            };
            sum += p_i_j;
            tm.set(si, sj, p_i_j.ln());
        }
    }

    // Only the last k-mer reaches the terminal state.
    tm.set(n_states - 2, n_states - 1, 0.0);
    tm
}

fn initialize_forward(fm: &mut Matrix<f64>) {
    for si in 0..fm.n_cols() {
        fm.set(0, si, f64::NEG_INFINITY);
    }
    for ri in 0..fm.n_rows() {
        fm.set(ri, 0, f64::NEG_INFINITY);
    }
    // probability 1 in the start state for the null row
    fm.set(0, 0, 0.0);
}

// Probability of transitioning to the terminal state from every column
// of the given row.
fn forward_terminate(fm: &Matrix<f64>, tm: &Matrix<f64>, row: usize) -> f64 {
    let tcol = fm.n_cols() - 1;
    let mut sum = f64::NEG_INFINITY;
    for sk in 0..fm.n_cols() - 1 {
        sum = add_logs(sum, tm.get(sk, tcol) + fm.get(row, sk));
    }
    sum
}

fn fill_forward(
    fm: &mut Matrix<f64>,
    tm: &Matrix<f64>,
    seq: &[u8],
    read: &SquiggleRead,
    state: &ReadState,
) -> f64 {
    for row in 1..fm.n_rows() {
        for sl in 1..fm.n_cols() - 1 {
            let first_possible_state = sl.saturating_sub(KHMM_MAX_JUMP);
            let mut sum = f64::NEG_INFINITY;
            for sk in first_possible_state..=sl {
                sum = add_logs(sum, tm.get(sk, sl) + fm.get(row - 1, sk));
            }
            let event_idx = state.event_at(row);
            let rank = get_rank(state, seq, sl - 1);
            let lp_e = log_probability_match(read, rank, event_idx, state.strand);
            fm.set(row, sl, lp_e + sum);
        }
    }
    forward_terminate(fm, tm, fm.n_rows() - 1)
}

fn initialize_backward(bm: &mut Matrix<f64>, tm: &Matrix<f64>) {
    let tcol = tm.n_cols() - 1;
    let row = bm.n_rows() - 1;
    for si in 0..bm.n_cols() {
        bm.set(row, si, tm.get(si, tcol));
    }
}

fn fill_backward(
    bm: &mut Matrix<f64>,
    tm: &Matrix<f64>,
    seq: &[u8],
    read: &SquiggleRead,
    state: &ReadState,
) {
    for row in (1..bm.n_rows() - 1).rev() {
        for sk in 1..bm.n_cols() - 1 {
            let mut sum = f64::NEG_INFINITY;
            for sl in 1..bm.n_cols() - 1 {
                // emit event i + 1 in state sl
                let event_idx = state.event_at(row + 1);
                let rank = get_rank(state, seq, sl - 1);
                let lp_e = log_probability_match(read, rank, event_idx, state.strand);
                sum = add_logs(sum, lp_e + tm.get(sk, sl) + bm.get(row + 1, sl));
            }
            bm.set(row, sk, sum);
        }
    }
}

/// Forward score of `seq` against one read strand.
pub fn score_forward(
    seq: &[u8],
    read: &SquiggleRead,
    state: &ReadState,
    policy: AlignmentPolicy,
) -> f64 {
    let n_kmers = seq.len() - K + 1;
    let n_states = n_kmers + 2;
    let tm = fill_transitions(seq, read, state);

    let n_rows = state.n_events() + 1;
    let mut fm = Matrix::new(n_rows, n_states, 0.0);
    initialize_forward(&mut fm);
    let global = fill_forward(&mut fm, &tm, seq, read, state);

    match policy {
        AlignmentPolicy::Global => global,
        AlignmentPolicy::SemiKmer => {
            let mut best_score = f64::NEG_INFINITY;
            for row in 1..n_rows - 1 {
                best_score = best_score.max(forward_terminate(&fm, &tm, row));
            }
            best_score
        }
    }
}

/// Maximum-a-posteriori assignment of every event to a k-mer, classified
/// into match/extend/skip steps.
pub fn posterior_decode(seq: &[u8], read: &SquiggleRead, state: &ReadState) -> Vec<PosteriorStep> {
    let n_kmers = seq.len() - K + 1;
    let n_states = n_kmers + 2;
    let tm = fill_transitions(seq, read, state);

    let n_rows = state.n_events() + 1;
    let mut fm = Matrix::new(n_rows, n_states, 0.0);
    initialize_forward(&mut fm);
    let lf = fill_forward(&mut fm, &tm, seq, read, state);

    let mut bm = Matrix::new(n_rows, n_states, 0.0);
    initialize_backward(&mut bm, &tm);
    fill_backward(&mut bm, &tm, seq, read, state);

    let mut output = Vec::with_capacity(n_rows - 1);
    let mut row = n_rows - 1;
    let mut col = n_states - 1;
    while row > 0 {
        let first_possible_col = if col >= KHMM_MAX_JUMP {
            col - KHMM_MAX_JUMP
        } else {
            1
        };
        let mut max_posterior = f64::NEG_INFINITY;
        let mut max_s = 0;
        for si in first_possible_col..=col {
            let lp = fm.get(row, si) + bm.get(row, si) - lf;
            if lp > max_posterior {
                max_posterior = lp;
                max_s = si;
            }
        }
        output.push(PosteriorStep {
            event_idx: state.event_at(row),
            kmer_idx: max_s - 1,
            l_posterior: max_posterior,
            l_fm: fm.get(row, max_s),
            log_transition: 0.0,
            op: AlignOp::Match,
        });
        row -= 1;
        col = max_s;
    }
    output.reverse();

    // The first state is always a match, entered from the start state.
    output[0].op = AlignOp::Match;
    output[0].log_transition = tm.get(0, output[0].kmer_idx + 1);
    let mut prev_ei = output[0].event_idx;
    let mut prev_ki = output[0].kmer_idx;
    for pi in 1..output.len() {
        let ei = output[pi].event_idx;
        let ki = output[pi].kmer_idx;
        output[pi].log_transition = tm.get(prev_ki + 1, ki + 1);
        assert_eq!(prev_ei.abs_diff(ei), 1);
        output[pi].op = if ki == prev_ki {
            AlignOp::Extend
        } else if ki - prev_ki == 1 {
            AlignOp::Match
        } else {
            assert!(ki - prev_ki > 1);
            AlignOp::Skip
        };
        prev_ei = ei;
        prev_ki = ki;
    }
    output
}

/// Trace-level dump of a posterior decode plus a one-line summary, for
/// comparing candidate sequences on a read by eye.
pub fn decode_report(name: &str, seq_id: usize, state: &ReadState, seq: &[u8], read: &SquiggleRead) {
    use log::{debug, trace};
    let decode = posterior_decode(seq, read, state);
    let pm = &read.pore_model[state.strand];
    let (mut n_matches, mut n_merges, mut n_skips, mut n_mergeskips) = (0, 0, 0, 0);
    let mut prev_op = None;
    for step in decode.iter() {
        let (ei, ki) = (step.event_idx, step.kmer_idx);
        let level = read.drift_corrected_level(ei, state.strand);
        let rank = get_rank(state, seq, ki);
        let model_m = pm.transition_level(rank);
        let model_s = pm.states[rank as usize].level_stdv * pm.scale;
        n_matches += (step.op == AlignOp::Match) as usize;
        n_merges += (step.op == AlignOp::Extend) as usize;
        n_skips += (step.op == AlignOp::Skip) as usize;
        n_mergeskips += (step.op == AlignOp::Skip && prev_op == Some(AlignOp::Extend)) as usize;
        trace!(
            "DEBUG\t{}\t{}\t{}\t{:?}\t{}\t{}\t{}\t{:.3}\t{:.1}\t{:.1}\t{:.1}\t{:.2}\t{:.2}",
            name,
            seq_id,
            state.rc,
            step.op,
            ei,
            ki,
            String::from_utf8_lossy(&seq[ki..ki + K]),
            read.duration(ei, state.strand),
            level,
            model_m,
            (level - model_m) / model_s,
            step.l_posterior.exp(),
            step.l_fm,
        );
        prev_op = Some(step.op);
    }
    let events = &read.events[state.strand];
    let total_duration =
        (events.time[state.event_start_idx] - events.time[state.event_stop_idx]).abs();
    let num_events = state.n_events();
    let final_lp = decode.last().map(|s| s.l_fm).unwrap_or(f64::NEG_INFINITY);
    debug!(
        "SUMMARY\t{}\t{}\t{}\t{:.2}\t{:.2}\t{}\t{}\t{}\t{}\t{}\t{:.2}",
        name,
        seq_id,
        state.rc,
        final_lp,
        final_lp / num_events as f64,
        num_events,
        n_matches,
        n_merges,
        n_skips,
        n_mergeskips,
        total_duration,
    );
}

/// Score `seq` against one read strand with the configured scorer.
pub fn score_sequence(
    seq: &[u8],
    read: &SquiggleRead,
    state: &ReadState,
    model: ScoringModel,
) -> f64 {
    match model {
        ScoringModel::ForwardGlobal => score_forward(seq, read, state, AlignmentPolicy::Global),
        ScoringModel::ForwardSemiKmer => score_forward(seq, read, state, AlignmentPolicy::SemiKmer),
        ScoringModel::ViterbiSkipMerge => alternates::score_skip_merge(seq, read, state),
        ScoringModel::EmissionOnly => alternates::score_emission_dp(seq, read, state),
    }
}
