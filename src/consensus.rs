//! Candidate generation and selection: single-base mutations, k-LCS
//! splice alternates, cross-read path scoring with culling, and the
//! per-segment refinement driver.

use crate::khmm::score_sequence;
use crate::kmer::lexicographic_next;
use crate::matrix::Matrix;
use crate::read::{ReadState, SquiggleRead};
use crate::{AnchoredColumn, EngineConfig, EngineError, Result, K};
use log::{debug, info, log_enabled};
use rayon::prelude::*;
use std::collections::HashSet;

/// A draft sequence under evaluation, with its cross-read aggregates.
#[derive(Debug, Clone)]
pub struct PathCandidate {
    pub path: Vec<u8>,
    /// Sum over reads of (score - score of the unmodified draft).
    pub score: f64,
    pub sum_rank: usize,
    pub num_improved: usize,
    pub num_scored: usize,
    pub mutdesc: String,
}

impl PathCandidate {
    pub fn new(path: Vec<u8>) -> Self {
        Self::with_desc(path, String::new())
    }
    fn with_desc(path: Vec<u8>, mutdesc: String) -> Self {
        Self {
            path,
            score: 0.0,
            sum_rank: 0,
            num_improved: 0,
            num_scored: 0,
            mutdesc,
        }
    }
    fn reset(&mut self) {
        self.score = 0.0;
        self.sum_rank = 0;
        self.num_improved = 0;
        self.num_scored = 0;
    }
}

/// Read states spanning `start_column` to `end_column`. Strands without
/// an event at either anchor are dropped.
pub(crate) fn read_states_for_columns(
    start_column: &AnchoredColumn,
    end_column: &AnchoredColumn,
) -> Result<Vec<ReadState>> {
    assert_eq!(start_column.anchors.len(), end_column.anchors.len());
    let mut read_states = Vec::new();
    for rsi in 0..start_column.anchors.len() {
        let start_ra = start_column.anchors[rsi];
        let end_ra = end_column.anchors[rsi];
        if start_ra.event_idx == -1 || end_ra.event_idx == -1 {
            continue;
        }
        if start_ra.rc != end_ra.rc {
            return Err(EngineError::StrandDisagreement(rsi));
        }
        let event_start_idx = start_ra.event_idx as usize;
        let event_stop_idx = end_ra.event_idx as usize;
        read_states.push(ReadState {
            read_idx: rsi / 2,
            anchor_index: rsi,
            strand: rsi % 2,
            event_start_idx,
            event_stop_idx,
            stride: if event_start_idx < event_stop_idx { 1 } else { -1 },
            rc: start_ra.rc,
        });
    }
    Ok(read_states)
}

/// Longest common subsequence of 5-mers between `a` and `b`, returned as
/// the matched `(i, j)` k-mer index pairs in left-to-right order.
pub fn klcs(a: &[u8], b: &[u8]) -> Vec<(usize, usize)> {
    let n_kmers_a = a.len() - K + 1;
    let n_kmers_b = b.len() - K + 1;
    let mut m = Matrix::new(n_kmers_a + 1, n_kmers_b + 1, 0u32);
    for row in 1..=n_kmers_a {
        for col in 1..=n_kmers_b {
            let score = if a[row - 1..row - 1 + K] == b[col - 1..col - 1 + K] {
                m.get(row - 1, col - 1) + 1
            } else {
                m.get(row - 1, col).max(m.get(row, col - 1))
            };
            m.set(row, col, score);
        }
    }
    let mut result = Vec::new();
    let (mut row, mut col) = (n_kmers_a, n_kmers_b);
    while row > 0 && col > 0 {
        if a[row - 1..row - 1 + K] == b[col - 1..col - 1 + K] {
            result.push((row - 1, col - 1));
            row -= 1;
            col -= 1;
        } else if m.get(row - 1, col) > m.get(row, col - 1) {
            row -= 1;
        } else {
            col -= 1;
        }
    }
    result.reverse();
    result
}

/// All single-base edits of the interior of `sequence`, the unmodified
/// sequence first.
pub fn generate_mutations(sequence: &[u8]) -> Vec<PathCandidate> {
    let mut mutations = vec![PathCandidate::new(sequence.to_vec())];
    for si in K..sequence.len().saturating_sub(K) {
        for &b in b"ACGT" {
            if sequence[si] == b {
                continue;
            }
            let mut path = sequence.to_vec();
            path[si] = b;
            mutations.push(PathCandidate::with_desc(
                path,
                format!("sub-{}-{}", si, b as char),
            ));
        }
        let mut path = sequence.to_vec();
        path.remove(si);
        mutations.push(PathCandidate::with_desc(path, format!("del-{}", si)));
        for &b in b"ACGT" {
            let mut path = sequence.to_vec();
            path.insert(si, b);
            mutations.push(PathCandidate::with_desc(
                path,
                format!("ins-{}-{}", si, b as char),
            ));
        }
    }
    mutations
}

/// Candidates splicing each divergent region of an alternate into `base`,
/// aligned on matching 5-mers.
pub fn generate_alt_paths(
    paths: &mut Vec<PathCandidate>,
    base: &[u8],
    alts: &[Vec<u8>],
) {
    for alt in alts {
        let result = klcs(base, alt);
        let mut match_idx = 0;
        while match_idx < result.len() {
            let last_idx = result.len() - 1;
            // advance to the next point of divergence
            while match_idx != last_idx
                && result[match_idx].0 == result[match_idx + 1].0 - 1
                && result[match_idx].1 == result[match_idx + 1].1 - 1
            {
                match_idx += 1;
            }
            if match_idx == last_idx {
                break;
            }
            let bl = result[match_idx + 1].0 - result[match_idx].0;
            let rl = result[match_idx + 1].1 - result[match_idx].1;
            let (bi, ai) = result[match_idx];
            let mut path = base[..bi].to_vec();
            path.extend_from_slice(&alt[ai..ai + rl]);
            path.extend_from_slice(&base[bi + bl..]);
            paths.push(PathCandidate::new(path));
            match_idx += 1;
        }
    }
}

/// Replace `paths` with every length-k extension (k = 1..=maxk) inserted
/// just before the final k-mer of each path.
pub fn extend_paths(paths: &mut Vec<PathCandidate>, maxk: usize) {
    let mut new_paths = Vec::new();
    for k in 1..=maxk {
        for p in paths.iter() {
            let first = vec![b'A'; k];
            let mut extension = first.clone();
            loop {
                let mut path = p.path.clone();
                let at = path.len() - K;
                path.splice(at..at, extension.iter().copied());
                new_paths.push(PathCandidate::new(path));
                lexicographic_next(&mut extension);
                if extension == first {
                    break;
                }
            }
        }
    }
    *paths = new_paths;
}

/// Score every path against every read state, aggregate ranks and score
/// differences against the unmodified draft (path 0), and periodically
/// cull hopeless paths. `paths` ends sorted by descending cumulative
/// score; the winner is `paths[0]`.
pub fn score_paths(
    paths: &mut Vec<PathCandidate>,
    reads: &[SquiggleRead],
    read_states: &[ReadState],
    config: &EngineConfig,
) {
    let first = paths[0].path.clone();

    let mut path_string_set = HashSet::new();
    paths.retain(|p| path_string_set.insert(p.path.clone()));
    paths.iter_mut().for_each(PathCandidate::reset);

    for (ri, read_state) in read_states.iter().enumerate() {
        debug!("scoring read state {}", ri);
        let read = &reads[read_state.read_idx];
        let parameters = &read.parameters[read_state.strand];
        if parameters.fit_quality.abs() > config.min_fit {
            continue;
        }

        let mut result: Vec<(f64, usize)> = paths
            .par_iter()
            .enumerate()
            .map(|(pi, p)| (score_sequence(&p.path, read, read_state, config.scoring), pi))
            .collect();
        let first_path_score = result[0].0;
        result.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        for (rank, &(score, pi)) in result.iter().enumerate() {
            paths[pi].score += score - first_path_score;
            paths[pi].sum_rank += rank;
            paths[pi].num_improved += (score > first_path_score) as usize;
            paths[pi].num_scored += 1;
        }

        if ri > 0 && ri % config.cull_rate == 0 {
            let mut pi = 0;
            paths.retain(|p| {
                let improved_fraction = p.num_improved as f64 / p.num_scored as f64;
                let keep = pi == 0
                    || p.score > config.cull_min_score
                    || improved_fraction >= config.cull_min_improved_fraction;
                pi += 1;
                keep
            });
        }
    }

    paths.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());

    if log_enabled!(log::Level::Debug) {
        for (pi, p) in paths.iter().enumerate() {
            let initial = if p.path == first { 'I' } else { ' ' };
            debug!(
                "{}\t{}\t{:.1}\t{} {} {}",
                pi,
                String::from_utf8_lossy(&p.path),
                p.score,
                p.sum_rank,
                initial,
                p.mutdesc
            );
        }
    }
}

/// Drop read states whose per-event log-likelihood on `sequence` marks
/// them as outliers.
pub(crate) fn filter_outlier_read_states(
    read_states: &mut Vec<ReadState>,
    sequence: &[u8],
    reads: &[SquiggleRead],
    config: &EngineConfig,
) {
    let mut ri = 0;
    read_states.retain(|rs| {
        let curr = score_sequence(sequence, &reads[rs.read_idx], rs, config.scoring);
        let n_events = rs.n_events() as f64;
        let lp_per_event = curr / n_events;
        debug!("OUTLIER_FILTER {} {:.2} {:.2} {:.2}", ri, curr, n_events, lp_per_event);
        ri += 1;
        lp_per_event.abs() < config.outlier_threshold
    });
}

/// Hill-climb over single-base mutations until a fixed point. Returns the
/// runner-up of the last round for diagnostics.
pub(crate) fn run_mutation(
    base: &mut Vec<u8>,
    reads: &[SquiggleRead],
    read_states: &[ReadState],
    config: &EngineConfig,
) -> Vec<u8> {
    let mut second_best = Vec::new();
    for _ in 0..config.mutation_rounds {
        let mut paths = generate_mutations(base);
        score_paths(&mut paths, reads, read_states, config);
        second_best = match paths.get(1) {
            Some(p) => p.path.clone(),
            None => Vec::new(),
        };
        if paths[0].path == *base {
            break;
        }
        *base = paths[0].path.clone();
    }
    second_best
}

/// Join two sequences that overlap in exactly one k-mer.
pub(crate) fn join_sequences_at_kmer(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    if a.len() < K || b.len() < K || a[a.len() - K..] != b[..K] {
        return Err(EngineError::KmerJoinMismatch);
    }
    let mut joined = a.to_vec();
    joined.extend_from_slice(&b[K..]);
    Ok(joined)
}

/// Refine the consensus between anchored columns (S, M, E) =
/// `columns[segment_id..segment_id + 3]`: splice in alternates, then
/// hill-climb mutations, then split the result at the midpoint k-mer and
/// re-anchor the middle column's events.
pub(crate) fn run_splice_segment(
    reads: &[SquiggleRead],
    columns: &mut [AnchoredColumn],
    segment_id: usize,
    config: &EngineConfig,
) -> Result<()> {
    assert!(segment_id + 2 < columns.len());
    let s_m_base = columns[segment_id].base_sequence.clone();
    let m_e_base = columns[segment_id + 1].base_sequence.clone();

    let original = join_sequences_at_kmer(&s_m_base, &m_e_base)?;
    let mut base = original.clone();

    // Alternates for the whole (S, E) window: S alternates carry the
    // middle base sequence, and vice versa.
    let mut alts: Vec<Vec<u8>> = Vec::new();
    for alt in columns[segment_id].alt_sequences.iter() {
        if m_e_base.len() >= K {
            let mut whole = alt.clone();
            whole.extend_from_slice(&m_e_base[K..]);
            alts.push(whole);
        }
    }
    for alt in columns[segment_id + 1].alt_sequences.iter() {
        if alt.len() >= K {
            let mut whole = s_m_base[..s_m_base.len() - K].to_vec();
            whole.extend_from_slice(alt);
            alts.push(whole);
        }
    }

    let mut read_states =
        read_states_for_columns(&columns[segment_id], &columns[segment_id + 2])?;
    filter_outlier_read_states(&mut read_states, &base, reads, config);

    if read_states.is_empty() {
        info!("SKIP[{}] no read states span this segment", segment_id);
        return Ok(());
    }

    for _ in 0..config.refinement_rounds {
        let mut paths = vec![PathCandidate::new(base.clone())];
        generate_alt_paths(&mut paths, &base, &alts);
        score_paths(&mut paths, reads, read_states.as_slice(), config);
        if paths[0].path == base {
            break;
        }
        base = paths[0].path.clone();
    }

    let second_best = run_mutation(&mut base, reads, &read_states, config);
    if log_enabled!(log::Level::Trace) && !second_best.is_empty() {
        for rs in read_states.iter() {
            crate::khmm::decode_report("best", segment_id, rs, &base, &reads[rs.read_idx]);
            crate::khmm::decode_report("second", segment_id, rs, &second_best, &reads[rs.read_idx]);
        }
    }

    info!("ORIGINAL[{}] {}", segment_id, String::from_utf8_lossy(&original));
    info!("RESULT[{}]   {}", segment_id, String::from_utf8_lossy(&base));

    // Cut the new consensus in the middle, keeping the k-mer overlap
    // between the two rewritten segments.
    assert!(base.len() >= K);
    let midpoint_kmer = (base.len() - K + 1) / 2;
    let s_m_fixed = base[..midpoint_kmer + K].to_vec();
    let m_e_fixed = base[midpoint_kmer..].to_vec();
    assert_eq!(s_m_fixed[s_m_fixed.len() - K..], m_e_fixed[..K]);
    columns[segment_id].base_sequence = s_m_fixed;
    columns[segment_id + 1].base_sequence = m_e_fixed;

    // Re-anchor the middle column: the event of the decoded step closest
    // to the midpoint k-mer, ties toward the later event.
    for rs in read_states.iter() {
        let decodes = crate::khmm::posterior_decode(&base, &reads[rs.read_idx], rs);
        let mut min_k_dist = base.len() as i64;
        let mut event_idx = 0;
        for step in decodes.iter() {
            let dist = (step.kmer_idx as i64 - midpoint_kmer as i64).abs();
            if dist <= min_k_dist {
                min_k_dist = dist;
                event_idx = step.event_idx;
            }
        }
        columns[segment_id + 1].anchors[rs.anchor_index].event_idx = event_idx as i64;
    }
    Ok(())
}
