//! Consensus calling from nanopore signal events.
//!
//! Each read is a stream of measured current levels, one event per 5-mer
//! window moving through the pore. Given a draft sequence anchored at
//! known event positions across many reads, the [`Engine`] iteratively
//! edits the draft, segment by segment, to maximize the joint probability
//! of the observed events under a k-mer hidden Markov model, and can
//! re-estimate each strand's transition hyperparameters from the decoded
//! alignments.
//!
//! The caller supplies already-detected events, pore models and anchored
//! columns; event buffers are borrowed, not copied.

pub mod consensus;
pub mod khmm;
pub mod kmer;
pub mod matrix;
pub mod params;
pub mod read;
pub mod sim;
mod training;

pub use consensus::PathCandidate;
pub use khmm::{add_logs, AlignOp, AlignmentPolicy, PosteriorStep, ScoringModel};
pub use params::{KhmmParameters, TrainingData};
pub use read::{EventSequence, KmerState, PoreModel, ReadState, SquiggleRead};

use log::info;
use thiserror::Error;

/// Window length of the pore model.
pub const K: usize = 5;
/// Number of strands per read.
pub const NUM_STRANDS: usize = 2;
/// Required number of k-mer states per pore model.
pub const N_KMER_STATES: usize = 1024;
/// Longest forward jump the transition model allows.
pub const KHMM_MAX_JUMP: usize = 5;
/// Most consecutive events one k-mer may own in the skip-merge scorer.
pub const KHMM_MAX_MERGE: usize = 10;

/// Contract violations surfaced by the ingestion API and the drivers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pore model must have 1024 k-mer states, found {0}")]
    PoreModelSize(usize),
    #[error("anchored column holds {found} read anchors, expected {expected}")]
    AnchorCount { expected: usize, found: usize },
    #[error("no anchored column is open")]
    NoOpenColumn,
    #[error("read anchors disagree on orientation at anchor {0}")]
    StrandDisagreement(usize),
    #[error("adjacent segment sequences do not overlap in their last/first 5 bases")]
    KmerJoinMismatch,
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Tunables of the refinement loop. The defaults reproduce the reference
/// behavior; `min_fit` defaults to infinity, so the fit-quality gate
/// passes every strand.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads for path scoring; 0 picks the rayon default.
    pub threads: usize,
    pub scoring: ScoringModel,
    pub min_fit: f64,
    pub refinement_rounds: usize,
    pub mutation_rounds: usize,
    pub cull_rate: usize,
    pub cull_min_score: f64,
    pub cull_min_improved_fraction: f64,
    pub outlier_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            scoring: ScoringModel::default(),
            min_fit: f64::INFINITY,
            refinement_rounds: 6,
            mutation_rounds: 10,
            cull_rate: 5,
            cull_min_score: -30.0,
            cull_min_improved_fraction: 0.2,
            outlier_threshold: 3.5,
        }
    }
}

/// One read strand's binding of an anchored column to an event index;
/// -1 marks a strand with no event at this column.
#[derive(Debug, Clone, Copy)]
pub struct ReadAnchor {
    pub event_idx: i64,
    /// Strand orientation with respect to the consensus.
    pub rc: bool,
}

/// A named position along the draft: the current draft segment starting
/// here, candidate alternates, and one anchor per read strand.
#[derive(Debug, Clone, Default)]
pub struct AnchoredColumn {
    pub anchors: Vec<ReadAnchor>,
    pub base_sequence: Vec<u8>,
    pub alt_sequences: Vec<Vec<u8>>,
}

/// The consensus engine: reads, anchored columns and the refinement
/// drivers. One instance per job; all state is owned here rather than in
/// process-wide globals.
pub struct Engine<'a> {
    config: EngineConfig,
    pool: rayon::ThreadPool,
    reads: Vec<SquiggleRead<'a>>,
    anchored_columns: Vec<AnchoredColumn>,
    consensus_result: Vec<u8>,
}

impl<'a> Engine<'a> {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()?;
        Ok(Self {
            config,
            pool,
            reads: Vec::new(),
            anchored_columns: Vec::new(),
            consensus_result: Vec::new(),
        })
    }

    /// Append a read. Both strands' pore models must carry exactly
    /// [`N_KMER_STATES`] states.
    pub fn add_read(&mut self, read: SquiggleRead<'a>) -> Result<()> {
        for pm in read.pore_model.iter() {
            if pm.states.len() != N_KMER_STATES {
                return Err(EngineError::PoreModelSize(pm.states.len()));
            }
        }
        self.reads.push(read);
        Ok(())
    }

    /// Open a new anchored column at the end of the draft.
    pub fn start_anchored_column(&mut self) {
        self.anchored_columns.push(AnchoredColumn::default());
    }

    pub fn add_read_anchor(&mut self, event_idx: i64, rc: bool) -> Result<()> {
        let column = self.open_column()?;
        column.anchors.push(ReadAnchor { event_idx, rc });
        Ok(())
    }

    pub fn add_base_sequence(&mut self, sequence: &[u8]) -> Result<()> {
        let column = self.open_column()?;
        column.base_sequence = sequence.to_vec();
        Ok(())
    }

    pub fn add_alt_sequence(&mut self, sequence: &[u8]) -> Result<()> {
        let column = self.open_column()?;
        column.alt_sequences.push(sequence.to_vec());
        Ok(())
    }

    /// Close the open column, validating one anchor per read strand.
    pub fn end_anchored_column(&mut self) -> Result<()> {
        let expected = self.reads.len() * NUM_STRANDS;
        let found = self.open_column()?.anchors.len();
        if found != expected {
            return Err(EngineError::AnchorCount { expected, found });
        }
        Ok(())
    }

    fn open_column(&mut self) -> Result<&mut AnchoredColumn> {
        self.anchored_columns
            .last_mut()
            .ok_or(EngineError::NoOpenColumn)
    }

    /// Refine every segment left to right and accumulate the consensus.
    pub fn run_splice(&mut self) -> Result<()> {
        let reads = &self.reads;
        let columns = &mut self.anchored_columns;
        let config = &self.config;
        let consensus = self.pool.install(move || -> Result<Vec<u8>> {
            let mut uncorrected: Vec<u8> = Vec::new();
            let mut consensus: Vec<u8> = Vec::new();
            for segment_id in 0..columns.len().saturating_sub(2) {
                if uncorrected.is_empty() {
                    uncorrected = columns[segment_id].base_sequence.clone();
                } else {
                    uncorrected.extend_from_slice(&columns[segment_id].base_sequence[K..]);
                }

                consensus::run_splice_segment(reads, columns, segment_id, config)?;

                // the segment driver has rewritten this column's base
                let base = &columns[segment_id].base_sequence;
                if consensus.is_empty() {
                    consensus = base.clone();
                } else if consensus[consensus.len() - K..] == base[..K] {
                    consensus.extend_from_slice(&base[K..]);
                } else {
                    return Err(EngineError::KmerJoinMismatch);
                }

                info!(
                    "UNCORRECT[{}]: {}",
                    segment_id,
                    String::from_utf8_lossy(&uncorrected)
                );
                info!(
                    "CONSENSUS[{}]: {}",
                    segment_id,
                    String::from_utf8_lossy(&consensus)
                );
            }
            Ok(consensus)
        })?;
        self.consensus_result = consensus;
        Ok(())
    }

    /// The consensus produced by the last [`Engine::run_splice`] call.
    pub fn consensus_result(&self) -> &[u8] {
        &self.consensus_result
    }

    /// Accumulate training observations from one segment's decodes.
    pub fn train_segment(&mut self, segment_id: usize) -> Result<()> {
        assert!(segment_id + 2 < self.anchored_columns.len());
        let start_column = &self.anchored_columns[segment_id];
        let middle_column = &self.anchored_columns[segment_id + 1];
        let end_column = &self.anchored_columns[segment_id + 2];

        let segment_sequence = consensus::join_sequences_at_kmer(
            &start_column.base_sequence,
            &middle_column.base_sequence,
        )?;
        let read_states = consensus::read_states_for_columns(start_column, end_column)?;

        for rs in read_states.iter() {
            let obs =
                training::collect_observations(&segment_sequence, &self.reads[rs.read_idx], rs);
            let data = &mut self.reads[rs.read_idx].parameters[rs.strand].training_data;
            data.transitions.extend(obs.transitions);
            data.emissions_for_matches.extend(obs.match_residuals);
            data.n_matches += obs.n_matches;
            data.n_merges += obs.n_merges;
            data.n_skips += obs.n_skips;
        }
        Ok(())
    }

    /// Train on the current consensus: accumulate observations over every
    /// segment, then re-estimate each strand's parameters.
    pub fn train(&mut self) -> Result<()> {
        for segment_id in 0..self.anchored_columns.len().saturating_sub(2) {
            info!("Training segment {}", segment_id);
            self.train_segment(segment_id)?;
        }
        for read in self.reads.iter_mut() {
            for parameters in read.parameters.iter_mut() {
                parameters.train();
            }
        }
        Ok(())
    }

    pub fn anchored_columns(&self) -> &[AnchoredColumn] {
        &self.anchored_columns
    }

    /// Drop all reads, columns and the consensus.
    pub fn clear(&mut self) {
        self.reads.clear();
        self.anchored_columns.clear();
        self.consensus_result.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, EventBuffers};

    const TRUTH: &[u8] = b"ACGTAACCGGTTAACCGGTTACGTACGTAA";

    fn test_config() -> EngineConfig {
        EngineConfig {
            // the synthetic model is too sharp for the production outlier
            // threshold; a single draft error would disqualify every read
            outlier_threshold: f64::INFINITY,
            ..EngineConfig::default()
        }
    }

    // One anchored column per draft offset, strand 0 anchored at the
    // event emitted by the k-mer starting there, strand 1 absent.
    fn build_engine<'a>(
        buffers: &'a EventBuffers,
        draft: &[u8],
        offsets: &[usize],
        segment: usize,
    ) -> Engine<'a> {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.add_read(sim::read_from(buffers)).unwrap();
        for &offset in offsets {
            engine.start_anchored_column();
            engine.add_read_anchor(offset as i64, false).unwrap();
            engine.add_read_anchor(-1, false).unwrap();
            let end = (offset + segment + K).min(draft.len());
            engine.add_base_sequence(&draft[offset..end]).unwrap();
            engine.end_anchored_column().unwrap();
        }
        engine
    }

    #[test]
    fn splice_corrects_a_draft_error() {
        let mut draft = TRUTH.to_vec();
        draft[12] = if draft[12] == b'A' { b'C' } else { b'A' };
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut engine = build_engine(&buffers, &draft, &[0, 10, 20], 10);
        engine.run_splice().unwrap();
        assert_eq!(engine.consensus_result(), &TRUTH[..15]);
        // the middle column was re-anchored onto the decoded midpoint
        assert_eq!(engine.anchored_columns()[1].anchors[0].event_idx, 10);
        assert_eq!(engine.anchored_columns()[1].anchors[1].event_idx, -1);
    }

    #[test]
    fn splice_is_deterministic() {
        let mut draft = TRUTH.to_vec();
        draft[12] = b'C';
        draft[7] = b'T';
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut first = build_engine(&buffers, &draft, &[0, 10, 20], 10);
        first.run_splice().unwrap();
        let mut second = build_engine(&buffers, &draft, &[0, 10, 20], 10);
        second.run_splice().unwrap();
        assert_eq!(first.consensus_result(), second.consensus_result());
    }

    #[test]
    fn segment_without_read_states_is_a_noop() {
        let draft = TRUTH.to_vec();
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut engine = Engine::new(test_config()).unwrap();
        engine.add_read(sim::read_from(&buffers)).unwrap();
        for &offset in &[0usize, 10, 20] {
            engine.start_anchored_column();
            engine.add_read_anchor(-1, false).unwrap();
            engine.add_read_anchor(-1, false).unwrap();
            let end = (offset + 10 + K).min(draft.len());
            engine.add_base_sequence(&draft[offset..end]).unwrap();
            engine.end_anchored_column().unwrap();
        }
        engine.run_splice().unwrap();
        let columns = engine.anchored_columns();
        assert_eq!(columns[0].base_sequence, draft[0..15].to_vec());
        assert_eq!(columns[1].base_sequence, draft[10..25].to_vec());
        assert!(columns[1].anchors.iter().all(|a| a.event_idx == -1));
        assert_eq!(engine.consensus_result(), &draft[0..15]);
    }

    #[test]
    fn splice_picks_up_alt_sequences() {
        // The alternate carries the true divergent region; with the
        // mutation rounds disabled, only the splice phase can adopt it.
        let mut draft = TRUTH.to_vec();
        draft[7] = b'A';
        assert_ne!(draft[7], TRUTH[7]);
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let config = EngineConfig {
            mutation_rounds: 0,
            ..test_config()
        };
        let mut engine = Engine::new(config).unwrap();
        engine.add_read(sim::read_from(&buffers)).unwrap();
        for &offset in &[0usize, 10, 20] {
            engine.start_anchored_column();
            engine.add_read_anchor(offset as i64, false).unwrap();
            engine.add_read_anchor(-1, false).unwrap();
            let end = (offset + 10 + K).min(draft.len());
            engine.add_base_sequence(&draft[offset..end]).unwrap();
            if offset == 0 {
                engine.add_alt_sequence(&TRUTH[0..15]).unwrap();
            }
            engine.end_anchored_column().unwrap();
        }
        engine.run_splice().unwrap();
        assert_eq!(engine.consensus_result()[7], TRUTH[7]);
    }

    #[test]
    fn splice_corrects_under_noise() {
        use rand::SeedableRng;
        use rand_xoshiro::Xoshiro256StarStar;
        let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(482490);
        let mut draft = TRUTH.to_vec();
        draft[12] = b'C';
        let buffers = sim::noisy_events(TRUTH, &sim::test_pore_model(), &mut rng, 0.3);
        let mut engine = build_engine(&buffers, &draft, &[0, 10, 20], 10);
        engine.run_splice().unwrap();
        assert_eq!(engine.consensus_result(), &TRUTH[..15]);
    }

    #[test]
    fn ingestion_contract_violations() {
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut engine = Engine::new(test_config()).unwrap();
        let mut bad = sim::read_from(&buffers);
        bad.pore_model[1].states.pop();
        assert!(matches!(
            engine.add_read(bad),
            Err(EngineError::PoreModelSize(1023))
        ));
        assert!(matches!(
            engine.add_read_anchor(0, false),
            Err(EngineError::NoOpenColumn)
        ));

        engine.add_read(sim::read_from(&buffers)).unwrap();
        engine.start_anchored_column();
        engine.add_read_anchor(0, false).unwrap();
        assert!(matches!(
            engine.end_anchored_column(),
            Err(EngineError::AnchorCount {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn training_accumulates_and_refits() {
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut engine = build_engine(&buffers, TRUTH, &[0, 10, 20], 10);
        let before = engine.reads[0].parameters[0].self_transition;
        engine.train().unwrap();
        let params = &engine.reads[0].parameters[0];
        // the exact model decodes to matches only, so the learned
        // self-transition collapses toward zero
        assert!(params.self_transition < before);
        assert!(params.training_data.transitions.is_empty());
    }

    #[test]
    fn clear_resets_the_engine() {
        let buffers = sim::ideal_events(TRUTH, &sim::test_pore_model());
        let mut engine = build_engine(&buffers, TRUTH, &[0, 10, 20], 10);
        engine.run_splice().unwrap();
        assert!(!engine.consensus_result().is_empty());
        engine.clear();
        assert!(engine.consensus_result().is_empty());
        assert!(engine.anchored_columns().is_empty());
    }
}
