//! Synthetic event streams. The event-detection front-end is outside
//! this crate, so tests build their inputs here.

use crate::kmer::kmer_rank;
use crate::params::KhmmParameters;
use crate::read::{EventSequence, KmerState, PoreModel, SquiggleRead};
use crate::K;
use rand::Rng;
use rand_distr::{Distribution, Normal};

// Nominal event duration, the mode of the duration prior.
const EVENT_DURATION: f64 = 0.036;

/// Owned event arrays; borrow them into an [`EventSequence`] with
/// [`EventBuffers::as_events`].
#[derive(Debug, Clone, Default)]
pub struct EventBuffers {
    pub level: Vec<f64>,
    pub stdv: Vec<f64>,
    pub time: Vec<f64>,
}

impl EventBuffers {
    pub fn n_events(&self) -> usize {
        self.level.len()
    }
    pub fn as_events(&self) -> EventSequence<'_> {
        EventSequence {
            level: &self.level,
            stdv: &self.stdv,
            time: &self.time,
        }
    }
    fn push(&mut self, level: f64) {
        if self.time.is_empty() {
            self.time.push(0.0);
        }
        self.level.push(level);
        self.stdv.push(1.0);
        let last = *self.time.last().unwrap();
        self.time.push(last + EVENT_DURATION);
    }
    /// Remove event `idx`, keeping the time axis contiguous.
    pub fn drop_event(&mut self, idx: usize) {
        self.level.remove(idx);
        self.stdv.remove(idx);
        self.time.pop();
    }
}

/// A deterministic pore model for tests: unit scaling, no drift, and
/// k-mer levels spread far enough apart that ranks are separable.
pub fn test_pore_model() -> PoreModel {
    let states = (0..1024)
        .map(|rank| KmerState {
            level_mean: 80.0 + 0.3 * rank as f64,
            level_stdv: 1.0,
            sd_mean: 0.8,
            sd_stdv: 0.1,
        })
        .collect();
    PoreModel {
        scale: 1.0,
        shift: 0.0,
        drift: 0.0,
        var: 1.0,
        states,
    }
}

/// One event per k-mer of `seq`, each at exactly the model mean.
pub fn ideal_events(seq: &[u8], model: &PoreModel) -> EventBuffers {
    events_with_repeats(seq, model, 1)
}

/// `repeat` consecutive events per k-mer, each at exactly the model mean.
pub fn events_with_repeats(seq: &[u8], model: &PoreModel, repeat: usize) -> EventBuffers {
    let mut buffers = EventBuffers::default();
    for ki in 0..=seq.len() - K {
        let rank = kmer_rank(&seq[ki..]);
        for _ in 0..repeat {
            buffers.push(model.scaled_mean(rank));
        }
    }
    buffers
}

/// One event per k-mer with Gaussian noise of the given sigma.
pub fn noisy_events<R: Rng>(seq: &[u8], model: &PoreModel, rng: &mut R, sigma: f64) -> EventBuffers {
    let noise = Normal::new(0.0, sigma).unwrap();
    let mut buffers = EventBuffers::default();
    for ki in 0..=seq.len() - K {
        let rank = kmer_rank(&seq[ki..]);
        buffers.push(model.scaled_mean(rank) + noise.sample(rng));
    }
    buffers
}

/// A read whose two strands share the same buffers, with the test pore
/// model and default parameters. Convenience for unit tests.
pub fn read_from(buffers: &EventBuffers) -> SquiggleRead<'_> {
    let model = test_pore_model();
    SquiggleRead {
        pore_model: [model.clone(), model],
        events: [buffers.as_events(), buffers.as_events()],
        parameters: [KhmmParameters::default(), KhmmParameters::default()],
    }
}
