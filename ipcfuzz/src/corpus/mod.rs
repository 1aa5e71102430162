//! The corpus: every message under fuzz, the chains built on top of them,
//! and the energy scheduler that ranks both.

pub mod scheduler;

use prost_reflect::MessageDescriptor;

use crate::{
    analysis::TransitionMatrix,
    capture::{Direction, TypedMessage},
    observers::CoverageBlock,
};

/// Matrix edges below this weight do not extend a chain.
pub const CHAIN_EDGE_THRESHOLD: f64 = 0.5;

/// One fuzzable message with its observed behavior.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    /// Request path the entry is sent to
    pub path: String,
    /// Descriptor of the payload's message type
    pub schema: MessageDescriptor,
    /// Current wire bytes; rewritten by the mutator
    pub payload: Vec<u8>,
    /// Remaining mutate/send iterations for this pass
    pub energy: i64,
    /// Ordered coverage fingerprint from the last calibration
    pub coverage: Vec<CoverageBlock>,
    /// Duration of the calibrated invocation, microseconds
    pub exec_time_micros: u64,
}

impl CorpusEntry {
    /// Number of top-level fields in the schema, one of the energy inputs
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.schema.fields().count()
    }
}

/// Append-only list of corpus entries.
///
/// Entries are only ever added (at init, and whenever an execution covers
/// a new path); nothing is deleted mid-run.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
}

impl Corpus {
    /// Seeds a corpus from the request messages of a decoded capture.
    #[must_use]
    pub fn from_capture(messages: &[TypedMessage]) -> Self {
        let entries = messages
            .iter()
            .filter(|msg| msg.direction == Direction::Request)
            .map(|msg| CorpusEntry {
                path: msg.path.clone(),
                schema: msg.schema.clone(),
                payload: msg.payload.clone(),
                energy: 0,
                coverage: Vec::new(),
                exec_time_micros: 0,
            })
            .collect();
        Self { entries }
    }

    /// Appends an entry, returning its index.
    pub fn add(&mut self, entry: CorpusEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&CorpusEntry> {
        self.entries.get(idx)
    }

    #[must_use]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut CorpusEntry> {
        self.entries.get_mut(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CorpusEntry> {
        self.entries.iter()
    }

    /// First entry index with the given path
    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.path == path)
    }
}

/// An ordered run of corpus entries; everything before the tail is
/// replayed unmutated to set up server state, the tail is fuzzed.
#[derive(Debug, Clone)]
pub struct MessageChain {
    /// Corpus entry indices; length ≥ 1, last is the entry under fuzz
    pub primary: Vec<usize>,
    /// Captured responses of the head calls, the seed values for pinning
    /// until live replay responses replace them
    pub dependencies: Vec<TypedMessage>,
    /// Energy of the whole chain; mirrored onto the tail entry
    pub energy: i64,
}

impl MessageChain {
    /// The entry under fuzz
    #[must_use]
    pub fn tail(&self) -> usize {
        *self.primary.last().unwrap()
    }
}

/// Derives message chains from the transition matrix.
///
/// From every starting path, the heaviest qualifying successor
/// (weight ≥ [`CHAIN_EDGE_THRESHOLD`]) is followed greedily until no
/// successor qualifies or a path repeats; every prefix of length ≥ 2
/// becomes a chain.
#[must_use]
pub fn extract_chains(
    matrix: &TransitionMatrix,
    corpus: &Corpus,
    messages: &[TypedMessage],
) -> Vec<MessageChain> {
    let mut chains = Vec::new();

    for start in 0..matrix.len() {
        let mut walk = vec![start];
        let mut current = start;
        loop {
            let row = &matrix.p[current];
            let Some((next, &weight)) = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
            else {
                break;
            };
            if weight < CHAIN_EDGE_THRESHOLD || walk.contains(&next) {
                break;
            }
            walk.push(next);
            current = next;
        }

        // Resolve the walk to corpus entries; paths without an entry end
        // the walk early.
        let mut entry_walk = Vec::new();
        for idx in &walk {
            let Some(entry) = matrix
                .path_at(*idx)
                .and_then(|path| corpus.find_by_path(path))
            else {
                break;
            };
            entry_walk.push(entry);
        }

        for prefix_len in 2..=entry_walk.len() {
            let primary: Vec<usize> = entry_walk[..prefix_len].to_vec();
            let dependencies = head_responses(&primary, corpus, messages);
            chains.push(MessageChain {
                primary,
                dependencies,
                energy: 0,
            });
        }
    }

    chains
}

/// Captured responses for every non-tail call of a chain.
fn head_responses(
    primary: &[usize],
    corpus: &Corpus,
    messages: &[TypedMessage],
) -> Vec<TypedMessage> {
    primary[..primary.len() - 1]
        .iter()
        .filter_map(|&entry_idx| {
            let path = &corpus.get(entry_idx)?.path;
            messages
                .iter()
                .find(|msg| msg.direction == Direction::Response && &msg.path == path)
                .cloned()
        })
        .collect()
}
