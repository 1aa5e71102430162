//! Dependency analysis over the decoded capture: which request tends to
//! follow which, and which response values reappear in later requests.

use hashbrown::HashSet;
use indexmap::{IndexMap, IndexSet};
use log::debug;
use prost_reflect::{DynamicMessage, Kind, ReflectMessage, Value};

use crate::capture::{Direction, TypedMessage};

/// Sliding-window width for the temporal matrix.
pub const WINDOW: usize = 10;

/// Row-stochastic matrix of `path j follows path i` probabilities.
#[derive(Debug, Clone, Default)]
pub struct TransitionMatrix {
    /// Distinct request paths, in first-occurrence order
    pub paths: IndexSet<String>,
    /// `p[i][j]`: probability that `paths[j]` follows `paths[i]`.
    /// Rows sum to 1, or to 0 for paths never seen leading anywhere.
    pub p: Vec<Vec<f64>>,
}

impl TransitionMatrix {
    /// Row/column index of a path
    #[must_use]
    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.paths.get_index_of(path)
    }

    /// Path at a row/column index
    #[must_use]
    pub fn path_at(&self, idx: usize) -> Option<&str> {
        self.paths.get_index(idx).map(String::as_str)
    }

    /// Number of distinct request paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// `true` when no request was ever observed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Value-level hand-off between two message types: fields of `msg1` whose
/// captured values reappeared in `msg2`, by fully qualified field name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValueRelation {
    /// Full name of the earlier message type (a response)
    pub msg1: String,
    /// Full name of the later message type (the following request)
    pub msg2: String,
    /// `msg1` field → `msg2` field, fully qualified
    pub field_pairs: IndexMap<String, String>,
}

/// Builds the temporal co-occurrence matrix over request paths.
///
/// Each request is credited with the successor inside a sliding window of
/// [`WINDOW`] preceding requests; counts are row-normalized at the end.
#[must_use]
pub fn transition_matrix(messages: &[TypedMessage]) -> TransitionMatrix {
    let requests: Vec<&TypedMessage> = messages
        .iter()
        .filter(|msg| msg.direction == Direction::Request)
        .collect();

    let mut paths = IndexSet::new();
    for msg in &requests {
        paths.insert(msg.path.clone());
    }
    let n = paths.len();
    let mut p = vec![vec![0f64; n]; n];

    if !requests.is_empty() {
        let idx = |msg: &TypedMessage| paths.get_index_of(&msg.path).unwrap();

        // Fill from the initial window, then slide it over the rest.
        let window = WINDOW.min(requests.len());
        for i in 0..window.saturating_sub(1) {
            p[idx(requests[i])][idx(requests[i + 1])] += 1.0;
        }
        if requests.len() > window {
            let mut head = requests[window - 1];
            for i in 1..=requests.len() - window {
                let next = requests[i + window - 1];
                p[idx(head)][idx(next)] += 1.0;
                head = next;
            }
        }
    }

    for row in &mut p {
        let sum: f64 = row.iter().sum();
        if sum > 0.0 {
            for cell in row.iter_mut() {
                *cell /= sum;
            }
        }
    }

    TransitionMatrix { paths, p }
}

/// Mines value hand-offs between consecutive calls: fields of one call's
/// response that reappear in the next call's request.
#[must_use]
pub fn value_relations(messages: &[TypedMessage]) -> Vec<ValueRelation> {
    let pairs = pair_by_stream(messages);

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut relations = Vec::new();

    for window in pairs.windows(2) {
        let response = &window[0].1;
        let request = &window[1].0;

        let msg1 = response.schema.full_name().to_string();
        let msg2 = request.schema.full_name().to_string();
        if msg1 == msg2 {
            continue;
        }
        if seen.contains(&(msg1.clone(), msg2.clone())) {
            continue;
        }

        let (Ok(decoded1), Ok(decoded2)) = (
            DynamicMessage::decode(response.schema.clone(), response.payload.as_slice()),
            DynamicMessage::decode(request.schema.clone(), request.payload.as_slice()),
        ) else {
            debug!("skipping relation {msg1} -> {msg2}: payload does not decode");
            continue;
        };

        let mut field_pairs = IndexMap::new();
        dissect_common_fields(&decoded1, &decoded2, &mut field_pairs);
        if field_pairs.is_empty() {
            continue;
        }

        seen.insert((msg1.clone(), msg2.clone()));
        relations.push(ValueRelation {
            msg1,
            msg2,
            field_pairs,
        });
    }

    relations
}

/// Orders messages into `(request, response)` pairs by stream id,
/// first-seen order, request before response.
fn pair_by_stream(messages: &[TypedMessage]) -> Vec<(TypedMessage, TypedMessage)> {
    let mut open: IndexMap<u32, TypedMessage> = IndexMap::new();
    let mut pairs = Vec::new();
    for msg in messages {
        match msg.direction {
            Direction::Request => {
                open.entry(msg.stream_id).or_insert_with(|| msg.clone());
            }
            Direction::Response => {
                if let Some(request) = open.shift_remove(&msg.stream_id) {
                    pairs.push((request, msg.clone()));
                }
            }
        }
    }
    pairs
}

/// Two field names relate when equal (case-insensitive) or one contains
/// the other.
fn names_relate(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a == b || a.contains(&b) || b.contains(&a)
}

/// Collects value-equal field pairs between two decoded messages,
/// recursing into singular sub-messages and elements of repeated ones.
fn dissect_common_fields(
    msg1: &DynamicMessage,
    msg2: &DynamicMessage,
    out: &mut IndexMap<String, String>,
) {
    for f1 in msg1.descriptor().fields() {
        for f2 in msg2.descriptor().fields() {
            if f1.kind() != f2.kind() {
                continue;
            }
            if !names_relate(f1.name(), f2.name()) {
                continue;
            }

            let val1 = msg1.get_field(&f1);
            let val2 = msg2.get_field(&f2);

            match f1.kind() {
                Kind::Message(_) => {
                    if f1.is_list() && f2.is_list() {
                        if let (Value::List(list1), Value::List(list2)) =
                            (val1.as_ref(), val2.as_ref())
                        {
                            for (elem1, elem2) in list1.iter().zip(list2.iter()) {
                                if let (Some(sub1), Some(sub2)) =
                                    (elem1.as_message(), elem2.as_message())
                                {
                                    dissect_common_fields(sub1, sub2, out);
                                }
                            }
                        }
                    } else if !f1.is_list() && !f2.is_list() {
                        if let (Some(sub1), Some(sub2)) =
                            (val1.as_ref().as_message(), val2.as_ref().as_message())
                        {
                            dissect_common_fields(sub1, sub2, out);
                        }
                    }
                }
                // Two enum fields of the same declared enum type relate by
                // that identity; the numeric value is not compared.
                Kind::Enum(_) => {
                    out.insert(f1.full_name().to_string(), f2.full_name().to_string());
                }
                _ => {
                    if val1 == val2 {
                        out.insert(f1.full_name().to_string(), f2.full_name().to_string());
                    }
                }
            }
        }
    }
}
