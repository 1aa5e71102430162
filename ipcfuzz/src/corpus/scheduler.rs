//! Energy assignment: how many mutate/send iterations a candidate earns.

/// Lower bound of a scaled component
pub const TARGET_MIN: i64 = 1;
/// Upper bound of a scaled component
pub const TARGET_MAX: i64 = 10;

/// The observed inputs of one candidate (a message or a chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyInputs {
    /// Duration of the instrumented invocation, microseconds.
    /// Smaller is better.
    pub exec_time_micros: u64,
    /// Number of coverage blocks the invocation touched
    pub coverage_blocks: usize,
    /// Number of top-level fields in the schema
    pub field_count: usize,
}

/// Scales one component array into `[TARGET_MIN, TARGET_MAX]`,
/// round-half-up.
///
/// With `reverse`, the roles of minimum and maximum swap, so the smallest
/// source value earns the highest score. Either way, a constant array is
/// returned unchanged.
fn scale_component(values: &[i64], reverse: bool) -> Vec<i64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let (mut lo, mut hi) = (first, first);
    for &val in values {
        if val < lo {
            lo = val;
        }
        if val > hi {
            hi = val;
        }
    }
    if lo == hi {
        return values.to_vec();
    }
    // `lo` maps to TARGET_MIN and `hi` to TARGET_MAX; reversed, the
    // smallest value is the one worth the most.
    if reverse {
        std::mem::swap(&mut lo, &mut hi);
    }

    values
        .iter()
        .map(|&val| {
            let ratio = (val - lo) as f64 / (hi - lo) as f64;
            (ratio * (TARGET_MAX - TARGET_MIN) as f64).round() as i64 + TARGET_MIN
        })
        .collect()
}

/// Computes the energy of every candidate from its observed triple.
///
/// Coverage and field count scale forward, execution time scales reversed;
/// the energy is the sum of the three components.
#[must_use]
pub fn assign_energy(inputs: &[EnergyInputs]) -> Vec<i64> {
    let times: Vec<i64> = inputs.iter().map(|i| i.exec_time_micros as i64).collect();
    let coverage: Vec<i64> = inputs.iter().map(|i| i.coverage_blocks as i64).collect();
    let fields: Vec<i64> = inputs.iter().map(|i| i.field_count as i64).collect();

    let times = scale_component(&times, true);
    let coverage = scale_component(&coverage, false);
    let fields = scale_component(&fields, false);

    (0..inputs.len())
        .map(|i| times[i] + coverage[i] + fields[i])
        .collect()
}

/// Candidate indices, highest energy first.
#[must_use]
pub fn rank(energies: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..energies.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(energies[i]));
    order
}
