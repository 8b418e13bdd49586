//! Scores that make per-bucket coverage comparable across binaries whose raw
//! tuple counts differ by orders of magnitude.

/// Mean and population standard deviation of a coverage vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
}

impl Statistics {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
            };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std_dev: variance.sqrt(),
        }
    }

    pub fn z_score(&self, x: f64) -> Option<f64> {
        (self.std_dev > 0.0).then(|| (x - self.mean) / self.std_dev)
    }
}

/// Converts result integers to ranking inputs; the `-1` sentinel counts as 0.
pub fn ranking_values(values: &[i64]) -> Vec<f64> {
    values.iter().map(|v| (*v).max(0) as f64).collect()
}

/// Indices whose z-score is strictly above `threshold`. Empty when all
/// values are equal.
pub fn outliers(values: &[f64], threshold: f64) -> Vec<usize> {
    let stats = Statistics::of(values);
    values
        .iter()
        .enumerate()
        .filter(|(_, x)| stats.z_score(**x).is_some_and(|z| z > threshold))
        .map(|(i, _)| i)
        .collect()
}

/// Indices strictly above the mean. Empty when all values are equal.
pub fn above_mean(values: &[f64]) -> Vec<usize> {
    let stats = Statistics::of(values);
    values
        .iter()
        .enumerate()
        .filter(|(_, x)| **x > stats.mean)
        .map(|(i, _)| i)
        .collect()
}

/// `x - mean` for values at or above the mean, 0 otherwise.
pub fn deviation_scores(values: &[f64]) -> Vec<f64> {
    let stats = Statistics::of(values);
    values
        .iter()
        .map(|x| if *x >= stats.mean { x - stats.mean } else { 0.0 })
        .collect()
}

/// `(x - mean) / std_dev` for values at or above the mean, 0 otherwise or
/// when the standard deviation is 0.
pub fn chebyshev_scores(values: &[f64]) -> Vec<f64> {
    let stats = Statistics::of(values);
    values
        .iter()
        .map(|x| match stats.z_score(*x) {
            Some(z) if *x >= stats.mean => z,
            _ => 0.0,
        })
        .collect()
}

/// Index of the first maximum.
pub fn first_max_index(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, x) in values.iter().enumerate() {
        if best.is_none_or(|b| *x > values[b]) {
            best = Some(i);
        }
    }
    best
}

/// Label and score of the first maximum.
pub fn best_pair(labels: &[String], scores: &[f64]) -> Option<(String, f64)> {
    let i = first_max_index(scores)?;
    Some((labels.get(i)?.clone(), scores[i]))
}

/// Buckets chosen for an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub indices: Vec<usize>,
    /// Nothing was significant; fell back to the raw maximum.
    pub took_max_file: bool,
}

/// Picks every bucket whose z-score clears `threshold`, or else the first
/// bucket with the maximum value. A bucket without coverage is never
/// picked, so all-zero values give an empty fallback selection.
pub fn select(values: &[f64], threshold: f64) -> Selection {
    let significant = outliers(values, threshold);
    if !significant.is_empty() {
        return Selection {
            indices: significant,
            took_max_file: false,
        };
    }
    Selection {
        indices: first_max_index(values)
            .filter(|i| values[*i] > 0.0)
            .into_iter()
            .collect(),
        took_max_file: true,
    }
}
