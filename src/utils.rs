use crate::{Matrix, Vector};
use anyhow::{anyhow, Error, Result};

/// Compute the arithmetic mean of an array.
pub fn mean(arr: &[f64]) -> Result<f64, Error> {
    if arr.is_empty() {
        return Err(anyhow!("Can't take mean of empty array"));
    }
    let sum = arr.iter().sum::<f64>();
    let count = arr.len() as f64;
    Ok(sum / count)
}

/// Compute the sample variance of an array using Bessel's correction.
pub fn sample_variance(arr: &[f64]) -> Result<f64, Error> {
    if arr.len() < 2 {
        return Err(anyhow!(
            "Need at least 2 values to compute a sample variance, got {}",
            arr.len()
        ));
    }
    let xbar = mean(arr)?;
    Ok(arr.iter().map(|x| (x - xbar).powi(2)).sum::<f64>() / (arr.len() as f64 - 1.0))
}

fn check_weights(num_values: usize, weights: &[f64]) -> Result<f64, Error> {
    if num_values == 0 {
        return Err(anyhow!("Can't take weighted statistics of empty array"));
    }
    if num_values != weights.len() {
        return Err(anyhow!(
            "Length mismatch between values ({}) and weights ({})",
            num_values,
            weights.len()
        ));
    }
    let mut sum = 0.0;
    for &w in weights {
        if !w.is_finite() || w < 0.0 {
            return Err(anyhow!("Weights must be finite and non-negative, got {}", w));
        }
        sum += w;
    }
    if sum <= 0.0 {
        return Err(anyhow!("Weights must have a positive sum"));
    }
    Ok(sum)
}

/// Compute the weighted arithmetic mean of an array.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Result<f64, Error> {
    let wsum = check_weights(values.len(), weights)?;
    let dot = values
        .iter()
        .zip(weights.iter())
        .map(|(x, w)| w * x)
        .sum::<f64>();
    Ok(dot / wsum)
}

/// Compute the weighted sample variance of an array using the
/// reliability-weight analogue of Bessel's correction,
/// `sum(w (x - m)^2) / (W - sum(w^2)/W)` with `W = sum(w)`.
pub fn weighted_variance(values: &[f64], weights: &[f64]) -> Result<f64, Error> {
    let wsum = check_weights(values.len(), weights)?;
    let w2sum = weights.iter().map(|w| w * w).sum::<f64>();
    let denom = wsum - w2sum / wsum;
    if denom <= 0.0 {
        return Err(anyhow!(
            "Need at least 2 effectively independent samples to compute a weighted variance"
        ));
    }
    let m = weighted_mean(values, weights)?;
    let ss = values
        .iter()
        .zip(weights.iter())
        .map(|(x, w)| w * (x - m).powi(2))
        .sum::<f64>();
    Ok(ss / denom)
}

/// Compute the weighted mean vector of a set of sample rows.
pub fn weighted_mean_vector(rows: &[Vec<f64>], weights: &[f64]) -> Result<Vector, Error> {
    let wsum = check_weights(rows.len(), weights)?;
    let dim = rows[0].len();
    let mut acc = Vector::zeros(dim);
    for (row, &w) in rows.iter().zip(weights.iter()) {
        if row.len() != dim {
            return Err(anyhow!(
                "Ragged sample block: expected {} columns, got {}",
                dim,
                row.len()
            ));
        }
        for j in 0..dim {
            acc[j] += w * row[j];
        }
    }
    Ok(acc / wsum)
}

/// Compute the weighted sample covariance matrix of a set of sample rows,
/// with the same reliability-weight correction as [`weighted_variance`].
pub fn weighted_covariance(rows: &[Vec<f64>], weights: &[f64]) -> Result<Matrix, Error> {
    let m = weighted_mean_vector(rows, weights)?;
    let dim = m.len();
    let wsum = weights.iter().sum::<f64>();
    let w2sum = weights.iter().map(|w| w * w).sum::<f64>();
    let denom = wsum - w2sum / wsum;
    if denom <= 0.0 {
        return Err(anyhow!(
            "Need at least 2 effectively independent samples to compute a weighted covariance"
        ));
    }
    let mut cov = Matrix::zeros(dim, dim);
    let mut d = Vector::zeros(dim);
    for (row, &w) in rows.iter().zip(weights.iter()) {
        for j in 0..dim {
            d[j] = row[j] - m[j];
        }
        // accumulate w * d d^T on the lower triangle only
        for j in 0..dim {
            for k in 0..=j {
                cov[(j, k)] += w * d[j] * d[k];
            }
        }
    }
    for j in 0..dim {
        for k in 0..j {
            cov[(j, k)] /= denom;
            cov[(k, j)] = cov[(j, k)];
        }
        cov[(j, j)] /= denom;
    }
    Ok(cov)
}

/// Flip the sign of a direction vector so that its largest-magnitude
/// coefficient is positive.  Eigenvector signs are otherwise arbitrary and
/// this keeps reported mode directions reproducible.
pub fn fix_sign(v: &mut Vector) {
    let mut lead = 0;
    for i in 1..v.len() {
        if v[i].abs() > v[lead].abs() {
            lead = i;
        }
    }
    if !v.is_empty() && v[lead] < 0.0 {
        *v = -v.clone();
    }
}
