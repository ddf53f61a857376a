use crate::utils::{weighted_covariance, weighted_mean, weighted_mean_vector, weighted_variance};
use crate::{Matrix, Vector};
use anyhow::{anyhow, Error, Result};

/// A named scalar parameter with a display label (e.g. a LaTeX string).
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub label: String,
}

impl Param {
    pub fn new(name: &str, label: &str) -> Param {
        Param {
            name: name.to_string(),
            label: label.to_string(),
        }
    }
}

/// A derived parameter: a pure function of an existing sample row, computed
/// once and appended column-wise to a chain, never mutated afterward.
///
/// The transform receives the row of parameter values in chain order, e.g.
/// a log transform of the third parameter:
///
/// ```
/// use chaindiag::chain::DerivedParam;
/// let spec = DerivedParam::new("log_p3", "\\log p_3", |row| row[2].ln());
/// ```
pub struct DerivedParam {
    pub name: String,
    pub label: String,
    transform: Box<dyn Fn(&[f64]) -> f64>,
}

impl DerivedParam {
    pub fn new<F>(name: &str, label: &str, transform: F) -> DerivedParam
    where
        F: Fn(&[f64]) -> f64 + 'static,
    {
        DerivedParam {
            name: name.to_string(),
            label: label.to_string(),
            transform: Box::new(transform),
        }
    }

    pub fn apply(&self, row: &[f64]) -> f64 {
        (self.transform)(row)
    }
}

/// A weighted sample set: an ordered sequence of parameter vectors, each with
/// a non-negative importance weight and a minus-log-likelihood value,
/// representing a Monte Carlo approximation of a probability distribution.
///
/// Samples are read-only after construction except for append-only derived
/// parameter columns added through [`Chain::append_derived`].
#[derive(Debug, Clone)]
pub struct Chain {
    params: Vec<Param>,
    samples: Vec<Vec<f64>>,
    weights: Vec<f64>,
    neg_log_likes: Vec<f64>,
}

impl Chain {
    /// Build a chain from raw sample rows, validating that the block is
    /// rectangular, the weights are finite and non-negative with positive
    /// sum, and the parameter names are unique.
    pub fn new(
        params: Vec<Param>,
        samples: Vec<Vec<f64>>,
        weights: Vec<f64>,
        neg_log_likes: Vec<f64>,
    ) -> Result<Chain, Error> {
        if params.is_empty() {
            return Err(anyhow!("Chain must have at least one parameter"));
        }
        if samples.is_empty() {
            return Err(anyhow!("Chain must have at least one sample"));
        }
        if samples.len() != weights.len() || samples.len() != neg_log_likes.len() {
            return Err(anyhow!(
                "Sample count mismatch: {} rows, {} weights, {} log-likelihoods",
                samples.len(),
                weights.len(),
                neg_log_likes.len()
            ));
        }
        for (i, row) in samples.iter().enumerate() {
            if row.len() != params.len() {
                return Err(anyhow!(
                    "Row {} has {} values but the chain has {} parameters",
                    i,
                    row.len(),
                    params.len()
                ));
            }
        }
        let mut wsum = 0.0;
        for &w in &weights {
            if !w.is_finite() || w < 0.0 {
                return Err(anyhow!("Weights must be finite and non-negative, got {}", w));
            }
            wsum += w;
        }
        if wsum <= 0.0 {
            return Err(anyhow!("Chain weights must have a positive sum"));
        }
        for (i, p) in params.iter().enumerate() {
            if params[..i].iter().any(|q| q.name == p.name) {
                return Err(anyhow!("Duplicate parameter name '{}'", p.name));
            }
        }
        Ok(Chain {
            params,
            samples,
            weights,
            neg_log_likes,
        })
    }

    /// Number of samples in the chain.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of parameters (columns), including appended derived parameters.
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn neg_log_likes(&self) -> &[f64] {
        &self.neg_log_likes
    }

    pub fn samples(&self) -> &[Vec<f64>] {
        &self.samples
    }

    /// Column index of a named parameter.  Fails naming the missing
    /// parameter so configuration mistakes are easy to spot.
    pub fn index_of(&self, name: &str) -> Result<usize, Error> {
        self.params
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| {
                anyhow!(
                    "Parameter '{}' not found in chain (available: {})",
                    name,
                    self.names().join(", ")
                )
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// Values of one named parameter across all samples.
    pub fn column(&self, name: &str) -> Result<Vec<f64>, Error> {
        let j = self.index_of(name)?;
        Ok(self.samples.iter().map(|row| row[j]).collect())
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Kish effective sample count, `(sum w)^2 / sum(w^2)`.  Equals the
    /// number of samples for unit weights.
    pub fn effective_samples(&self) -> f64 {
        let wsum = self.weight_sum();
        let w2sum = self.weights.iter().map(|w| w * w).sum::<f64>();
        wsum * wsum / w2sum
    }

    /// Weighted mean vector over all parameters.
    pub fn weighted_mean(&self) -> Result<Vector, Error> {
        weighted_mean_vector(&self.samples, &self.weights)
    }

    /// Weighted sample covariance matrix over all parameters.
    pub fn weighted_cov(&self) -> Result<Matrix, Error> {
        weighted_covariance(&self.samples, &self.weights)
    }

    /// Weighted mean of one named parameter.
    pub fn param_mean(&self, name: &str) -> Result<f64, Error> {
        weighted_mean(&self.column(name)?, &self.weights)
    }

    /// Weighted variance of one named parameter.
    pub fn param_variance(&self, name: &str) -> Result<f64, Error> {
        weighted_variance(&self.column(name)?, &self.weights)
    }

    /// A chain made of the first `k` samples, used to build
    /// convergence-vs-sample-count curves.
    pub fn truncated(&self, k: usize) -> Result<Chain, Error> {
        if k < 2 || k > self.len() {
            return Err(anyhow!(
                "Can't truncate a chain of {} samples to {} (need 2 <= k <= len)",
                self.len(),
                k
            ));
        }
        Chain::new(
            self.params.clone(),
            self.samples[..k].to_vec(),
            self.weights[..k].to_vec(),
            self.neg_log_likes[..k].to_vec(),
        )
    }

    /// Splits the chain into `m` contiguous subsets of equal length for
    /// convergence testing, dropping the trailing remainder.
    pub fn split(&self, m: usize) -> Result<Vec<Chain>, Error> {
        if m < 2 {
            return Err(anyhow!("Chain must be split into at least 2 subsets"));
        }
        let size = self.len() / m;
        if size < 2 {
            return Err(anyhow!(
                "Not enough samples to split a chain of {} into {} subsets",
                self.len(),
                m
            ));
        }
        let mut out = Vec::with_capacity(m);
        for c in 0..m {
            let lo = c * size;
            let hi = lo + size;
            out.push(Chain::new(
                self.params.clone(),
                self.samples[lo..hi].to_vec(),
                self.weights[lo..hi].to_vec(),
                self.neg_log_likes[lo..hi].to_vec(),
            )?);
        }
        Ok(out)
    }

    /// Projects the chain onto a named parameter subset, in the given order.
    /// Used to align posterior and prior chains on a common basis before
    /// covariance comparisons.
    pub fn restricted(&self, names: &[&str]) -> Result<Chain, Error> {
        if names.is_empty() {
            return Err(anyhow!("Parameter subset must not be empty"));
        }
        let mut cols = Vec::with_capacity(names.len());
        for name in names {
            cols.push(self.index_of(name)?);
        }
        let params = cols.iter().map(|&j| self.params[j].clone()).collect();
        let samples = self
            .samples
            .iter()
            .map(|row| cols.iter().map(|&j| row[j]).collect())
            .collect();
        Chain::new(
            params,
            samples,
            self.weights.clone(),
            self.neg_log_likes.clone(),
        )
    }

    /// Applies a declarative list of derived-parameter specifications,
    /// computing each new column once from the existing columns and
    /// appending it.  Transforms see the chain's columns as they were
    /// before this call.
    pub fn append_derived(&mut self, specs: &[DerivedParam]) -> Result<(), Error> {
        for spec in specs {
            if self.params.iter().any(|p| p.name == spec.name) {
                return Err(anyhow!(
                    "Derived parameter '{}' already exists in chain",
                    spec.name
                ));
            }
        }
        let width = self.params.len();
        for spec in specs {
            for row in self.samples.iter_mut() {
                let value = spec.apply(&row[..width]);
                row.push(value);
            }
            self.params.push(Param::new(&spec.name, &spec.label));
        }
        Ok(())
    }
}
