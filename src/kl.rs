use crate::chain::Chain;
use crate::utils::fix_sign;
use crate::{Matrix, Vector};
use anyhow::{anyhow, Error, Result};
use nalgebra::SymmetricEigen;

/// Result of a Karhunen-Loeve decomposition of a posterior covariance
/// against a prior covariance.
///
/// The mode matrix `directions` has one column per mode and jointly
/// diagonalizes the pair: `directions^T * prior * directions` is the identity
/// and `directions^T * posterior * directions` is diagonal.  `eigenvalues`
/// holds the per-mode improvement factors, the ratio of prior to posterior
/// variance along each mode, sorted descending so the most-improved mode
/// comes first.  A mode the data does not constrain has improvement factor
/// close to 1.
#[derive(Debug, Clone)]
pub struct KlDecomposition {
    pub eigenvalues: Vec<f64>,
    pub directions: Matrix,
}

impl KlDecomposition {
    pub fn num_modes(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Parameter-space direction of the i-th mode (most-improved first).
    pub fn direction(&self, i: usize) -> Vector {
        self.directions.column(i).into_owned()
    }

    /// Number of modes with improvement factor above `threshold`.
    pub fn improved_modes(&self, threshold: f64) -> usize {
        self.eigenvalues.iter().filter(|&&e| e > threshold).count()
    }
}

fn check_covariance_pair(a: &Matrix, b: &Matrix) -> Result<usize, Error> {
    if !a.is_square() || !b.is_square() {
        return Err(anyhow!("Covariance matrices must be square"));
    }
    if a.nrows() != b.nrows() {
        return Err(anyhow!(
            "Covariance dimension mismatch: {} vs {}",
            a.nrows(),
            b.nrows()
        ));
    }
    if a.nrows() == 0 {
        return Err(anyhow!("Covariance matrices must not be empty"));
    }
    Ok(a.nrows())
}

/// Solves the generalized eigenproblem that simultaneously diagonalizes a
/// posterior and a prior covariance over the same parameters, by Cholesky
/// whitening of the prior.  Both matrices must be positive-definite; a
/// Cholesky or eigenvalue failure is reported as a numerical-instability
/// error, never silently worked around.
///
/// Near-equal eigenvalues receive no special tie-breaking.  Eigenvector
/// signs are arbitrary and are fixed so the largest-magnitude coefficient
/// of each mode is positive.
pub fn kl_decompose(posterior_cov: &Matrix, prior_cov: &Matrix) -> Result<KlDecomposition, Error> {
    let n = check_covariance_pair(posterior_cov, prior_cov)?;
    let chol = prior_cov.clone().cholesky().ok_or_else(|| {
        anyhow!("Prior covariance is not positive definite; decomposition is numerically unstable")
    })?;
    let l = chol.l();

    // whiten the posterior in the prior basis: A = L^-1 C L^-T
    let tmp = l
        .solve_lower_triangular(posterior_cov)
        .ok_or_else(|| anyhow!("Prior Cholesky factor is singular"))?;
    let a = l
        .solve_lower_triangular(&tmp.transpose())
        .ok_or_else(|| anyhow!("Prior Cholesky factor is singular"))?;
    let a = (&a + a.transpose()) * 0.5;

    let eig = SymmetricEigen::new(a);
    for i in 0..n {
        let d = eig.eigenvalues[i];
        if !d.is_finite() || d <= 0.0 {
            return Err(anyhow!(
                "Posterior covariance is not positive definite in the prior-whitened basis \
                 (eigenvalue {})",
                d
            ));
        }
    }

    // map whitened eigenvectors back to parameter space: Phi = L^-T U
    let phi = l
        .transpose()
        .solve_upper_triangular(&eig.eigenvectors)
        .ok_or_else(|| anyhow!("Prior Cholesky factor is singular"))?;

    // improvement factor = prior variance / posterior variance along the mode
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        let a = 1.0 / eig.eigenvalues[i];
        let b = 1.0 / eig.eigenvalues[j];
        b.partial_cmp(&a).unwrap()
    });

    let mut eigenvalues = Vec::with_capacity(n);
    let mut directions = Matrix::zeros(n, n);
    for (k, &i) in order.iter().enumerate() {
        eigenvalues.push(1.0 / eig.eigenvalues[i]);
        let mut col = phi.column(i).into_owned();
        fix_sign(&mut col);
        directions.set_column(k, &col);
    }

    Ok(KlDecomposition {
        eigenvalues,
        directions,
    })
}

/// Effective number of parameters the data constrains over the prior,
/// `N - trace(prior^-1 * posterior)`, clamped to `[0, N]`.
///
/// Reparametrization-invariant by construction: 0 when the posterior equals
/// the prior, approaching N as the posterior variance shrinks to zero
/// relative to the prior.  Both covariances must be non-singular.
pub fn effective_parameters(posterior_cov: &Matrix, prior_cov: &Matrix) -> Result<f64, Error> {
    let n = check_covariance_pair(posterior_cov, prior_cov)?;
    let chol = prior_cov.clone().cholesky().ok_or_else(|| {
        anyhow!("Prior covariance is not positive definite; N_eff is numerically unstable")
    })?;
    if posterior_cov.clone().cholesky().is_none() {
        return Err(anyhow!(
            "Posterior covariance is not positive definite; N_eff is numerically unstable"
        ));
    }
    let ratio = chol.solve(posterior_cov);
    let neff = n as f64 - ratio.trace();
    Ok(neff.max(0.0).min(n as f64))
}

/// Combines a likelihood covariance with a prior covariance through the
/// inverse-sum rule, `combined^-1 = prior^-1 + likelihood^-1`.
pub fn combined_covariance(likelihood_cov: &Matrix, prior_cov: &Matrix) -> Result<Matrix, Error> {
    check_covariance_pair(likelihood_cov, prior_cov)?;
    let prior_inv = prior_cov
        .clone()
        .cholesky()
        .ok_or_else(|| anyhow!("Prior covariance is not positive definite"))?
        .inverse();
    let like_inv = likelihood_cov
        .clone()
        .cholesky()
        .ok_or_else(|| anyhow!("Likelihood covariance is not positive definite"))?
        .inverse();
    let sum = prior_inv + like_inv;
    Ok(sum
        .cholesky()
        .ok_or_else(|| anyhow!("Combined precision matrix is not positive definite"))?
        .inverse())
}

/// Effective number of parameters from a likelihood covariance, forming the
/// posterior covariance through the inverse-sum rule first.
pub fn effective_parameters_from_likelihood(
    likelihood_cov: &Matrix,
    prior_cov: &Matrix,
) -> Result<f64, Error> {
    let combined = combined_covariance(likelihood_cov, prior_cov)?;
    effective_parameters(&combined, prior_cov)
}

/// KL decomposition of a posterior chain against a prior chain, aligned on a
/// named parameter subset.  Fails naming any parameter missing from either
/// chain.
pub fn kl_decompose_chains(
    posterior: &Chain,
    prior: &Chain,
    names: &[&str],
) -> Result<KlDecomposition, Error> {
    let post_cov = posterior.restricted(names)?.weighted_cov()?;
    let prior_cov = prior.restricted(names)?.weighted_cov()?;
    kl_decompose(&post_cov, &prior_cov)
}

/// Effective number of parameters between a posterior and a prior chain,
/// aligned on a named parameter subset.
pub fn effective_parameters_chains(
    posterior: &Chain,
    prior: &Chain,
    names: &[&str],
) -> Result<f64, Error> {
    let post_cov = posterior.restricted(names)?.weighted_cov()?;
    let prior_cov = prior.restricted(names)?.weighted_cov()?;
    effective_parameters(&post_cov, &prior_cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Param;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn diag(values: &[f64]) -> Matrix {
        Matrix::from_diagonal(&Vector::from_row_slice(values))
    }

    fn gaussian_chain(seed: u64, n: usize, sds: &[f64]) -> Chain {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let params = (0..sds.len())
            .map(|j| Param::new(&format!("p{}", j), &format!("p_{}", j)))
            .collect();
        let samples = (0..n)
            .map(|_| {
                sds.iter()
                    .map(|sd| {
                        let z: f64 = StandardNormal.sample(&mut rng);
                        sd * z
                    })
                    .collect()
            })
            .collect();
        Chain::new(params, samples, vec![1.0; n], vec![0.0; n]).unwrap()
    }

    #[test]
    fn test_kl_identity_pair() {
        // posterior equals prior: every mode has improvement factor 1
        let c = diag(&[2.0, 0.5, 1.3]);
        let kl = kl_decompose(&c, &c).unwrap();
        for e in &kl.eigenvalues {
            assert_abs_diff_eq!(*e, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_kl_uniform_shrinkage() {
        // posterior = prior / 4 in every direction: all improvement factors 4
        let prior = Matrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let post = &prior * 0.25;
        let kl = kl_decompose(&post, &prior).unwrap();
        for e in &kl.eigenvalues {
            assert_abs_diff_eq!(*e, 4.0, epsilon = 1e-9);
            assert!(*e >= 1.0);
        }
    }

    #[test]
    fn test_kl_round_trip_law() {
        let prior = Matrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let post = Matrix::from_row_slice(3, 3, &[0.5, 0.1, 0.0, 0.1, 0.8, 0.1, 0.0, 0.1, 1.9]);
        let kl = kl_decompose(&post, &prior).unwrap();

        // the mode matrix maps the prior covariance to the identity
        let ident = kl.directions.transpose() * &prior * &kl.directions;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(ident[(i, j)], expected, epsilon = 1e-9);
            }
        }

        // and the posterior covariance to the diagonal of inverse improvements
        let d = kl.directions.transpose() * &post * &kl.directions;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 / kl.eigenvalues[i] } else { 0.0 };
                assert_abs_diff_eq!(d[(i, j)], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_kl_flat_prior_on_two_of_five() {
        // 5-parameter posterior against a prior that is effectively flat on
        // the first two parameters: exactly 2 strongly improved modes, 3
        // unimproved ones.
        let post = diag(&[0.01, 0.04, 1.0, 2.0, 0.5]);
        let prior = diag(&[1e6, 1e6, 1.0, 2.0, 0.5]);
        let kl = kl_decompose(&post, &prior).unwrap();

        assert_eq!(kl.improved_modes(100.0), 2);
        assert!(kl.eigenvalues[0] >= kl.eigenvalues[1]);
        assert!(kl.eigenvalues[1] > 1e4);
        for e in &kl.eigenvalues[2..] {
            assert_abs_diff_eq!(*e, 1.0, epsilon = 1e-6);
        }
        // most-improved mode points along p0, with positive sign convention
        let top = kl.direction(0);
        assert!(top[0] > 0.0);
        assert!(top[0].abs() > 100.0 * top[2].abs());
    }

    #[test]
    fn test_kl_ordering_is_descending() {
        let post = diag(&[1.0, 0.1, 0.01, 0.5]);
        let prior = diag(&[1.0, 1.0, 1.0, 1.0]);
        let kl = kl_decompose(&post, &prior).unwrap();
        for w in kl.eigenvalues.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert_abs_diff_eq!(kl.eigenvalues[0], 100.0, epsilon = 1e-8);
    }

    #[test]
    fn test_kl_rejects_bad_inputs() {
        let good = diag(&[1.0, 1.0]);
        let singular = diag(&[1.0, 0.0]);
        let not_pd = diag(&[1.0, -1.0]);
        let wrong_dim = diag(&[1.0, 1.0, 1.0]);
        assert!(kl_decompose(&good, &singular).is_err());
        assert!(kl_decompose(&good, &not_pd).is_err());
        assert!(kl_decompose(&singular, &good).is_err());
        assert!(kl_decompose(&good, &wrong_dim).is_err());
    }

    #[test]
    fn test_effective_parameters_limits() {
        let prior = diag(&[4.0, 4.0]);
        // posterior equals prior: nothing is constrained
        assert_abs_diff_eq!(
            effective_parameters(&prior, &prior).unwrap(),
            0.0,
            epsilon = 1e-12
        );
        // posterior collapses: everything is constrained
        let tight = diag(&[4e-9, 4e-9]);
        assert_abs_diff_eq!(
            effective_parameters(&tight, &prior).unwrap(),
            2.0,
            epsilon = 1e-6
        );
        // diagonal case has a closed form: N - sum(post_i / prior_i)
        let post = diag(&[1.0, 2.0]);
        assert_abs_diff_eq!(
            effective_parameters(&post, &prior).unwrap(),
            1.25,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_effective_parameters_in_range_and_invariant() {
        let prior = Matrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let post = Matrix::from_row_slice(3, 3, &[0.5, 0.1, 0.0, 0.1, 0.8, 0.1, 0.0, 0.1, 1.9]);
        let neff = effective_parameters(&post, &prior).unwrap();
        assert!(neff >= 0.0 && neff <= 3.0);

        // invariant under a joint linear reparametrization B C B^T
        let b = Matrix::from_row_slice(3, 3, &[1.0, 0.3, 0.0, 0.0, 2.0, -0.5, 0.1, 0.0, 1.5]);
        let post_r = &b * &post * b.transpose();
        let prior_r = &b * &prior * b.transpose();
        let neff_r = effective_parameters(&post_r, &prior_r).unwrap();
        assert_abs_diff_eq!(neff, neff_r, epsilon = 1e-9);
    }

    #[test]
    fn test_effective_parameters_rejects_singular() {
        let prior = diag(&[1.0, 0.0]);
        let post = diag(&[1.0, 1.0]);
        assert!(effective_parameters(&post, &prior).is_err());
        assert!(effective_parameters(&prior, &post).is_err());
    }

    #[test]
    fn test_combined_covariance_inverse_sum() {
        // equal likelihood and prior: combined covariance is half of either
        let prior = diag(&[4.0, 2.0]);
        let combined = combined_covariance(&prior, &prior).unwrap();
        assert_abs_diff_eq!(combined[(0, 0)], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(combined[(1, 1)], 1.0, epsilon = 1e-10);

        // uninformative likelihood: the prior passes through, N_eff near 0
        let wide = diag(&[4e9, 2e9]);
        let neff = effective_parameters_from_likelihood(&wide, &prior).unwrap();
        assert_abs_diff_eq!(neff, 0.0, epsilon = 1e-6);

        // dominant likelihood: N_eff approaches N
        let tight = diag(&[4e-9, 2e-9]);
        let neff = effective_parameters_from_likelihood(&tight, &prior).unwrap();
        assert_abs_diff_eq!(neff, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_kl_decompose_chains_flat_prior() {
        // sampled version of the flat-prior scenario, with the prior chain
        // wide on the first two of five parameters
        let post = gaussian_chain(7, 20_000, &[0.1, 0.2, 1.0, 1.0, 1.0]);
        let prior = gaussian_chain(11, 20_000, &[100.0, 100.0, 1.0, 1.0, 1.0]);
        let names = ["p0", "p1", "p2", "p3", "p4"];
        let kl = kl_decompose_chains(&post, &prior, &names).unwrap();

        assert_eq!(kl.improved_modes(100.0), 2);
        assert!(kl.eigenvalues[1] > 1e4);
        for e in &kl.eigenvalues[2..] {
            assert!(*e > 0.5 && *e < 2.0, "unimproved mode drifted: {}", e);
        }

        let neff = effective_parameters_chains(&post, &prior, &names).unwrap();
        assert!(neff > 1.5 && neff < 3.5, "N_eff = {}", neff);
    }

    #[test]
    fn test_chain_level_errors_name_missing_parameter() {
        let post = gaussian_chain(1, 100, &[1.0, 1.0]);
        let prior = gaussian_chain(2, 100, &[1.0, 1.0]);
        let err = kl_decompose_chains(&post, &prior, &["p0", "h0"]).unwrap_err();
        assert!(err.to_string().contains("h0"));
    }
}
