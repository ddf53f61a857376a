use crate::chain::Chain;
use crate::utils::{fix_sign, mean, sample_variance, weighted_mean, weighted_variance};
use crate::{Matrix, Vector};
use anyhow::{anyhow, Error, Result};
use log::{debug, warn};
use nalgebra::SymmetricEigen;

/// Relative tolerance of the sphere optimizer used for moment orders above 1.
const SPHERE_TOL: f64 = 1e-10;
/// Iteration cap of the sphere optimizer.
const SPHERE_MAX_ITER: usize = 500;
/// Central-difference step for numerical gradients on the sphere.
const SPHERE_GRAD_STEP: f64 = 1e-5;

/// Result of a generalized Gelman-Rubin test: the worst-case statistic, the
/// parameter-space direction achieving it, and whether the direction search
/// converged.  For the mean test the direction comes from an exact
/// eigen-solution and `converged` is always true; for higher moment orders a
/// `false` flag marks a best-effort value from an optimizer that hit its
/// iteration cap.
#[derive(Debug, Clone)]
pub struct GrResult {
    pub statistic: f64,
    pub direction: Vector,
    pub converged: bool,
}

fn check_pool(chains: &[Chain]) -> Result<(), Error> {
    if chains.len() < 2 {
        return Err(anyhow!(
            "Convergence tests need at least 2 independent subsets, got {}",
            chains.len()
        ));
    }
    let names = chains[0].names();
    for (i, chain) in chains.iter().enumerate().skip(1) {
        for &name in &names {
            if chain.index_of(name).is_err() {
                return Err(anyhow!(
                    "Parameter '{}' is missing from subset {}",
                    name,
                    i
                ));
            }
        }
        if chain.names() != names {
            return Err(anyhow!(
                "Subset {} parameters are ordered differently from subset 0",
                i
            ));
        }
    }
    Ok(())
}

/// Gelman-Rubin test on the mean, generalized to all parameters at once.
///
/// Computes per-subset weighted mean vectors, the cross-subset covariance V
/// of those means and the mean within-subset covariance M, and returns the
/// largest eigenvalue of `V M^-1`: the worst-case parameter direction where
/// inter-chain disagreement is largest relative to the expected sampling
/// noise.  The maximizing direction is returned alongside.
pub fn mean_convergence(chains: &[Chain]) -> Result<GrResult, Error> {
    check_pool(chains)?;
    let m = chains.len();
    let dim = chains[0].num_params();

    let mut means = Vec::with_capacity(m);
    let mut within = Matrix::zeros(dim, dim);
    for chain in chains {
        means.push(chain.weighted_mean()?);
        within += chain.weighted_cov()?;
    }
    within /= m as f64;

    let mut mbar = Vector::zeros(dim);
    for mu in &means {
        mbar += mu;
    }
    mbar /= m as f64;
    let mut between = Matrix::zeros(dim, dim);
    for mu in &means {
        let d = mu - &mbar;
        between += &d * d.transpose();
    }
    between /= (m - 1) as f64;

    // whiten by the within covariance and take the top eigenpair
    let chol = within.cholesky().ok_or_else(|| {
        anyhow!("Within-subset covariance is not positive definite; test is numerically unstable")
    })?;
    let l = chol.l();
    let tmp = l
        .solve_lower_triangular(&between)
        .ok_or_else(|| anyhow!("Within-subset Cholesky factor is singular"))?;
    let b = l
        .solve_lower_triangular(&tmp.transpose())
        .ok_or_else(|| anyhow!("Within-subset Cholesky factor is singular"))?;
    let b = (&b + b.transpose()) * 0.5;

    let eig = SymmetricEigen::new(b);
    let mut top = 0;
    for i in 1..dim {
        if eig.eigenvalues[i] > eig.eigenvalues[top] {
            top = i;
        }
    }
    let u = eig.eigenvectors.column(top).into_owned();
    let mut direction = l
        .transpose()
        .solve_upper_triangular(&u)
        .ok_or_else(|| anyhow!("Within-subset Cholesky factor is singular"))?
        .normalize();
    fix_sign(&mut direction);

    Ok(GrResult {
        statistic: eig.eigenvalues[top].max(0.0),
        direction,
        converged: true,
    })
}

/// 1-D simplification of the mean test for a single named parameter:
/// variance of the per-subset means over the mean of the per-subset
/// variances.
pub fn param_mean_convergence(chains: &[Chain], name: &str) -> Result<f64, Error> {
    check_pool(chains)?;
    let mut means = Vec::with_capacity(chains.len());
    let mut vars = Vec::with_capacity(chains.len());
    for chain in chains {
        means.push(chain.param_mean(name)?);
        vars.push(chain.param_variance(name)?);
    }
    let between = sample_variance(&means)?;
    let within = mean(&vars)?;
    if !within.is_finite() || within <= 0.0 {
        return Err(anyhow!(
            "Within-subset variance of '{}' vanished; test is numerically unstable",
            name
        ));
    }
    Ok(between / within)
}

/// Per-subset samples centered on the subset's own weighted mean.
struct ChainProjection {
    centered: Vec<Vec<f64>>,
    weights: Vec<f64>,
}

impl ChainProjection {
    fn from_chain(chain: &Chain) -> Result<ChainProjection, Error> {
        let mu = chain.weighted_mean()?;
        let centered = chain
            .samples()
            .iter()
            .map(|row| row.iter().zip(mu.iter()).map(|(x, m)| x - m).collect())
            .collect();
        Ok(ChainProjection {
            centered,
            weights: chain.weights().to_vec(),
        })
    }
}

/// Cross-subset variance of the projected n-th central moment over the mean
/// within-subset variance of that moment, for the direction `u`.  Returns
/// NaN when the direction is degenerate (vanishing within-subset variance).
///
/// Both numerator and denominator are homogeneous of degree 2n in `u`, so
/// the ratio only depends on the direction of `u`, not its length.
fn projected_ratio(subsets: &[ChainProjection], u: &Vector, order: i32) -> f64 {
    let mut moments = Vec::with_capacity(subsets.len());
    let mut noise = Vec::with_capacity(subsets.len());
    for subset in subsets {
        let projected: Vec<f64> = subset
            .centered
            .iter()
            .map(|row| {
                let y: f64 = row.iter().zip(u.iter()).map(|(x, uj)| x * uj).sum();
                y.powi(order)
            })
            .collect();
        let t = match weighted_mean(&projected, &subset.weights) {
            Ok(t) => t,
            Err(_) => return f64::NAN,
        };
        let s = match weighted_variance(&projected, &subset.weights) {
            Ok(s) => s,
            Err(_) => return f64::NAN,
        };
        moments.push(t);
        noise.push(s);
    }
    let between = match sample_variance(&moments) {
        Ok(v) => v,
        Err(_) => return f64::NAN,
    };
    let within = match mean(&noise) {
        Ok(v) => v,
        Err(_) => return f64::NAN,
    };
    if !within.is_finite() || within <= 0.0 {
        return f64::NAN;
    }
    between / within
}

/// Projected gradient ascent on the unit sphere from one starting direction.
/// Returns the best value found, the direction achieving it, and whether the
/// run terminated by tolerance rather than the iteration cap.
fn maximize_on_sphere(
    subsets: &[ChainProjection],
    order: i32,
    start: &Vector,
) -> (f64, Vector, bool) {
    let n = start.len();
    let mut u = start.normalize();
    let mut best = projected_ratio(subsets, &u, order);
    if !best.is_finite() {
        return (f64::NAN, u, false);
    }

    for iter in 0..SPHERE_MAX_ITER {
        // central-difference gradient; scale invariance of the ratio means
        // perturbed points need no renormalization
        let mut grad = Vector::zeros(n);
        let mut probe = u.clone();
        for j in 0..n {
            probe[j] = u[j] + SPHERE_GRAD_STEP;
            let fp = projected_ratio(subsets, &probe, order);
            probe[j] = u[j] - SPHERE_GRAD_STEP;
            let fm = projected_ratio(subsets, &probe, order);
            probe[j] = u[j];
            if !fp.is_finite() || !fm.is_finite() {
                return (best, u, false);
            }
            grad[j] = (fp - fm) / (2.0 * SPHERE_GRAD_STEP);
        }
        let radial = grad.dot(&u);
        let tangent = grad - &u * radial;
        let gnorm = tangent.norm();
        if gnorm <= SPHERE_TOL * (1.0 + best.abs()) {
            debug!("sphere ascent converged after {} iterations", iter);
            return (best, u, true);
        }

        // backtracking step along the tangent
        let mut step = 1.0;
        let mut improved = false;
        while step > 1e-12 {
            let cand = (&u + &tangent * (step / gnorm)).normalize();
            let f = projected_ratio(subsets, &cand, order);
            if f.is_finite() && f > best {
                let gain = f - best;
                u = cand;
                best = f;
                improved = true;
                if gain <= SPHERE_TOL * (1.0 + best.abs()) {
                    debug!("sphere ascent converged after {} iterations", iter);
                    return (best, u, true);
                }
                break;
            }
            step *= 0.5;
        }
        if !improved {
            // no uphill step exists at this scale: stationary point
            return (best, u, true);
        }
    }
    (best, u, false)
}

/// Generalized Gelman-Rubin test on the n-th central moment.
///
/// Order 1 reduces to [`mean_convergence`].  For n > 1 no closed-form
/// eigen-solution exists, so the worst-case direction is searched by
/// multi-start projected gradient ascent over the unit sphere (starting from
/// every coordinate axis, the uniform direction, and the mean-test worst
/// direction).  A run that exhausts its iteration cap is surfaced as a
/// best-effort result with `converged: false`, never silently accepted.
pub fn moment_convergence(chains: &[Chain], order: usize) -> Result<GrResult, Error> {
    if order == 0 {
        return Err(anyhow!("Moment order must be at least 1"));
    }
    if order == 1 {
        return mean_convergence(chains);
    }
    check_pool(chains)?;
    for (i, chain) in chains.iter().enumerate() {
        if chain.len() < order + 2 {
            return Err(anyhow!(
                "Subset {} has {} samples; order-{} test needs at least {}",
                i,
                chain.len(),
                order,
                order + 2
            ));
        }
        if chain.effective_samples() < 2.0 {
            return Err(anyhow!(
                "Subset {} has fewer than 2 effective samples",
                i
            ));
        }
    }

    let dim = chains[0].num_params();
    let subsets = chains
        .iter()
        .map(ChainProjection::from_chain)
        .collect::<Result<Vec<_>, _>>()?;

    let mut starts: Vec<Vector> = (0..dim)
        .map(|j| {
            let mut e = Vector::zeros(dim);
            e[j] = 1.0;
            e
        })
        .collect();
    starts.push(Vector::from_element(dim, 1.0));
    if let Ok(mean_result) = mean_convergence(chains) {
        starts.push(mean_result.direction);
    }

    let mut best = f64::NAN;
    let mut best_dir = Vector::zeros(dim);
    let mut best_converged = false;
    for start in &starts {
        let (value, dir, converged) = maximize_on_sphere(&subsets, order as i32, start);
        debug!(
            "order-{} sphere start gave statistic {:.6e} (converged: {})",
            order, value, converged
        );
        if value.is_finite() && (!best.is_finite() || value > best) {
            best = value;
            best_dir = dir;
            best_converged = converged;
        }
    }
    if !best.is_finite() {
        return Err(anyhow!(
            "Order-{} convergence statistic is degenerate in every search direction",
            order
        ));
    }
    if !best_converged {
        warn!(
            "order-{} sphere ascent hit the {} iteration cap; statistic is best-effort",
            order, SPHERE_MAX_ITER
        );
    }
    fix_sign(&mut best_dir);

    Ok(GrResult {
        statistic: best.max(0.0),
        direction: best_dir,
        converged: best_converged,
    })
}

/// Convergence-vs-sample-count curve: the order-n statistic recomputed with
/// every subset truncated to its first k samples, for each requested k.
/// Lengths outside the available range are an error rather than a NaN
/// statistic.
pub fn convergence_curve(
    chains: &[Chain],
    lengths: &[usize],
    order: usize,
) -> Result<Vec<(usize, f64)>, Error> {
    if lengths.is_empty() {
        return Err(anyhow!("Convergence curve needs at least one truncation length"));
    }
    let mut curve = Vec::with_capacity(lengths.len());
    for &k in lengths {
        let truncated = chains
            .iter()
            .map(|c| c.truncated(k))
            .collect::<Result<Vec<_>, _>>()?;
        let result = moment_convergence(&truncated, order)?;
        curve.push((k, result.statistic));
    }
    Ok(curve)
}
