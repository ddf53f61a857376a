//! A Rust library for analyzing weighted MCMC posterior samples: Karhunen-Loeve
//! decomposition of posterior against prior covariance, effective number of
//! constrained parameters, and generalized Gelman-Rubin convergence diagnostics.
//!
//! This crate is sampler agnostic and intended to work with the weighted outputs
//! of any MCMC code (e.g. CosmoMC, Cobaya, emcee, PolyChord).
#[macro_use]
extern crate approx;

/// Weighted sample chains, named parameters and derived parameters
pub mod chain;
/// Generalized Gelman-Rubin convergence tests over independent chain subsets
pub mod gr;
/// Karhunen-Loeve decomposition and effective parameter counts
pub mod kl;
/// Plain-text chain loading (paramnames + sample files)
pub mod loader;
/// Convenience utilities like weighted summary statistics intended mostly
/// for internal use by the diagnostic modules
pub mod utils;

/// Dynamically sized square matrix of f64 values
pub type Matrix = nalgebra::DMatrix<f64>;
/// Dynamically sized column vector of f64 values
pub type Vector = nalgebra::DVector<f64>;
