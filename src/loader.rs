use crate::chain::{Chain, DerivedParam, Param};
use anyhow::{anyhow, Context, Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Explicit loader configuration, passed in rather than read from any
/// process-wide switch.  `burn_in_fraction` drops a leading fraction of each
/// chain file's rows; `derived` is a declarative list of derived-parameter
/// specifications applied uniformly to every loaded chain.
pub struct LoaderConfig {
    pub burn_in_fraction: f64,
    pub derived: Vec<DerivedParam>,
}

impl Default for LoaderConfig {
    fn default() -> LoaderConfig {
        LoaderConfig {
            burn_in_fraction: 0.0,
            derived: Vec::new(),
        }
    }
}

/// Reads a `.paramnames` file: one parameter per line, the name first and
/// the rest of the line (possibly empty) as its display label.  Blank lines
/// are skipped.  A trailing `*` on the name, used by some samplers to mark
/// derived parameters, is stripped.
pub fn read_paramnames(path: &Path) -> Result<Vec<Param>, Error> {
    let f = File::open(path)
        .with_context(|| format!("Can't open paramnames file {}", path.display()))?;
    let mut params = Vec::new();
    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("Can't read {}", path.display()))?;
        let mut tokens = line.split_whitespace();
        let name = match tokens.next() {
            Some(name) => name.trim_end_matches('*'),
            None => continue,
        };
        let label = tokens.collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(anyhow!(
                "Empty parameter name at {}:{}",
                path.display(),
                lineno + 1
            ));
        }
        params.push(Param::new(name, &label));
    }
    if params.is_empty() {
        return Err(anyhow!("No parameters found in {}", path.display()));
    }
    Ok(params)
}

struct SampleBlock {
    rows: Vec<Vec<f64>>,
    weights: Vec<f64>,
    neg_log_likes: Vec<f64>,
}

/// Reads one whitespace-separated sample file with rows
/// `weight  -lnL  p1 ... pN`.
fn read_samples(path: &Path, num_params: usize) -> Result<SampleBlock, Error> {
    let f =
        File::open(path).with_context(|| format!("Can't open chain file {}", path.display()))?;
    let mut block = SampleBlock {
        rows: Vec::new(),
        weights: Vec::new(),
        neg_log_likes: Vec::new(),
    };
    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("Can't read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut values = Vec::with_capacity(num_params + 2);
        for token in line.split_whitespace() {
            let value: f64 = token.parse().with_context(|| {
                format!(
                    "Can't parse '{}' as a number at {}:{}",
                    token,
                    path.display(),
                    lineno + 1
                )
            })?;
            values.push(value);
        }
        if values.len() != num_params + 2 {
            return Err(anyhow!(
                "Expected {} columns (weight, -lnL, {} parameters) but found {} at {}:{}",
                num_params + 2,
                num_params,
                values.len(),
                path.display(),
                lineno + 1
            ));
        }
        block.weights.push(values[0]);
        block.neg_log_likes.push(values[1]);
        block.rows.push(values[2..].to_vec());
    }
    if block.rows.is_empty() {
        return Err(anyhow!("No samples found in {}", path.display()));
    }
    Ok(block)
}

fn with_suffix(root: &Path, suffix: &str) -> PathBuf {
    let mut s = root.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Chain files belonging to a root: either a single `<root>.txt` or the
/// numbered series `<root>_1.txt`, `<root>_2.txt`, ...
fn chain_files(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let single = with_suffix(root, ".txt");
    if single.is_file() {
        return Ok(vec![single]);
    }
    let mut files = Vec::new();
    for i in 1.. {
        let numbered = with_suffix(root, &format!("_{}.txt", i));
        if !numbered.is_file() {
            break;
        }
        files.push(numbered);
    }
    if files.is_empty() {
        return Err(anyhow!(
            "No chain files found for root {} (tried {} and {})",
            root.display(),
            single.display(),
            with_suffix(root, "_1.txt").display()
        ));
    }
    Ok(files)
}

fn apply_burn_in(block: &mut SampleBlock, fraction: f64, path: &Path) -> Result<(), Error> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(anyhow!(
            "Burn-in fraction must be in [0, 1), got {}",
            fraction
        ));
    }
    let drop = (fraction * block.rows.len() as f64).floor() as usize;
    if drop >= block.rows.len() {
        return Err(anyhow!(
            "Burn-in removed every sample of {}",
            path.display()
        ));
    }
    block.rows.drain(..drop);
    block.weights.drain(..drop);
    block.neg_log_likes.drain(..drop);
    Ok(())
}

/// Loads every chain file for a root as a separate [`Chain`], ready for
/// convergence testing across the independent chains.  The parameter set
/// comes from `<root>.paramnames`; burn-in and derived parameters follow
/// the configuration.
pub fn load_chains(root: &Path, config: &LoaderConfig) -> Result<Vec<Chain>, Error> {
    let params = read_paramnames(&with_suffix(root, ".paramnames"))?;
    let mut chains = Vec::new();
    for path in chain_files(root)? {
        let mut block = read_samples(&path, params.len())?;
        apply_burn_in(&mut block, config.burn_in_fraction, &path)?;
        let mut chain = Chain::new(
            params.clone(),
            block.rows,
            block.weights,
            block.neg_log_likes,
        )
        .with_context(|| format!("Invalid chain in {}", path.display()))?;
        chain.append_derived(&config.derived)?;
        chains.push(chain);
    }
    Ok(chains)
}

/// Loads every chain file for a root, concatenated into a single [`Chain`]
/// for posterior estimation.  Burn-in is applied per file before merging.
pub fn load_chain(root: &Path, config: &LoaderConfig) -> Result<Chain, Error> {
    let params = read_paramnames(&with_suffix(root, ".paramnames"))?;
    let mut rows = Vec::new();
    let mut weights = Vec::new();
    let mut neg_log_likes = Vec::new();
    for path in chain_files(root)? {
        let mut block = read_samples(&path, params.len())?;
        apply_burn_in(&mut block, config.burn_in_fraction, &path)?;
        rows.append(&mut block.rows);
        weights.append(&mut block.weights);
        neg_log_likes.append(&mut block.neg_log_likes);
    }
    let mut chain = Chain::new(params, rows, weights, neg_log_likes)
        .with_context(|| format!("Invalid chain for root {}", root.display()))?;
    chain.append_derived(&config.derived)?;
    Ok(chain)
}
