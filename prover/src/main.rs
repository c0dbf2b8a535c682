//! Prover side of the GPU attestation, run on the miner host.
//!
//! Every mode prints its result on stdout so the validator can read it back
//! over the command channel. The products are recomputed from the seeds for
//! the proof step, nothing is kept between invocations.
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use clap::{Parser, Subcommand};
use eyre::{ensure, WrapErr};
use pog::{
    attest::prover::{benchmark, Commitment},
    matrix::Strategy,
    merkle::Sha256,
    remote::{artifacts::parse_nvidia_smi, DeviceIdentity, IndicesFile, SeedsFile},
};

#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Number of threads to use.
    /// '0' means use all available threads
    #[arg(short, long, default_value_t = 0, env = "POG_PROVER_THREADS")]
    threads: usize,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Time one multiplication and print
    /// `num_gpus vram_bytes size_fp16 time_fp16 size_fp32 time_fp32`.
    Benchmark {
        #[arg(long, default_value_t = 1024)]
        size: usize,
        #[arg(long, default_value_t = 1, env = "POG_PROVER_GPUS")]
        num_gpus: u32,
        /// Memory of a single device in bytes.
        #[arg(long, default_value_t = 0, env = "POG_PROVER_VRAM_BYTES")]
        vram_bytes: u64,
    },
    /// Commit to the products of the seeded matrices.
    Compute {
        #[arg(long)]
        seeds: PathBuf,
    },
    /// Answer the challenged cells and write the proofs to `output`.
    Proof {
        #[arg(long)]
        seeds: PathBuf,
        #[arg(long)]
        indices: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the identity of every device.
    Identity,
}

fn strategy(threads: usize) -> Strategy {
    match threads {
        0 => Strategy::detect(),
        1 => Strategy::Scalar,
        threads => Strategy::Parallel { threads },
    }
}

fn read_seeds(path: &Path) -> eyre::Result<SeedsFile> {
    let content = fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(content.parse()?)
}

fn commit(seeds: &Path, strategy: Strategy) -> eyre::Result<Commitment<Sha256>> {
    let seeds = read_seeds(seeds)?;
    ensure!(seeds.n > 0, "matrix size must be positive");
    log::info!("computing {} products of size {}", seeds.seeds.len(), seeds.n);
    Ok(Commitment::compute(&seeds, strategy)?)
}

fn identities() -> eyre::Result<Vec<DeviceIdentity>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index,uuid,serial,pci.bus_id", "--format=csv,noheader"])
        .output();
    match output {
        Ok(output) if output.status.success() => Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))?),
        Ok(output) => {
            log::warn!("nvidia-smi failed: {}", String::from_utf8_lossy(&output.stderr).trim());
            Ok(Vec::new())
        }
        Err(e) => {
            log::warn!("nvidia-smi not available: {e}");
            Ok(Vec::new())
        }
    }
}

fn run(cli: Cli) -> eyre::Result<String> {
    let strategy = strategy(cli.threads);
    log::debug!("using {strategy:?}");
    match cli.mode {
        Mode::Benchmark {
            size,
            num_gpus,
            vram_bytes,
        } => {
            ensure!(size > 0, "benchmark size must be positive");
            Ok(benchmark(size, num_gpus, vram_bytes, strategy).to_string())
        }
        Mode::Compute { seeds } => {
            let commitment = commit(&seeds, strategy)?;
            Ok(serde_json::to_string(&commitment.report())?)
        }
        Mode::Proof {
            seeds,
            indices,
            output,
        } => {
            let commitment = commit(&seeds, strategy)?;
            let indices: IndicesFile = fs::read_to_string(&indices)
                .wrap_err_with(|| format!("reading {}", indices.display()))?
                .parse()?;
            let responses = commitment.respond(&indices)?;
            fs::write(&output, serde_json::to_vec(&responses)?)
                .wrap_err_with(|| format!("writing {}", output.display()))?;
            Ok(output.display().to_string())
        }
        Mode::Identity => Ok(serde_json::to_string(&identities()?)?),
    }
}

fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let out = run(Cli::parse())?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pog::remote::CommitReport;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("pog-prover").chain(args.iter().copied()))
    }

    #[test]
    fn compute_then_prove() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = dir.path().join("seeds.txt");
        let indices = dir.path().join("indices.txt");
        let proofs = dir.path().join("proofs.json");
        fs::write(&seeds, "16\n0 42 7\n1 3 4\n").unwrap();
        fs::write(&indices, "0 1,2;15,15\n1 0,0\n").unwrap();

        let out = run(cli(&["-t", "1", "compute", "--seeds", seeds.to_str().unwrap()])).unwrap();
        let report: CommitReport = serde_json::from_str(&out).unwrap();
        assert_eq!(vec![0, 1], report.roots.keys().copied().collect::<Vec<_>>());

        run(cli(&[
            "proof",
            "--seeds",
            seeds.to_str().unwrap(),
            "--indices",
            indices.to_str().unwrap(),
            "--output",
            proofs.to_str().unwrap(),
        ]))
        .unwrap();
        let responses: pog::remote::ProofResponses =
            serde_json::from_slice(&fs::read(&proofs).unwrap()).unwrap();
        assert_eq!(2, responses[&0].cells.len());
        assert_eq!(1, responses[&1].cells.len());
    }

    #[test]
    fn benchmark_output_parses() {
        let out = run(cli(&["benchmark", "--size", "16", "--num-gpus", "2", "--vram-bytes", "1000"])).unwrap();
        let report: pog::remote::BenchmarkReport = out.parse().unwrap();
        assert_eq!(2, report.num_gpus);
        assert_eq!(1000, report.vram_bytes);
    }

    #[test]
    fn missing_seeds_file() {
        assert!(run(cli(&["compute", "--seeds", "/nonexistent/seeds.txt"])).is_err());
    }

    #[test]
    fn thread_selection() {
        assert_eq!(Strategy::Scalar, strategy(1));
        assert_eq!(Strategy::Parallel { threads: 4 }, strategy(4));
    }
}
