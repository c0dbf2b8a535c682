//! In-process miner host for integration tests.
//!
//! Serves the prover commands with the reference prover instead of a remote
//! machine, optionally misbehaving in a scripted way.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::Mutex,
    time::Duration,
};

use pog::{
    attest::{prover::Commitment, GpuId},
    config::Policy,
    matrix::Strategy,
    merkle::Sha256,
    remote::{self, BenchmarkReport, DeviceIdentity, IndicesFile, Output, RemoteChannel, SeedsFile},
};

pub const H100: &str = "NVIDIA H100 80GB HBM3";

/// Policy small enough to attest on a CPU.
pub fn policy() -> Policy {
    let mut policy = Policy::builtin().unwrap();
    policy.attest.matrix_size = Some(64);
    policy.attest.min_matrix_size = 64;
    policy
}

/// Ways the miner deviates from the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Cheat {
    /// Report a value off by one for the first challenged cell.
    Value(GpuId),
    /// Flip one bit of the first returned row.
    RowBit(GpuId),
    /// Commit to a made-up root.
    Root(GpuId),
    /// Leave the GPU out of the proofs.
    Silent(GpuId),
    /// Print garbage instead of the commit report.
    GarbledCommit,
    /// Write garbage instead of the proofs.
    GarbledProofs,
    /// Fail every transfer.
    Offline,
    /// Report the same device for every GPU.
    CloneIdentity,
}

pub struct LoopbackChannel {
    num_gpus: u32,
    fp16_tflops: f64,
    fp32_tflops: f64,
    vram_bytes: u64,
    cheats: Vec<Cheat>,
    files: Mutex<HashMap<String, String>>,
    events: Mutex<Vec<String>>,
}

fn seconds_for(tflops: f64, n: usize) -> f64 {
    2.0 * (n as f64).powi(3) / (tflops * 1e12)
}

fn arg<'a>(args: &[&'a str], name: &str) -> Result<&'a str, remote::Error> {
    args.iter()
        .position(|a| *a == name)
        .and_then(|pos| args.get(pos + 1).copied())
        .ok_or_else(|| remote::Error::Transport(format!("missing {name}")))
}

impl LoopbackChannel {
    /// A host with `num_gpus` H100s.
    pub fn honest(num_gpus: u32) -> Self {
        Self {
            num_gpus,
            fp16_tflops: 570.0,
            fp32_tflops: 49.0,
            vram_bytes: 80_000_000_000,
            cheats: Vec::new(),
            files: Mutex::default(),
            events: Mutex::default(),
        }
    }

    pub fn cheating(num_gpus: u32, cheats: Vec<Cheat>) -> Self {
        Self {
            cheats,
            ..Self::honest(num_gpus)
        }
    }

    pub fn with_card(mut self, fp16_tflops: f64, fp32_tflops: f64, vram_bytes: u64) -> Self {
        self.fp16_tflops = fp16_tflops;
        self.fp32_tflops = fp32_tflops;
        self.vram_bytes = vram_bytes;
        self
    }

    /// Everything the validator did, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn file(&self, path: &str) -> Result<String, remote::Error> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| remote::Error::Transport(format!("{path}: no such file")))
    }

    fn commitment(&self, seeds: &str) -> Result<Commitment<Sha256>, remote::Error> {
        let seeds: SeedsFile = self.file(seeds)?.parse()?;
        Commitment::compute(&seeds, Strategy::Scalar).map_err(|e| remote::Error::Transport(e.to_string()))
    }

    fn benchmark(&self) -> String {
        let n = 1024;
        BenchmarkReport {
            num_gpus: self.num_gpus,
            vram_bytes: self.vram_bytes,
            size_fp16: n,
            time_fp16: seconds_for(self.fp16_tflops, n),
            size_fp32: n,
            time_fp32: seconds_for(self.fp32_tflops, n),
        }
        .to_string()
    }

    fn compute(&self, args: &[&str]) -> Result<String, remote::Error> {
        if self.cheats.contains(&Cheat::GarbledCommit) {
            return Ok("segmentation fault".into());
        }
        let mut report = self.commitment(arg(args, "--seeds")?)?.report();
        for cheat in &self.cheats {
            if let Cheat::Root(gpu) = cheat {
                report.roots.insert(*gpu, [0xab; 32]);
            }
        }
        Ok(serde_json::to_string(&report).unwrap())
    }

    fn proof(&self, args: &[&str]) -> Result<String, remote::Error> {
        let commitment = self.commitment(arg(args, "--seeds")?)?;
        let indices: IndicesFile = self.file(arg(args, "--indices")?)?.parse()?;
        let mut responses = commitment
            .respond(&indices)
            .map_err(|e| remote::Error::Transport(e.to_string()))?;
        for cheat in &self.cheats {
            match cheat {
                Cheat::Value(gpu) => {
                    if let Some(cell) = responses.get_mut(gpu).and_then(|r| r.cells.first_mut()) {
                        cell.value += 1.0;
                    }
                }
                Cheat::RowBit(gpu) => {
                    if let Some(cell) = responses.get_mut(gpu).and_then(|r| r.cells.first_mut()) {
                        cell.row[0] ^= 1;
                    }
                }
                Cheat::Silent(gpu) => {
                    responses.remove(gpu);
                }
                _ => {}
            }
        }
        let output = arg(args, "--output")?;
        if self.cheats.contains(&Cheat::GarbledProofs) {
            self.files
                .lock()
                .unwrap()
                .insert(output.to_string(), "{\"0\": [".into());
            return Ok(output.to_string());
        }
        self.files
            .lock()
            .unwrap()
            .insert(output.to_string(), serde_json::to_string(&responses).unwrap());
        Ok(output.to_string())
    }

    fn identity(&self) -> String {
        let devices: Vec<DeviceIdentity> = (0..self.num_gpus)
            .map(|gpu| {
                let unique = if self.cheats.contains(&Cheat::CloneIdentity) { 0 } else { gpu };
                DeviceIdentity {
                    gpu_id: gpu,
                    uuid: format!("GPU-0000-{unique:04}"),
                    serial: format!("165{unique:010}"),
                    pci_bus_id: format!("00000000:{:02X}:00.0", unique + 1),
                }
            })
            .collect();
        serde_json::to_string(&devices).unwrap()
    }
}

impl RemoteChannel for LoopbackChannel {
    fn execute(&self, command: &str, _timeout: Duration) -> Result<Output, remote::Error> {
        if self.cheats.contains(&Cheat::Offline) {
            return Err(remote::Error::Transport("connection refused".into()));
        }
        let args: Vec<&str> = command.split_whitespace().collect();
        let mode = args.get(1).copied().unwrap_or_default();
        if args.first() == Some(&"rm") {
            self.log("cleanup".into());
            return Ok(Output::default());
        }
        self.log(format!("execute {mode}"));
        let stdout = match mode {
            "benchmark" => self.benchmark(),
            "compute" => self.compute(&args)?,
            "proof" => self.proof(&args)?,
            "identity" => self.identity(),
            other => return Err(remote::Error::Transport(format!("unknown mode {other}"))),
        };
        Ok(Output {
            stdout,
            stderr: String::new(),
        })
    }

    fn put_file(&self, local: &Path, remote: &str, _timeout: Duration) -> Result<(), remote::Error> {
        if self.cheats.contains(&Cheat::Offline) {
            return Err(remote::Error::Transport("connection refused".into()));
        }
        let content = fs::read_to_string(local)?;
        let name = Path::new(remote).file_name().unwrap().to_string_lossy().to_string();
        self.log(format!("put {name}"));
        self.files.lock().unwrap().insert(remote.to_string(), content);
        Ok(())
    }

    fn get_file(&self, remote: &str, local: &Path, _timeout: Duration) -> Result<(), remote::Error> {
        let content = self.file(remote)?;
        self.log(format!("get {}", Path::new(remote).file_name().unwrap().to_string_lossy()));
        fs::write(local, content)?;
        Ok(())
    }
}
