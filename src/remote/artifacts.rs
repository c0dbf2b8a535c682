//! Files and outputs exchanged with the prover.
use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use super::Error;
use crate::{
    attest::{Cell, GpuId, SeedPair},
    gpu::Measurement,
    merkle::Digest,
};

fn malformed(msg: impl Into<String>) -> Error {
    Error::Malformed(msg.into())
}

fn parse_field<T: FromStr>(value: &str, what: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid {what}: {value:?}")))
}

/// Matrix size followed by one `gpu_id s_A s_B` line per GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedsFile {
    pub n: usize,
    pub seeds: BTreeMap<GpuId, SeedPair>,
}

impl fmt::Display for SeedsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.n)?;
        for (gpu, seeds) in &self.seeds {
            writeln!(f, "{gpu} {} {}", seeds.a, seeds.b)?;
        }
        Ok(())
    }
}

impl FromStr for SeedsFile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s.lines().filter(|l| !l.trim().is_empty());
        let n = parse_field(lines.next().ok_or_else(|| malformed("empty seeds file"))?, "matrix size")?;
        let mut seeds = BTreeMap::new();
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [gpu, a, b] = fields[..] else {
                return Err(malformed(format!("invalid seeds line: {line:?}")));
            };
            let pair = SeedPair {
                a: parse_field(a, "seed")?,
                b: parse_field(b, "seed")?,
            };
            if seeds.insert(parse_field(gpu, "gpu id")?, pair).is_some() {
                return Err(malformed(format!("duplicate gpu in seeds file: {gpu}")));
            }
        }
        Ok(Self { n, seeds })
    }
}

/// One `gpu_id i1,j1;i2,j2;...` line per GPU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndicesFile {
    pub cells: BTreeMap<GpuId, Vec<Cell>>,
}

impl fmt::Display for IndicesFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (gpu, cells) in &self.cells {
            let cells: Vec<String> = cells.iter().map(|c| format!("{},{}", c.i, c.j)).collect();
            writeln!(f, "{gpu} {}", cells.join(";"))?;
        }
        Ok(())
    }
}

impl FromStr for IndicesFile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cells = BTreeMap::new();
        for line in s.lines().filter(|l| !l.trim().is_empty()) {
            let (gpu, list) = line
                .trim()
                .split_once(' ')
                .ok_or_else(|| malformed(format!("invalid indices line: {line:?}")))?;
            let parsed = list
                .split(';')
                .map(|pair| {
                    let (i, j) = pair
                        .split_once(',')
                        .ok_or_else(|| malformed(format!("invalid cell: {pair:?}")))?;
                    Ok(Cell {
                        i: parse_field(i, "row index")?,
                        j: parse_field(j, "column index")?,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            cells.insert(parse_field(gpu, "gpu id")?, parsed);
        }
        Ok(Self { cells })
    }
}

/// Benchmark output: `num_gpus vram_bytes size_fp16 time_fp16 size_fp32 time_fp32`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkReport {
    pub num_gpus: u32,
    /// Memory of a single device.
    pub vram_bytes: u64,
    pub size_fp16: usize,
    pub time_fp16: f64,
    pub size_fp32: usize,
    pub time_fp32: f64,
}

/// Throughput of an `n x n` multiplication that took `secs`.
fn tflops(n: usize, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    2.0 * (n as f64).powi(3) / secs / 1e12
}

impl BenchmarkReport {
    pub fn vram_gb(&self) -> f64 {
        self.vram_bytes as f64 / 1e9
    }

    pub fn measurement(&self) -> Measurement {
        Measurement {
            fp16_tflops: tflops(self.size_fp16, self.time_fp16),
            fp32_tflops: tflops(self.size_fp32, self.time_fp32),
            vram_gb: self.vram_gb(),
        }
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.num_gpus, self.vram_bytes, self.size_fp16, self.time_fp16, self.size_fp32, self.time_fp32
        )
    }
}

impl FromStr for BenchmarkReport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the report is the last non-empty line, earlier ones may be driver noise
        let line = s
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| malformed("empty benchmark output"))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [num_gpus, vram, size_fp16, time_fp16, size_fp32, time_fp32] = fields[..] else {
            return Err(malformed(format!("invalid benchmark output: {line:?}")));
        };
        let report = Self {
            num_gpus: parse_field(num_gpus, "gpu count")?,
            vram_bytes: parse_field(vram, "vram")?,
            size_fp16: parse_field(size_fp16, "fp16 size")?,
            time_fp16: parse_field(time_fp16, "fp16 time")?,
            size_fp32: parse_field(size_fp32, "fp32 size")?,
            time_fp32: parse_field(time_fp32, "fp32 time")?,
        };
        if !(report.time_fp16.is_finite() && report.time_fp16 > 0.0)
            || !(report.time_fp32.is_finite() && report.time_fp32 > 0.0)
        {
            return Err(malformed(format!("non-positive benchmark time: {line:?}")));
        }
        Ok(report)
    }
}

/// Output of the compute step: one root per GPU.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommitReport {
    #[serde_as(as = "BTreeMap<_, Hex>")]
    pub roots: BTreeMap<GpuId, Digest>,
    /// Seconds each GPU spent on the product.
    #[serde(default)]
    pub timings: BTreeMap<GpuId, f64>,
}

/// Answer for one challenged cell.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResponse {
    pub i: usize,
    pub j: usize,
    pub value: f32,
    /// Row `i` of the product as little-endian `f32`s.
    #[serde_as(as = "Hex")]
    pub row: Vec<u8>,
    #[serde_as(as = "Vec<Hex>")]
    pub proof: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuResponse {
    pub cells: Vec<CellResponse>,
}

pub type ProofResponses = BTreeMap<GpuId, GpuResponse>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub gpu_id: GpuId,
    pub uuid: String,
    pub serial: String,
    pub pci_bus_id: String,
}

/// Parse `nvidia-smi --query-gpu=index,uuid,serial,pci.bus_id --format=csv,noheader`.
pub fn parse_nvidia_smi(csv: &str) -> Result<Vec<DeviceIdentity>, Error> {
    csv.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [index, uuid, serial, bus_id] = fields[..] else {
                return Err(malformed(format!("invalid nvidia-smi line: {line:?}")));
            };
            Ok(DeviceIdentity {
                gpu_id: parse_field(index, "gpu index")?,
                uuid: uuid.to_string(),
                serial: serial.to_string(),
                pci_bus_id: bus_id.to_string(),
            })
        })
        .collect()
}
