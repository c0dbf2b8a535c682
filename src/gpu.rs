//! GPU reference table and benchmark fingerprinting.
//!
//! The fingerprint is heuristic: nominal TFLOPS/VRAM figures drift from what a
//! benchmark measures, and some cards are indistinguishable. Those are listed
//! as tolerance pairs and resolved in favour of the miner-reported name.
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpuSpec {
    pub name: String,
    pub fp16_tflops: f64,
    pub fp32_tflops: f64,
    pub vram_gb: f64,
    /// Relative reward weight of the card.
    pub score: f64,
}

impl GpuSpec {
    fn is_usable(&self) -> bool {
        [self.fp16_tflops, self.fp32_tflops, self.vram_gb]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    /// Mean relative deviation of a measurement from this card's nominal values.
    pub fn deviation(&self, measured: &Measurement) -> f64 {
        let rel = |measured: f64, nominal: f64| (measured - nominal).abs() / nominal;
        (rel(measured.fp16_tflops, self.fp16_tflops)
            + rel(measured.fp32_tflops, self.fp32_tflops)
            + rel(measured.vram_gb, self.vram_gb))
            / 3.0
    }
}

/// Benchmark measurement of a single device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub fp16_tflops: f64,
    pub fp32_tflops: f64,
    pub vram_gb: f64,
}

impl Measurement {
    fn is_valid(&self) -> bool {
        [self.fp16_tflops, self.fp32_tflops, self.vram_gb]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GpuTable {
    #[serde(default)]
    pub cards: Vec<GpuSpec>,
    #[serde(default)]
    pub tolerance_pairs: Vec<(String, String)>,
}

impl GpuTable {
    pub fn get(&self, name: &str) -> Option<&GpuSpec> {
        self.cards.iter().find(|c| c.name == name)
    }

    /// Highest relative score among all known cards.
    pub fn max_score(&self) -> Option<f64> {
        self.cards
            .iter()
            .map(|c| c.score)
            .filter(|s| s.is_finite())
            .reduce(f64::max)
    }

    pub fn is_tolerated(&self, a: &str, b: &str) -> bool {
        self.tolerance_pairs
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Name of the card whose nominal figures are closest to the measurement.
    ///
    /// Ties go to the card listed first. When the closest card and the reported
    /// name form a tolerance pair, the reported name wins.
    pub fn identify(&self, measured: &Measurement, reported: Option<&str>) -> Option<String> {
        if !measured.is_valid() {
            return None;
        }
        let mut best: Option<(&GpuSpec, f64)> = None;
        for card in self.cards.iter().filter(|c| c.is_usable()) {
            let deviation = card.deviation(measured);
            if best.map_or(true, |(_, d)| deviation < d) {
                best = Some((card, deviation));
            }
        }
        let (identified, deviation) = best?;
        log::debug!(
            "identified {} (deviation {deviation:.3}) from {measured:?}",
            identified.name
        );

        match reported {
            Some(reported) if self.is_tolerated(&identified.name, reported) => {
                Some(reported.to_string())
            }
            _ => Some(identified.name.clone()),
        }
    }
}
