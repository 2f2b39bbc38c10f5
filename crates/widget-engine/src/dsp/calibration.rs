//! Per-band EQ calibration and the startup measurement that selects it.

use crate::error::GraphError;
use crate::settings::EQ_BANDS;

use super::filters::{BiquadKind, linear_to_db};
use super::graph::{AudioGraph, NodeSpec};

/// Band centre frequencies in Hz, lowest first.
pub const BAND_FREQS: [f32; EQ_BANDS] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BandCalibration {
    pub q: f32,
    /// Multiplier applied to the user's dB gain for this band.
    pub gain_scale: f32,
}

/// Q and gain scaling for every band.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationProfile {
    pub name: String,
    pub bands: [BandCalibration; EQ_BANDS],
}

impl CalibrationProfile {
    /// Values for graphs whose filters follow the cookbook definitions exactly.
    pub fn standard() -> Self {
        let mut bands = [BandCalibration {
            q: 1.41,
            gain_scale: 1.0,
        }; EQ_BANDS];
        bands[0].q = 0.71;
        bands[EQ_BANDS - 1].q = 0.71;
        Self {
            name: "standard".to_string(),
            bands,
        }
    }

    /// Values measured on graphs whose peaking filters come out wider and hotter than
    /// the cookbook curve.
    pub fn alternate() -> Self {
        let q = [0.7, 1.1, 1.2, 1.25, 1.3, 1.3, 1.3, 1.25, 1.2, 0.7];
        let scale = [0.9, 0.8, 0.8, 0.8, 0.8, 0.8, 0.8, 0.8, 0.8, 0.9];
        let mut bands = [BandCalibration {
            q: 1.0,
            gain_scale: 1.0,
        }; EQ_BANDS];
        for (i, band) in bands.iter_mut().enumerate() {
            band.q = q[i];
            band.gain_scale = scale[i];
        }
        Self {
            name: "alternate".to_string(),
            bands,
        }
    }

    /// Filter shape for band `index`: shelves at both ends, peaking in between.
    pub fn kind_of(index: usize) -> BiquadKind {
        if index == 0 {
            BiquadKind::LowShelf
        } else if index == EQ_BANDS - 1 {
            BiquadKind::HighShelf
        } else {
            BiquadKind::Peaking
        }
    }
}

/// Measurement used to choose between two profiles.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub primary: CalibrationProfile,
    pub alternate: CalibrationProfile,
    pub reference_hz: f32,
    pub probe_q: f32,
    pub probe_gain_db: f32,
    /// Allowed deviation from the theoretical peak, in dB.
    pub tolerance_db: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            primary: CalibrationProfile::standard(),
            alternate: CalibrationProfile::alternate(),
            reference_hz: 1000.0,
            probe_q: 1.0,
            probe_gain_db: 6.0,
            tolerance_db: 0.5,
        }
    }
}

impl Calibration {
    /// Measure a throwaway peaking filter and pick the matching profile.
    /// Returns the profile and the measured deviation in dB.
    pub fn run(&self, graph: &mut dyn AudioGraph) -> Result<(CalibrationProfile, f32), GraphError> {
        let probe = graph.create(NodeSpec::Biquad {
            kind: BiquadKind::Peaking,
            freq_hz: self.reference_hz,
            q: self.probe_q,
            gain_db: self.probe_gain_db,
        })?;
        let measured = graph.magnitude_response(probe, self.reference_hz);
        graph.release(probe);
        let deviation = linear_to_db(measured?) - self.probe_gain_db;
        let profile = if deviation.abs() > self.tolerance_db {
            self.alternate.clone()
        } else {
            self.primary.clone()
        };
        tracing::info!(deviation_db = deviation, profile = %profile.name, "eq calibration");
        Ok((profile, deviation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGraph;

    #[test]
    fn exact_graph_keeps_primary_profile() {
        let (mut graph, log) = FakeGraph::new();
        let (profile, deviation) = Calibration::default().run(&mut graph).unwrap();
        assert_eq!(profile.name, "standard");
        assert!(deviation.abs() < 0.05);
        assert_eq!(log.borrow().released.len(), 1);
    }

    #[test]
    fn deviating_graph_selects_alternate() {
        let (mut graph, log) = FakeGraph::new();
        log.borrow_mut().response_skew_db = 1.5;
        let (profile, deviation) = Calibration::default().run(&mut graph).unwrap();
        assert_eq!(profile.name, "alternate");
        assert!((deviation - 1.5).abs() < 0.05);
    }

    #[test]
    fn band_kinds_are_shelves_at_edges() {
        assert_eq!(CalibrationProfile::kind_of(0), BiquadKind::LowShelf);
        assert_eq!(CalibrationProfile::kind_of(4), BiquadKind::Peaking);
        assert_eq!(CalibrationProfile::kind_of(EQ_BANDS - 1), BiquadKind::HighShelf);
    }
}
