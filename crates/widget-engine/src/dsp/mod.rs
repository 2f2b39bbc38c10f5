//! Signal processing chain: compressor → pregain → ten-band EQ → stereo width.

mod calibration;
mod chain;
mod filters;
mod graph;
mod render;

pub use calibration::{BAND_FREQS, BandCalibration, Calibration, CalibrationProfile};
pub use chain::{BASE_PREGAIN, DspChain, StageDescriptor};
pub use filters::{Biquad, BiquadKind, Coefficients, Compressor, db_to_linear, linear_to_db};
pub use graph::{AudioGraph, NodeId, NodeSpec};
pub use render::{SampleGraph, SharedGraph};
