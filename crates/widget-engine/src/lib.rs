//! Playback engine for the file-browser media widget: codec negotiation, the DSP chain,
//! the dual-handle playback session, queue traversal and the control-surface bridge.
//!
//! [`engine::Engine`] is the single-threaded façade. Host specifics sit behind the traits
//! in [`host`], [`dsp`], [`surface`], [`traversal`], [`codec`] and [`settings`]; the
//! [`backend`] module implements them on top of symphonia, rubato and CPAL.

pub mod backend;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod host;
pub mod queue;
pub mod session;
pub mod settings;
pub mod surface;
pub mod timers;
pub mod track;
pub mod traversal;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineEvent, EngineParts};
