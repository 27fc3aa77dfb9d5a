//! Generation admission control.

mod gate;

pub use gate::{GateConfig, GateReceipt, GateStats, GenerationGate};
