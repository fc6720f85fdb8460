//! Mathematical primitives for SCPN Flow Core.

pub mod comm;
pub mod fft;
pub mod gmres;
pub mod linalg;
pub mod sparse;
