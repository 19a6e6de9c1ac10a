//! Inference domain: loading artefacts through flavors and serving predictions.

pub mod domain;
pub mod linear;
pub mod service;

pub use domain::{Flavor, LoadedModel, Predictor};
pub use linear::{LinearFlavor, LinearModel};
