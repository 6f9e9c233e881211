pub mod bollinger;

pub use bollinger::{dual_bollinger, BbParams, DualBands};
