//! Building blocks shared by the attention mechanisms.
//!
//! The crate hosts dense projections, the depthwise time convolution used as a
//! local residual, and dropout driven by an explicit random source. Everything
//! is assembled from Candle primitives so an outer autodiff engine can
//! differentiate through it.

pub mod checks;
pub mod conv;
pub mod dropout;
pub mod dtypes;
pub mod linear;

pub use conv::{DepthwiseTimeConv, DepthwiseTimeConvConfig};
pub use dropout::{Dropout, ForwardMode};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
