pub mod aggregate;
pub mod distribution;
pub mod error;
pub mod factor;
pub mod families;
pub mod family;
pub mod param_dict;
pub mod psd;
pub mod tensor_util;

pub use aggregate::FactorAggregate;
pub use distribution::ExpFamDistribution;
pub use error::{ParamError, Result};
pub use factor::ExpFamFactor;
pub use family::{Family, Representation};
pub use param_dict::ParamDict;

pub use candle_core;
