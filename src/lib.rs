#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod runtime;

mod common;
pub use common::{CheckIntervalDivisor, CheckIntervalMs, ConcurrencyLimit, CounterKey, Window};

mod error;
pub use error::*;

pub mod store;
pub use store::*;

mod call_tracker;

mod admission;
pub use admission::AdmissionPermit;

mod throttle;
pub use throttle::*;

#[cfg(test)]
mod tests;
