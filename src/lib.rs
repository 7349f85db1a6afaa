#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod config;
pub mod cycle;
pub mod data;
pub mod error;
pub mod losses;
pub mod model;
pub mod sampler;
pub mod sinks;
pub mod training;
