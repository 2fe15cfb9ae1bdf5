#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod evaluation;
pub mod graph;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod training;
pub mod util;

pub use config::Config;
pub use util::error::{ErrorKind, MilError, MilResult};
