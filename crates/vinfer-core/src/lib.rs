#![doc = include_str!("../README.md")]

pub mod backend;
pub mod error;
pub mod io;
pub mod types;

pub use error::{EngineError, Result};
