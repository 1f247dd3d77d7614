//! Convert microscopy images into OME-NGFF pyramids backed by [zarrs], and render previews
//! from them.
//!
//! Images are identified by a digest of their constituent files, so every stage of
//! [`convert::Pipeline`] can be re-run and skips what already exists.
pub mod archive;
pub mod config;
pub mod convert;
mod error;
pub mod fileset;
pub mod identity;
pub mod metadata;
pub mod model;
pub mod proxy;
pub mod pyramid;
pub mod render;
pub mod sample;
pub mod storage;

pub use zarrs;

pub use error::{Error, Result};
