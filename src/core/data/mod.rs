//! Module containing anything and everything related to data and data
//! structures: reading the long-format input, the sparse matrices, the
//! streamed mini-batches and the output files

pub mod dge_io;
pub mod output_io;
pub mod sparse_builder;
pub mod sparse_structures;
pub mod unit_loader;
