//! Persistence in the Lush binary matrix format.
//!
//! ```rust,ignore
//! use ebgraph::serialization::{load_parameter_file, save_parameter_file};
//!
//! save_parameter_file("linear.mat", &linear.weight)?;
//! load_parameter_file("linear.mat", &mut linear.weight)?;
//! ```

pub mod lush_matrix;

pub use lush_matrix::{
    load_matrix, load_matrix_file, load_parameter, load_parameter_file, read_header, save_matrix,
    save_matrix_file, save_parameter, save_parameter_file, ByteOrder, ElementType, MatrixData,
    MatrixFileError, MatrixHeader, MAX_DIMS,
};
