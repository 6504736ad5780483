#![doc = include_str!("../../README.MD")]

pub mod analyzer;
pub mod codegen;
pub mod runtime;
pub mod schema;

pub use codegen::Generator;
pub use schema::{Schema, SchemaError};
