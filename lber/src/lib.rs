pub mod common;
pub mod parse;
pub mod structure;
pub mod structures;
pub mod universal;
pub mod write;

pub use nom::IResult;
