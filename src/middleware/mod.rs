// HTTP middleware layers

pub mod cors;

pub use cors::*;
