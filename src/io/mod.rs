pub mod multiplexer;

pub use multiplexer::{Multiplexer, Op, Ready, Registrar};
