pub mod calls;

pub use calls::*;
