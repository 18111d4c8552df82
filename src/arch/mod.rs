pub mod mem;
pub mod unwind;
