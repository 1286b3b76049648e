mod retention;

pub use retention::*;
