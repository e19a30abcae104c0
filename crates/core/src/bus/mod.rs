pub mod signal;

pub use signal::{ErrorKind, IntegrityKind, Signal};
