//! Write-then-rename file helpers shared by issuebot's durable stores.

pub mod atomic_io;

pub use atomic_io::{write_text_atomic, write_text_atomic_with_mode};
