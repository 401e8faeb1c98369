//! Window counting logic and the backend seam.

mod backend;
mod counter;
mod memory;
mod window;

pub use backend::{Backend, BatchReplies, Command, Reply};
pub use counter::{LimitCounter, WindowCounter, WindowCounts};
pub use memory::MemoryBackend;
pub use window::{derive_window_key, WindowKeys, WindowLength, DEFAULT_KEY_PREFIX};
