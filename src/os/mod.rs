//! Platform memory primitives.
//!
//! The section memory manager is generic over [`Mmap`], so a host embedding
//! the engine can route page allocation through its own allocator.

mod traits;

pub use traits::{MapFlags, Mmap, ProtFlags};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::DefaultMmap;
        pub(crate) use unix::{host_symbol, page_size};
    } else {
        mod unsupported;
        pub use unsupported::DefaultMmap;
        pub(crate) use unsupported::{host_symbol, page_size};
    }
}
