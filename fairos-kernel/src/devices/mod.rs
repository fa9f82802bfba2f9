//! Device interfaces consumed by the kernel core.

pub mod block;
