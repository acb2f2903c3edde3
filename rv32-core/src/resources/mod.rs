//! Implementations for the small set of memory-mapped resources the physical address map
//! dispatches to: main memory, the UART, the ACLINT timer aliases, and the debug sink.

pub mod aclint;
pub mod debug_sink;
pub mod ram;
pub mod uart;
