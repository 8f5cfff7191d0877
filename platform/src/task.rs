//! Events raised by a running user task.

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    pub struct PFErrorCode: usize {
        /// The fault was caused by a page-protection violation. When clear,
        /// the page was not present.
        const PRESENT = 1 << 0;
        /// The fault was caused by a write access.
        const WRITE_ACCESS = 1 << 1;
        /// The fault was raised while the CPU was in user mode.
        const USER = 1 << 2;
    }
}
