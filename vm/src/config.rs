//! Layout of a user address space and system-wide paging knobs.
//!
//! The constants describe the default layout. A kernel that needs another
//! layout, or another eviction policy, builds its [`Vm`] through a
//! [`VmConfigurationBuilder`].
use crate::{
    Vm,
    frame::{ClockPolicy, EvictionPolicy},
};
use abyss::addressing::{PAGE_SIZE, Va};
use alloc::{boxed::Box, sync::Arc};
use platform::{KernelError, fs::Disk, mm::PhysicalAllocator};

/// The highest address of a user stack (exclusive).
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// The lowest address a user stack may grow down to.
pub const STACK_LIMIT: usize = USER_STACK_TOP - 0x10_0000;

/// How far below the stack pointer an access may fault and still count as a
/// stack access. `push` faults 8 bytes below `rsp` before moving it.
pub const STACK_SLACK: usize = 8;

/// The first kernel address. Every user address lies below.
pub const KERNEL_BASE: usize = 0x80_0400_0000;

const fn canonical(addr: usize) -> Va {
    match Va::new(addr) {
        Some(va) => va,
        None => panic!("non-canonical layout constant"),
    }
}

/// Stack layout shared by every address space of a [`Vm`].
#[derive(Debug, Clone, Copy)]
pub struct VmConfiguration {
    /// The highest address of the user stack (exclusive).
    pub stack_top: Va,
    /// The lowest address the stack may grow down to.
    pub stack_limit: Va,
    /// Distance below the stack pointer that still counts as a stack access.
    pub stack_slack: usize,
}

impl Default for VmConfiguration {
    fn default() -> Self {
        Self {
            stack_top: canonical(USER_STACK_TOP),
            stack_limit: canonical(STACK_LIMIT),
            stack_slack: STACK_SLACK,
        }
    }
}

impl VmConfiguration {
    /// The maximum number of pages a stack can hold.
    pub fn max_stack_pages(&self) -> usize {
        (self.stack_top - self.stack_limit).div_ceil(PAGE_SIZE)
    }
}

/// The [`VmConfigurationBuilder`] struct provides an interface for
/// configuring the paging subsystem before it starts serving faults.
///
/// ## Example:
/// ```
/// let vm = VmConfigurationBuilder::new()
///     .policy(FifoPolicy)
///     .build(PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 16), swap_disk)?;
/// ```
pub struct VmConfigurationBuilder {
    config: VmConfiguration,
    policy: Box<dyn EvictionPolicy>,
}

impl Default for VmConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfigurationBuilder {
    /// Starts from the default layout and the [`ClockPolicy`].
    pub fn new() -> Self {
        Self {
            config: VmConfiguration::default(),
            policy: Box::new(ClockPolicy::new()),
        }
    }

    /// Sets the highest address of the user stack.
    pub fn stack_top(mut self, top: Va) -> Self {
        self.config.stack_top = top;
        self
    }

    /// Sets the lowest address the user stack may grow down to.
    pub fn stack_limit(mut self, limit: Va) -> Self {
        self.config.stack_limit = limit;
        self
    }

    /// Sets the distance below the stack pointer that still counts as a
    /// stack access.
    pub fn stack_slack(mut self, slack: usize) -> Self {
        self.config.stack_slack = slack;
        self
    }

    /// Sets the system-wide eviction policy.
    pub fn policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Creates the [`Vm`] over the frame pool and the swap disk.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if the stack top is not page
    ///   aligned, or the limit is not below the top.
    pub fn build(self, palloc: PhysicalAllocator, swap_disk: Disk) -> Result<Arc<Vm>, KernelError> {
        let Self { config, policy } = self;
        if !config.stack_top.is_page_aligned()
            || config.stack_limit >= config.stack_top
            || config.stack_top.into_usize() > KERNEL_BASE
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Vm::new(palloc, swap_disk, config, policy))
    }
}
