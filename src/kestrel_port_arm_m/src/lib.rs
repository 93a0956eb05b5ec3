#![deny(unsafe_op_in_unsafe_fn)]
#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)]

/// The [`kestrel_kernel::PortThreading`] implementation.
#[doc(hidden)]
pub mod threading {
    pub mod cfg;
    pub mod frame;
    #[cfg(target_os = "none")]
    pub mod imp;
}

/// The tick source based on SysTick.
#[doc(hidden)]
pub mod systick {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

pub use self::{systick::cfg::*, threading::cfg::*};

/// Used by `use_port!`
#[doc(hidden)]
#[cfg(target_os = "none")]
pub extern crate core;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel;
/// Used by `use_port!`
#[doc(hidden)]
#[cfg(target_os = "none")]
pub use cortex_m_rt;
