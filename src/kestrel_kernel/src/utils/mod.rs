//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise.
#![allow(clippy::declare_interior_mutable_const)]
use core::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    sync::atomic,
};

pub(crate) mod intrusive_list;
mod prio_bitmap;
pub use self::prio_bitmap::*;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T> Init for atomic::AtomicPtr<T> {
    const INIT: Self = atomic::AtomicPtr::new(core::ptr::null_mut());
}

impl Init for atomic::AtomicBool {
    const INIT: Self = atomic::AtomicBool::new(false);
}

impl Init for atomic::AtomicUsize {
    const INIT: Self = atomic::AtomicUsize::new(0);
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

/// Convert a `Result<T, Fatal>` into `T`, escalating the error to the fatal
/// hook of `Traits`.
pub(crate) trait OrFatal<T> {
    fn or_fatal<Traits: crate::KernelTraits>(self) -> T;
}

impl<T> OrFatal<T> for Result<T, crate::Fatal> {
    #[inline]
    #[track_caller]
    fn or_fatal<Traits: crate::KernelTraits>(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => crate::fatal::<Traits>(e),
        }
    }
}
