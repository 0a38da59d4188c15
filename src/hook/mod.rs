//! # Hook
//!
//! This module covers hooks, which redirect execution from one function to another

use std::mem;

pub mod inline;
pub mod settings;

/// A function pointer that can be hooked, or be the callback of a hook
///
/// Implemented for `fn`, `unsafe fn`, `extern "C" fn` and `unsafe extern "C" fn` with up to eight arguments.
///
/// # Safety
///
/// `Self` must be a plain function pointer, the same size as `*const ()`
pub unsafe trait Function: Copy + 'static {
    /// The return type
    type Output;

    /// Reinterprets an untyped pointer as this function type.
    ///
    /// # Safety
    ///
    /// `ptr` must point to code with exactly this signature and calling convention
    unsafe fn from_ptr(ptr: *const ()) -> Self;

    /// Returns the untyped address of the function
    fn to_ptr(&self) -> *const ();
}

/// Implements [`Function`] for each supported function pointer shape with the given argument types
macro_rules! impl_function {
    ($($arg:ident),*) => {
        impl_function!(@one fn($($arg),*) -> Ret; $($arg),*);
        impl_function!(@one unsafe fn($($arg),*) -> Ret; $($arg),*);
        impl_function!(@one extern "C" fn($($arg),*) -> Ret; $($arg),*);
        impl_function!(@one unsafe extern "C" fn($($arg),*) -> Ret; $($arg),*);
    };
    (@one $ty:ty; $($arg:ident),*) => {
        unsafe impl<Ret: 'static, $($arg: 'static),*> Function for $ty {
            type Output = Ret;

            unsafe fn from_ptr(ptr: *const ()) -> Self {
                mem::transmute_copy(&ptr)
            }

            fn to_ptr(&self) -> *const () {
                *self as *const ()
            }
        }
    };
}

impl_function!();
impl_function!(A);
impl_function!(A, B);
impl_function!(A, B, C);
impl_function!(A, B, C, D);
impl_function!(A, B, C, D, E);
impl_function!(A, B, C, D, E, F);
impl_function!(A, B, C, D, E, F, G);
impl_function!(A, B, C, D, E, F, G, H);
