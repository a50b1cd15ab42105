//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in fileheap.
//!
//! ## be_i64_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields stored as
//! big-endian signed 64-bit integers (`zerocopy::big_endian::I64`), the wire
//! format of every multi-byte integer in the heap file.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::big_endian::I64;
//!
//! #[repr(C)]
//! struct PageHeader {
//!     rank: I64,
//!     size: I64,
//! }
//!
//! impl PageHeader {
//!     be_i64_accessors! {
//!         rank,
//!         size,
//!     }
//! }
//!
//! // Generates:
//! // pub fn rank(&self) -> i64 { self.rank.get() }
//! // pub fn set_rank(&mut self, val: i64) { self.rank = I64::new(val); }
//! // pub fn size(&self) -> i64 { self.size.get() }
//! // pub fn set_size(&mut self, val: i64) { self.size = I64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy big-endian i64 fields.
#[macro_export]
macro_rules! be_i64_accessors {
    ($($field:ident),* $(,)?) => {
        $(
            ::paste::paste! {
                #[inline]
                pub fn $field(&self) -> i64 {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: i64) {
                    self.$field = ::zerocopy::big_endian::I64::new(val);
                }
            }
        )*
    };
}
