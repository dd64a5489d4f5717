/*
 * Created on Sun Mar 17 2024
 *
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Primitive methods for the table's slab allocations. The table only ever
//! needs zero-initialized memory, so that is all this seam provides

use core::alloc::Layout;
use core::ptr::NonNull;
use std::alloc::handle_alloc_error;

/// The allocator behind the table slabs. Abstracted away with a trait for
/// future events when we may want huge pages or a numa aware allocator for
/// the big arrays
pub unsafe trait Allocator {
    /// A pointer to the new zero-filled allocation is returned on success
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, ()>;
}

/// The global allocator
#[derive(Clone, Copy, Default)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        unsafe { NonNull::new(std::alloc::alloc_zeroed(layout)).ok_or(()) }
    }
}

/// Allocate a zero-filled boxed slice of `len` elements of `T` straight off
/// the global allocator. On exhaustion this aborts through the standard
/// allocation error hook: a partially constructed table is never observable
///
/// ## Safety
/// The all-zeroes bit pattern must be a valid `T`
pub unsafe fn zeroed_slab<T>(len: usize) -> Box<[T]> {
    if len == 0 {
        return Vec::new().into_boxed_slice();
    }
    let layout = Layout::array::<T>(len).expect("slab layout overflow");
    let ptr = match Global.allocate_zeroed(layout) {
        Ok(ptr) => ptr.cast::<T>(),
        Err(()) => handle_alloc_error(layout),
    };
    // the box will return the memory to the same (global) allocator
    Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len))
}
