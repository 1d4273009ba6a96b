//! HIP FFI bindings
//!
//! Only the memory and event entry points the device surface needs.

use std::ffi::c_void;

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventQuery(event: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Returned by `hipEventQuery` while recorded work is still running
pub const HIP_ERROR_NOT_READY: i32 = 600;

/// Out-of-memory code returned by the allocation entry points
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// Host allocation that is mapped into the device address space
pub const HIP_HOST_MALLOC_MAPPED: u32 = 0x2;

/// Event flag to disable timing data collection
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x2;
