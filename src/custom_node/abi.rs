//! Binary interface of custom node libraries.
//!
//! A library exports four C-calling-convention symbols:
//!
//! ```c
//! int execute(const struct CustomNodeTensor* inputs, int inputsCount,
//!             struct CustomNodeTensor** outputs, int* outputsCount,
//!             const struct CustomNodeParam* params, int paramsCount);
//! int getInputsInfo(struct CustomNodeTensorInfo** info, int* infoCount,
//!                   const struct CustomNodeParam* params, int paramsCount);
//! int getOutputsInfo(struct CustomNodeTensorInfo** info, int* infoCount,
//!                    const struct CustomNodeParam* params, int paramsCount);
//! int release(void* ptr);
//! ```
//!
//! Memory handed out by the library is returned through `release`: the engine releases
//! every non-null `data` and `dims` pointer of each returned tensor (or info entry), then
//! the array itself. Tensor names are owned by the library and never released.

use std::ffi::{c_char, c_int, c_void};

/// Tensor exchanged with `execute`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeTensor {
  pub name: *const c_char,
  pub data: *mut u8,
  pub data_bytes: u64,
  pub dims: *mut u64,
  pub dims_count: u64,
  /// [crate::types::Precision] discriminant.
  pub precision: c_int,
}

/// Declared tensor signature returned by the metadata entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeTensorInfo {
  pub name: *const c_char,
  pub dims: *mut u64,
  pub dims_count: u64,
  pub precision: c_int,
}

/// One node parameter (`key=value`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeParam {
  pub key: *const c_char,
  pub value: *const c_char,
}

pub type ExecuteFn = unsafe extern "C" fn(
  inputs: *const CustomNodeTensor,
  inputs_count: c_int,
  outputs: *mut *mut CustomNodeTensor,
  outputs_count: *mut c_int,
  params: *const CustomNodeParam,
  params_count: c_int,
) -> c_int;

pub type MetadataFn = unsafe extern "C" fn(
  info: *mut *mut CustomNodeTensorInfo,
  info_count: *mut c_int,
  params: *const CustomNodeParam,
  params_count: c_int,
) -> c_int;

pub type ReleaseFn = unsafe extern "C" fn(ptr: *mut c_void) -> c_int;

pub const EXECUTE_SYMBOL: &[u8] = b"execute\0";
pub const GET_INPUTS_INFO_SYMBOL: &[u8] = b"getInputsInfo\0";
pub const GET_OUTPUTS_INFO_SYMBOL: &[u8] = b"getOutputsInfo\0";
pub const RELEASE_SYMBOL: &[u8] = b"release\0";
