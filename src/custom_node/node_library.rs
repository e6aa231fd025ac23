//! Handle to a custom node library: its four entry points plus the loaded module keeping them valid.
//!
//! Every call crosses an untrusted boundary. Outputs are validated, copied into
//! engine-owned buffers, and the library allocation is released through a drop guard on
//! every exit path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{CStr, CString, c_int, c_void};
use std::fmt;
use std::ptr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, instrument, trace};

use super::abi::{
  CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, ExecuteFn, MetadataFn, ReleaseFn,
};
use crate::status::StatusCode;
use crate::types::{Buffer, Precision, expected_content_len};

/// Tensor signature declared by a library for a given parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
  pub name: String,
  pub precision: Precision,
  /// Empty when the library does not declare a shape.
  pub shape: Vec<u64>,
}

/// Node parameters converted to C strings once, reused on every call.
#[derive(Debug, Clone, Default)]
pub struct NodeParameters {
  pairs: Vec<(CString, CString)>,
}

impl NodeParameters {
  /// Fails when a key or value contains an interior NUL byte.
  pub fn new(parameters: &BTreeMap<String, String>) -> Result<Self, StatusCode> {
    let pairs = parameters
      .iter()
      .map(|(k, v)| Ok((CString::new(k.as_str())?, CString::new(v.as_str())?)))
      .collect::<Result<Vec<_>, std::ffi::NulError>>()
      .map_err(|e| {
        error!(error = %e, "custom node parameter contains NUL byte");
        StatusCode::PipelineDefinitionInvalidNodeLibrary
      })?;
    Ok(Self { pairs })
  }

  /// Borrowed C view; valid while `self` is alive.
  fn raw(&self) -> Vec<CustomNodeParam> {
    self
      .pairs
      .iter()
      .map(|(k, v)| CustomNodeParam {
        key: k.as_ptr(),
        value: v.as_ptr(),
      })
      .collect()
  }
}

/// Entry points of a custom node library.
#[derive(Clone)]
pub struct NodeLibrary {
  execute: ExecuteFn,
  get_inputs_info: MetadataFn,
  get_outputs_info: MetadataFn,
  release: ReleaseFn,
  /// Dynamically loaded module the entry points live in; `None` for in-process kernels.
  module: Option<Arc<libloading::Library>>,
}

impl fmt::Debug for NodeLibrary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeLibrary")
      .field("dynamic", &self.module.is_some())
      .finish()
  }
}

/// Releases a library-owned array and the per-entry allocations listed by `pointers`.
struct ReleaseGuard {
  release: ReleaseFn,
  handle: *mut c_void,
  pointers: Vec<*mut c_void>,
}

impl Drop for ReleaseGuard {
  fn drop(&mut self) {
    for p in self.pointers.drain(..) {
      if !p.is_null() {
        // SAFETY: pointer was handed out by the library and is released exactly once.
        unsafe { (self.release)(p) };
      }
    }
    if !self.handle.is_null() {
      // SAFETY: as above, for the array handle.
      unsafe { (self.release)(self.handle) };
    }
  }
}

/// Reads a library-provided name; `None` when null or not UTF-8.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string.
unsafe fn read_name(name: *const std::ffi::c_char) -> Option<String> {
  if name.is_null() {
    return None;
  }
  unsafe { CStr::from_ptr(name) }
    .to_str()
    .ok()
    .map(str::to_string)
}

impl NodeLibrary {
  /// Library backed by in-process functions (statically linked kernels, test doubles).
  pub fn from_fns(
    execute: ExecuteFn,
    get_inputs_info: MetadataFn,
    get_outputs_info: MetadataFn,
    release: ReleaseFn,
  ) -> Self {
    Self {
      execute,
      get_inputs_info,
      get_outputs_info,
      release,
      module: None,
    }
  }

  pub(crate) fn from_module(
    module: Arc<libloading::Library>,
    execute: ExecuteFn,
    get_inputs_info: MetadataFn,
    get_outputs_info: MetadataFn,
    release: ReleaseFn,
  ) -> Self {
    Self {
      execute,
      get_inputs_info,
      get_outputs_info,
      release,
      module: Some(module),
    }
  }

  /// Inputs declared by the library for `parameters`.
  pub fn inputs_info(&self, parameters: &NodeParameters) -> Result<Vec<TensorInfo>, StatusCode> {
    self.metadata(self.get_inputs_info, parameters)
  }

  /// Outputs declared by the library for `parameters`.
  pub fn outputs_info(&self, parameters: &NodeParameters) -> Result<Vec<TensorInfo>, StatusCode> {
    self.metadata(self.get_outputs_info, parameters)
  }

  fn metadata(
    &self,
    call: MetadataFn,
    parameters: &NodeParameters,
  ) -> Result<Vec<TensorInfo>, StatusCode> {
    let raw_params = parameters.raw();
    let mut info: *mut CustomNodeTensorInfo = ptr::null_mut();
    let mut count: c_int = 0;
    // SAFETY: out-pointers are valid locals; params outlive the call.
    let status = unsafe {
      call(
        &mut info,
        &mut count,
        raw_params.as_ptr(),
        raw_params.len() as c_int,
      )
    };
    let mut guard = ReleaseGuard {
      release: self.release,
      handle: info.cast(),
      pointers: Vec::new(),
    };
    if status != 0 {
      error!(status, "custom node library metadata call failed");
      return Err(StatusCode::NodeLibraryMetadataFailed);
    }
    if info.is_null() {
      if count != 0 {
        error!(count, "custom node library returned null metadata with non-zero count");
        return Err(StatusCode::NodeLibraryMetadataFailed);
      }
      return Ok(Vec::new());
    }
    if count <= 0 {
      error!(count, "custom node library returned metadata with corrupted count");
      return Err(StatusCode::NodeLibraryMetadataFailed);
    }
    // SAFETY: library claims `count` entries behind a non-null pointer.
    let entries = unsafe { std::slice::from_raw_parts(info, count as usize) };
    guard
      .pointers
      .extend(entries.iter().map(|e| e.dims.cast::<c_void>()));
    entries
      .iter()
      .map(|e| {
        // SAFETY: names are NUL-terminated per the ABI.
        let name = unsafe { read_name(e.name) }.ok_or(StatusCode::NodeLibraryMetadataFailed)?;
        let precision =
          Precision::try_from(e.precision).map_err(|_| StatusCode::NodeLibraryMetadataFailed)?;
        let shape = if e.dims.is_null() || e.dims_count == 0 {
          Vec::new()
        } else {
          // SAFETY: non-null dims with `dims_count` entries.
          unsafe { std::slice::from_raw_parts(e.dims, e.dims_count as usize) }.to_vec()
        };
        Ok(TensorInfo {
          name,
          precision,
          shape,
        })
      })
      .collect()
  }

  /// Runs the kernel on `inputs` and returns engine-owned copies of the `consumed` outputs.
  ///
  /// Contract violations map to the specific `NodeLibrary*` status codes. The library
  /// allocation is released before returning, on success and on failure.
  #[instrument(level = "trace", skip(self, inputs, parameters))]
  pub fn execute(
    &self,
    node: &str,
    inputs: &HashMap<String, Buffer>,
    parameters: &NodeParameters,
    consumed: &BTreeSet<String>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    let names = inputs
      .keys()
      .map(|n| CString::new(n.as_str()))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|_| StatusCode::NodeLibraryExecutionFailed)?;
    let mut dims: Vec<Vec<u64>> = inputs.values().map(|b| b.shape().to_vec()).collect();
    let tensors: Vec<CustomNodeTensor> = names
      .iter()
      .zip(inputs.values())
      .zip(dims.iter_mut())
      .map(|((name, buffer), dims)| CustomNodeTensor {
        name: name.as_ptr(),
        data: buffer.data().as_ptr().cast_mut(),
        data_bytes: buffer.data().len() as u64,
        dims: dims.as_mut_ptr(),
        dims_count: dims.len() as u64,
        precision: buffer.precision() as c_int,
      })
      .collect();
    let raw_params = parameters.raw();

    let mut handle: *mut CustomNodeTensor = ptr::null_mut();
    let mut count: c_int = 0;
    // SAFETY: inputs, names, dims and params outlive the call; out-pointers are valid locals.
    let status = unsafe {
      (self.execute)(
        tensors.as_ptr(),
        tensors.len() as c_int,
        &mut handle,
        &mut count,
        raw_params.as_ptr(),
        raw_params.len() as c_int,
      )
    };
    let mut guard = ReleaseGuard {
      release: self.release,
      handle: handle.cast(),
      pointers: Vec::new(),
    };
    let outputs: &[CustomNodeTensor] = if !handle.is_null() && count > 0 {
      // SAFETY: non-null handle with `count` entries claimed by the library.
      unsafe { std::slice::from_raw_parts(handle, count as usize) }
    } else {
      &[]
    };
    for t in outputs {
      guard.pointers.push(t.data.cast());
      guard.pointers.push(t.dims.cast());
    }
    if status != 0 {
      error!(node, status, "custom node library execution failed");
      return Err(StatusCode::NodeLibraryExecutionFailed);
    }
    if handle.is_null() {
      if count > 0 {
        error!(node, count, "custom node library returned null outputs handle");
        return Err(StatusCode::NodeLibraryOutputsCorrupted);
      }
      if count < 0 {
        return Err(StatusCode::NodeLibraryOutputsCorruptedCount);
      }
      if let Some(missing) = consumed.iter().next() {
        error!(node, output = %missing, "custom node library produced no outputs");
        return Err(StatusCode::NodeLibraryMissingOutput);
      }
      return Ok(HashMap::new());
    }
    if count <= 0 {
      error!(node, count, "custom node library returned outputs handle with corrupted count");
      return Err(StatusCode::NodeLibraryOutputsCorruptedCount);
    }

    let mut named = Vec::with_capacity(outputs.len());
    for t in outputs {
      // SAFETY: names are NUL-terminated per the ABI.
      let name = unsafe { read_name(t.name) }.ok_or_else(|| {
        error!(node, "custom node library returned output without a valid name");
        StatusCode::NodeLibraryOutputsCorrupted
      })?;
      named.push((name, t));
    }
    for wanted in consumed {
      if !named.iter().any(|(n, _)| n == wanted) {
        error!(node, output = %wanted, "custom node library is missing output");
        return Err(StatusCode::NodeLibraryMissingOutput);
      }
    }

    let mut result = HashMap::new();
    for (name, t) in named {
      let buffer = copy_output(node, &name, t)?;
      if consumed.contains(&name) {
        result.insert(name, buffer);
      }
    }
    trace!(node, outputs = result.len(), "custom node library outputs validated");
    Ok(result)
  }
}

/// Validates one returned tensor and copies it into an engine-owned buffer.
fn copy_output(node: &str, name: &str, t: &CustomNodeTensor) -> Result<Buffer, StatusCode> {
  let precision = match Precision::try_from(t.precision) {
    Ok(p) if p.is_specified() => p,
    _ => {
      error!(node, output = name, precision = t.precision, "invalid output precision");
      return Err(StatusCode::NodeLibraryInvalidPrecision);
    }
  };
  if t.dims.is_null() || t.dims_count == 0 {
    error!(node, output = name, "output has no dimensions");
    return Err(StatusCode::NodeLibraryInvalidShape);
  }
  // SAFETY: non-null dims with `dims_count` entries.
  let shape = unsafe { std::slice::from_raw_parts(t.dims, t.dims_count as usize) }.to_vec();
  let expected = expected_content_len(precision, &shape);
  if expected != usize::try_from(t.data_bytes).ok() || (t.data_bytes > 0 && t.data.is_null()) {
    error!(
      node,
      output = name,
      data_bytes = t.data_bytes,
      ?shape,
      "output content size does not match shape"
    );
    return Err(StatusCode::NodeLibraryInvalidContentSize);
  }
  let data = if t.data_bytes == 0 {
    Bytes::new()
  } else {
    // SAFETY: non-null data of `data_bytes` bytes, copied before release.
    Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(t.data, t.data_bytes as usize) })
  };
  Buffer::new(precision, shape, data).map_err(|_| StatusCode::NodeLibraryInvalidContentSize)
}
