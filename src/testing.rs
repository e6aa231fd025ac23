//! Test doubles: in-process custom node kernels with allocation accounting and a
//! dummy model backend.
//!
//! Each kernel library module owns its own allocation counters, so a test that checks
//! for leaks instantiates a module nobody else uses.

use std::collections::HashMap;
use std::ffi::{CStr, c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::custom_node::{
  CustomNodeLibraryManager, CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo,
};
use crate::model::{ModelBackend, ModelSignature};
use crate::pipeline_definition::{Dependencies, PipelineDefinition};
use crate::status::StatusCode;
use crate::types::{
  Buffer, Connections, DemultiplyCount, ENTRY_NODE_NAME, EXIT_NODE_NAME, NodeInfo, Precision,
  PredictRequest, PredictResponse, connect,
};

pub(crate) type Alloc = fn(usize) -> *mut c_void;

/// Inputs and parameters of one kernel invocation, copied out of the C view.
pub(crate) struct Call {
  inputs: HashMap<String, (Vec<u64>, c_int, Vec<u8>)>,
  params: HashMap<String, String>,
}

impl Call {
  /// # Safety
  /// Pointers must describe valid arrays of the given lengths, as the engine passes them.
  unsafe fn read(
    inputs: *const CustomNodeTensor,
    inputs_count: c_int,
    params: *const CustomNodeParam,
    params_count: c_int,
  ) -> Self {
    let tensors = if inputs.is_null() || inputs_count <= 0 {
      &[][..]
    } else {
      unsafe { slice::from_raw_parts(inputs, inputs_count as usize) }
    };
    let raw_params = if params.is_null() || params_count <= 0 {
      &[][..]
    } else {
      unsafe { slice::from_raw_parts(params, params_count as usize) }
    };
    let inputs = tensors
      .iter()
      .map(|t| {
        let name = unsafe { CStr::from_ptr(t.name) }
          .to_string_lossy()
          .into_owned();
        let dims = if t.dims_count == 0 {
          Vec::new()
        } else {
          unsafe { slice::from_raw_parts(t.dims, t.dims_count as usize) }.to_vec()
        };
        let data = if t.data_bytes == 0 {
          Vec::new()
        } else {
          unsafe { slice::from_raw_parts(t.data, t.data_bytes as usize) }.to_vec()
        };
        (name, (dims, t.precision, data))
      })
      .collect();
    let params = raw_params
      .iter()
      .map(|p| unsafe {
        (
          CStr::from_ptr(p.key).to_string_lossy().into_owned(),
          CStr::from_ptr(p.value).to_string_lossy().into_owned(),
        )
      })
      .collect();
    Self { inputs, params }
  }

  pub(crate) fn f32_input(&self, name: &str) -> Option<(Vec<u64>, Vec<f32>)> {
    let (dims, precision, data) = self.inputs.get(name)?;
    if *precision != Precision::Fp32 as c_int {
      return None;
    }
    let values = data
      .chunks_exact(4)
      .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
      .collect();
    Some((dims.clone(), values))
  }

  pub(crate) fn param(&self, key: &str) -> Option<&str> {
    self.params.get(key).map(String::as_str)
  }

  pub(crate) fn param_f32(&self, key: &str) -> Option<f32> {
    self.param(key)?.parse().ok()
  }
}

/// One output tensor a kernel hands back, possibly deliberately malformed.
pub(crate) struct RawOut {
  pub name: Option<&'static CStr>,
  pub precision: c_int,
  /// `None` returns a null dims pointer.
  pub dims: Option<Vec<u64>>,
  pub data: Vec<u8>,
  /// Overrides the reported byte count.
  pub data_bytes: Option<u64>,
}

impl RawOut {
  pub(crate) fn f32(name: &'static CStr, dims: Vec<u64>, values: &[f32]) -> Self {
    Self {
      name: Some(name),
      precision: Precision::Fp32 as c_int,
      dims: Some(dims),
      data: values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
      data_bytes: None,
    }
  }
}

pub(crate) enum KernelOutcome {
  Outputs(Vec<RawOut>),
  /// Non-zero status.
  Failed,
  /// Non-zero status after allocating the given outputs anyway.
  FailedWithOutputs(Vec<RawOut>),
  /// Status 0, null handle, the given count.
  NullHandle(c_int),
  /// Status 0, a one-entry allocation reported with the given count.
  BadCount(c_int),
}

pub(crate) struct InfoOut {
  pub name: &'static CStr,
  pub precision: Precision,
  pub dims: Vec<u64>,
}

fn alloc_copy<T: Copy>(alloc: Alloc, values: &[T]) -> *mut T {
  let p = alloc(std::mem::size_of_val(values)).cast::<T>();
  // SAFETY: freshly allocated block large enough for `values`.
  unsafe { ptr::copy_nonoverlapping(values.as_ptr(), p, values.len()) };
  p
}

/// # Safety
/// `outputs` and `count` must be valid out-pointers.
pub(crate) unsafe fn write_outcome(
  alloc: Alloc,
  outcome: KernelOutcome,
  outputs: *mut *mut CustomNodeTensor,
  count: *mut c_int,
) -> c_int {
  match outcome {
    KernelOutcome::Failed => 1,
    KernelOutcome::FailedWithOutputs(list) => {
      unsafe { write_outcome(alloc, KernelOutcome::Outputs(list), outputs, count) };
      1
    }
    KernelOutcome::NullHandle(n) => {
      unsafe {
        *outputs = ptr::null_mut();
        *count = n;
      }
      0
    }
    KernelOutcome::BadCount(n) => {
      let empty = CustomNodeTensor {
        name: ptr::null(),
        data: ptr::null_mut(),
        data_bytes: 0,
        dims: ptr::null_mut(),
        dims_count: 0,
        precision: 0,
      };
      unsafe {
        *outputs = alloc_copy(alloc, slice::from_ref(&empty));
        *count = n;
      }
      0
    }
    KernelOutcome::Outputs(list) if list.is_empty() => {
      unsafe {
        *outputs = ptr::null_mut();
        *count = 0;
      }
      0
    }
    KernelOutcome::Outputs(list) => {
      let tensors: Vec<CustomNodeTensor> = list
        .iter()
        .map(|out| {
          let data = if out.data.is_empty() {
            ptr::null_mut()
          } else {
            alloc_copy(alloc, &out.data)
          };
          let (dims, dims_count) = match &out.dims {
            Some(d) => (alloc_copy(alloc, d), d.len() as u64),
            None => (ptr::null_mut(), 0),
          };
          CustomNodeTensor {
            name: out.name.map_or(ptr::null(), CStr::as_ptr),
            data,
            data_bytes: out.data_bytes.unwrap_or(out.data.len() as u64),
            dims,
            dims_count,
            precision: out.precision,
          }
        })
        .collect();
      unsafe {
        *outputs = alloc_copy(alloc, &tensors);
        *count = tensors.len() as c_int;
      }
      0
    }
  }
}

/// # Safety
/// `info` and `count` must be valid out-pointers.
pub(crate) unsafe fn write_info(
  alloc: Alloc,
  entries: Option<Vec<InfoOut>>,
  info: *mut *mut CustomNodeTensorInfo,
  count: *mut c_int,
) -> c_int {
  let Some(entries) = entries else {
    return 1;
  };
  let raw: Vec<CustomNodeTensorInfo> = entries
    .iter()
    .map(|e| CustomNodeTensorInfo {
      name: e.name.as_ptr(),
      dims: if e.dims.is_empty() {
        ptr::null_mut()
      } else {
        alloc_copy(alloc, &e.dims)
      },
      dims_count: e.dims.len() as u64,
      precision: e.precision as c_int,
    })
    .collect();
  unsafe {
    if raw.is_empty() {
      *info = ptr::null_mut();
    } else {
      *info = alloc_copy(alloc, &raw);
    }
    *count = raw.len() as c_int;
  }
  0
}

/// Declares a kernel library module with private allocation counters.
macro_rules! kernel_library {
  ($module:ident, $kernel:path, $inputs:path, $outputs:path) => {
    pub(crate) mod $module {
      use std::ffi::{c_int, c_void};
      use std::sync::atomic::{AtomicUsize, Ordering};

      use crate::custom_node::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, NodeLibrary};

      static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
      static RELEASED: AtomicUsize = AtomicUsize::new(0);

      fn alloc(bytes: usize) -> *mut c_void {
        ALLOCATED.fetch_add(1, Ordering::SeqCst);
        // SAFETY: plain allocation; released through `release`.
        unsafe { libc::malloc(bytes.max(1)) }
      }

      unsafe extern "C" fn release(ptr: *mut c_void) -> c_int {
        RELEASED.fetch_add(1, Ordering::SeqCst);
        unsafe { libc::free(ptr) };
        0
      }

      unsafe extern "C" fn execute(
        inputs: *const CustomNodeTensor,
        inputs_count: c_int,
        outputs: *mut *mut CustomNodeTensor,
        outputs_count: *mut c_int,
        params: *const CustomNodeParam,
        params_count: c_int,
      ) -> c_int {
        let call = unsafe { super::Call::read(inputs, inputs_count, params, params_count) };
        unsafe { super::write_outcome(alloc, $kernel(&call), outputs, outputs_count) }
      }

      unsafe extern "C" fn get_inputs_info(
        info: *mut *mut CustomNodeTensorInfo,
        info_count: *mut c_int,
        params: *const CustomNodeParam,
        params_count: c_int,
      ) -> c_int {
        let call = unsafe { super::Call::read(std::ptr::null(), 0, params, params_count) };
        unsafe { super::write_info(alloc, $inputs(&call), info, info_count) }
      }

      unsafe extern "C" fn get_outputs_info(
        info: *mut *mut CustomNodeTensorInfo,
        info_count: *mut c_int,
        params: *const CustomNodeParam,
        params_count: c_int,
      ) -> c_int {
        let call = unsafe { super::Call::read(std::ptr::null(), 0, params, params_count) };
        unsafe { super::write_info(alloc, $outputs(&call), info, info_count) }
      }

      pub(crate) fn library() -> NodeLibrary {
        NodeLibrary::from_fns(execute, get_inputs_info, get_outputs_info, release)
      }

      /// `(allocations, releases)` so far.
      pub(crate) fn balance() -> (usize, usize) {
        (ALLOCATED.load(Ordering::SeqCst), RELEASED.load(Ordering::SeqCst))
      }
    }
  };
}

pub(crate) const ADD_SUB_INPUT: &str = "input_numbers";
pub(crate) const ADD_SUB_OUTPUT: &str = "output_numbers";

/// `output_numbers = input_numbers + add_value - sub_value`; fails without both parameters.
pub(crate) fn add_sub_kernel(call: &Call) -> KernelOutcome {
  let (Some(add), Some(sub)) = (call.param_f32("add_value"), call.param_f32("sub_value")) else {
    return KernelOutcome::Failed;
  };
  let Some((dims, values)) = call.f32_input(ADD_SUB_INPUT) else {
    return KernelOutcome::Failed;
  };
  let out: Vec<f32> = values.iter().map(|v| v + add - sub).collect();
  KernelOutcome::Outputs(vec![RawOut::f32(c"output_numbers", dims, &out)])
}

/// Repeats its input `count` times under a new leading dimension, adding the branch index.
pub(crate) fn fan_out_kernel(call: &Call) -> KernelOutcome {
  let Some(count) = call.param("count").and_then(|c| c.parse::<u64>().ok()) else {
    return KernelOutcome::Failed;
  };
  let Some((dims, values)) = call.f32_input(ADD_SUB_INPUT) else {
    return KernelOutcome::Failed;
  };
  let out: Vec<f32> = (0..count)
    .flat_map(|i| values.iter().map(move |v| v + i as f32))
    .collect();
  let mut shape = vec![count];
  shape.extend(dims);
  KernelOutcome::Outputs(vec![RawOut::f32(c"output_numbers", shape, &out)])
}

/// Misbehaves according to its `mode` parameter.
pub(crate) fn faulty_kernel(call: &Call) -> KernelOutcome {
  let valid = || RawOut::f32(c"output_numbers", vec![1, 2], &[1.0, 2.0]);
  match call.param("mode").unwrap_or_default() {
    "null_handle" => KernelOutcome::NullHandle(1),
    "zero_count" => KernelOutcome::BadCount(0),
    "unnamed" => KernelOutcome::Outputs(vec![RawOut {
      name: None,
      ..valid()
    }]),
    "missing_output" => KernelOutcome::Outputs(vec![RawOut::f32(c"unexpected", vec![1, 1], &[0.0])]),
    "invalid_precision" => KernelOutcome::Outputs(vec![RawOut {
      precision: 99,
      ..valid()
    }]),
    "unspecified_precision" => KernelOutcome::Outputs(vec![RawOut {
      precision: Precision::Unspecified as c_int,
      ..valid()
    }]),
    "invalid_shape" => KernelOutcome::Outputs(vec![RawOut {
      dims: None,
      ..valid()
    }]),
    "invalid_content_size" => KernelOutcome::Outputs(vec![RawOut {
      data_bytes: Some(12),
      ..valid()
    }]),
    "fail_with_outputs" => KernelOutcome::FailedWithOutputs(vec![valid(), valid()]),
    "extra_output" => KernelOutcome::Outputs(vec![
      valid(),
      RawOut::f32(c"ignored", vec![1, 1], &[7.0]),
    ]),
    _ => KernelOutcome::Failed,
  }
}

pub(crate) fn add_sub_inputs(_call: &Call) -> Option<Vec<InfoOut>> {
  Some(vec![InfoOut {
    name: c"input_numbers",
    precision: Precision::Fp32,
    dims: vec![],
  }])
}

pub(crate) fn add_sub_outputs(_call: &Call) -> Option<Vec<InfoOut>> {
  Some(vec![InfoOut {
    name: c"output_numbers",
    precision: Precision::Fp32,
    dims: vec![1, 2],
  }])
}

/// Like [add_sub_inputs] with a declared `[1, 3]` shape.
pub(crate) fn shaped_inputs(_call: &Call) -> Option<Vec<InfoOut>> {
  Some(vec![InfoOut {
    name: c"input_numbers",
    precision: Precision::Fp32,
    dims: vec![1, 3],
  }])
}

pub(crate) fn pair_inputs(_call: &Call) -> Option<Vec<InfoOut>> {
  Some(vec![
    InfoOut {
      name: c"input_numbers",
      precision: Precision::Fp32,
      dims: vec![],
    },
    InfoOut {
      name: c"extra",
      precision: Precision::Fp32,
      dims: vec![],
    },
  ])
}

/// Set once a `gated` metadata call is waiting.
pub(crate) static GATE_ENTERED: AtomicBool = AtomicBool::new(false);
/// Lets waiting `gated` metadata calls proceed.
pub(crate) static GATE_OPEN: AtomicBool = AtomicBool::new(false);

/// [add_sub_inputs] that blocks until [GATE_OPEN] is set.
pub(crate) fn gated_inputs(call: &Call) -> Option<Vec<InfoOut>> {
  GATE_ENTERED.store(true, Ordering::SeqCst);
  while !GATE_OPEN.load(Ordering::SeqCst) {
    std::thread::sleep(Duration::from_millis(1));
  }
  add_sub_inputs(call)
}

pub(crate) fn failing_info(_call: &Call) -> Option<Vec<InfoOut>> {
  None
}

kernel_library!(add_sub, super::add_sub_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(fan_out, super::fan_out_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(faulty, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(no_metadata, super::add_sub_kernel, super::failing_info, super::add_sub_outputs);
kernel_library!(two_inputs, super::add_sub_kernel, super::pair_inputs, super::add_sub_outputs);
kernel_library!(shaped, super::add_sub_kernel, super::shaped_inputs, super::add_sub_outputs);
// Registered only by the test that drives its gate.
kernel_library!(gated, super::add_sub_kernel, super::gated_inputs, super::add_sub_outputs);

// Dedicated instances for allocation accounting; each is used by exactly one test.
kernel_library!(add_sub_leak_check, super::add_sub_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(fail_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(fail_with_outputs_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(null_handle_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(zero_count_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(unnamed_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(missing_output_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(invalid_precision_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(invalid_shape_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(invalid_content_size_leak_check, super::faulty_kernel, super::add_sub_inputs, super::add_sub_outputs);
kernel_library!(metadata_leak_check, super::add_sub_kernel, super::add_sub_inputs, super::add_sub_outputs);

pub(crate) const DUMMY_MODEL: &str = "dummy";
pub(crate) const DUMMY_INPUT: &str = "b";
pub(crate) const DUMMY_OUTPUT: &str = "a";

/// Serves the `dummy` model (`a = b + 1`) while `serving` is set.
pub(crate) struct DummyBackend {
  serving: Mutex<bool>,
}

impl Default for DummyBackend {
  fn default() -> Self {
    Self {
      serving: Mutex::new(true),
    }
  }
}

impl DummyBackend {
  pub(crate) fn set_serving(&self, serving: bool) {
    *self.serving.lock() = serving;
  }
}

#[async_trait]
impl ModelBackend for DummyBackend {
  fn signature(&self, name: &str, _version: Option<u64>) -> Option<ModelSignature> {
    (*self.serving.lock() && name == DUMMY_MODEL).then(|| {
      ModelSignature::new(
        [(DUMMY_INPUT, Precision::Fp32)],
        [(DUMMY_OUTPUT, Precision::Fp32)],
      )
    })
  }

  async fn infer(
    &self,
    name: &str,
    version: Option<u64>,
    inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    if self.signature(name, version).is_none() {
      return Err(StatusCode::PipelineNodeReferingToMissingModel);
    }
    let input = inputs
      .get(DUMMY_INPUT)
      .ok_or(StatusCode::ModelExecutionFailed)?;
    let values = input.to_f32_vec().ok_or(StatusCode::ModelExecutionFailed)?;
    let out: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
    let buffer =
      Buffer::from_f32(input.shape().to_vec(), &out).map_err(|_| StatusCode::ModelExecutionFailed)?;
    Ok(HashMap::from([(DUMMY_OUTPUT.to_string(), buffer)]))
  }
}

pub(crate) fn f32_request(name: &str, shape: Vec<u64>, values: &[f32]) -> PredictRequest {
  PredictRequest::new().with_input(name, Buffer::from_f32(shape, values).expect("valid buffer"))
}

pub(crate) fn assert_close(actual: &[f32], expected: &[f32]) {
  assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
  for (a, e) in actual.iter().zip(expected) {
    assert!((a - e).abs() < 1e-4, "{actual:?} vs {expected:?}");
  }
}

pub(crate) const PIPELINE_INPUT: &str = "pipeline_input";
pub(crate) const PIPELINE_OUTPUT: &str = "pipeline_output";

/// Dummy model backend plus every test kernel registered under its module name.
pub(crate) fn dependencies() -> (Dependencies, Arc<DummyBackend>) {
  let backend = Arc::new(DummyBackend::default());
  let libraries = Arc::new(CustomNodeLibraryManager::default());
  libraries.register_library("add_sub", add_sub::library());
  libraries.register_library("fan_out", fan_out::library());
  libraries.register_library("faulty", faulty::library());
  libraries.register_library("no_metadata", no_metadata::library());
  libraries.register_library("two_inputs", two_inputs::library());
  libraries.register_library("shaped", shaped::library());
  (Dependencies::new(backend.clone(), libraries), backend)
}

pub(crate) fn add_sub_node(name: &str, add: f32, sub: f32) -> NodeInfo {
  NodeInfo::custom(
    name,
    "add_sub",
    [("add_value", add.to_string()), ("sub_value", sub.to_string())],
  )
}

pub(crate) fn fan_out_node(name: &str, branches: u64, count: DemultiplyCount) -> NodeInfo {
  NodeInfo::custom(name, "fan_out", [("count", branches.to_string())]).with_demultiply(count)
}

pub(crate) fn entry() -> NodeInfo {
  NodeInfo::entry(ENTRY_NODE_NAME, [PIPELINE_INPUT])
}

/// request → add_sub nodes in sequence → response.
pub(crate) fn chain(params: &[(f32, f32)]) -> (Vec<NodeInfo>, Connections) {
  let mut nodes = vec![entry(), NodeInfo::exit(EXIT_NODE_NAME)];
  let mut connections = Connections::new();
  let mut previous = (ENTRY_NODE_NAME.to_string(), PIPELINE_INPUT);
  for (i, (add, sub)) in params.iter().enumerate() {
    let name = format!("add_sub_{i}");
    nodes.push(add_sub_node(&name, *add, *sub));
    connect(&mut connections, &previous.0, &name, [(previous.1, ADD_SUB_INPUT)]);
    previous = (name, ADD_SUB_OUTPUT);
  }
  connect(
    &mut connections,
    &previous.0,
    EXIT_NODE_NAME,
    [(previous.1, PIPELINE_OUTPUT)],
  );
  (nodes, connections)
}

/// request → fan_out → add_sub(+1) per branch → response gathering from fan_out.
pub(crate) fn fan_out_gather(branches: u64, count: DemultiplyCount) -> (Vec<NodeInfo>, Connections) {
  let nodes = vec![
    entry(),
    fan_out_node("fan_out", branches, count),
    add_sub_node("branch", 1.0, 0.0),
    NodeInfo::exit(EXIT_NODE_NAME).with_gather_from("fan_out"),
  ];
  let mut connections = Connections::new();
  connect(&mut connections, ENTRY_NODE_NAME, "fan_out", [(PIPELINE_INPUT, ADD_SUB_INPUT)]);
  connect(&mut connections, "fan_out", "branch", [(ADD_SUB_OUTPUT, ADD_SUB_INPUT)]);
  connect(&mut connections, "branch", EXIT_NODE_NAME, [(ADD_SUB_OUTPUT, PIPELINE_OUTPUT)]);
  (nodes, connections)
}

/// Validates `nodes` into a fresh definition, panicking on failure.
pub(crate) fn available(
  name: &str,
  (nodes, connections): (Vec<NodeInfo>, Connections),
  deps: &Dependencies,
) -> PipelineDefinition {
  let definition = PipelineDefinition::new(name, nodes, connections);
  definition.validate(deps).expect("valid pipeline");
  definition
}

/// Creates and executes one instance.
pub(crate) async fn execute(
  definition: &PipelineDefinition,
  deps: &Dependencies,
  request: &PredictRequest,
) -> Result<PredictResponse, StatusCode> {
  let mut response = PredictResponse::default();
  definition.create(deps, request, &mut response)?.execute().await?;
  Ok(response)
}

pub(crate) fn output_values(response: &PredictResponse) -> Vec<f32> {
  response.outputs[PIPELINE_OUTPUT]
    .to_f32_vec()
    .expect("fp32 output")
}
