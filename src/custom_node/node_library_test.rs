//! Tests for the validated custom node call wrapper.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{NodeParameters, TensorInfo};
use crate::status::StatusCode;
use crate::testing::{self, ADD_SUB_INPUT, ADD_SUB_OUTPUT, assert_close};
use crate::types::{Buffer, Precision};

fn params(pairs: &[(&str, &str)]) -> NodeParameters {
  let map: BTreeMap<String, String> = pairs
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
  NodeParameters::new(&map).unwrap()
}

fn numbers(values: &[f32]) -> HashMap<String, Buffer> {
  HashMap::from([(
    ADD_SUB_INPUT.to_string(),
    Buffer::from_f32(vec![1, values.len() as u64], values).unwrap(),
  )])
}

fn consumed(names: &[&str]) -> BTreeSet<String> {
  names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn add_sub_computes_and_releases() {
  let library = testing::add_sub_leak_check::library();
  let out = library
    .execute(
      "add_sub",
      &numbers(&[3.2, 5.7, -2.4]),
      &params(&[("add_value", "2.5"), ("sub_value", "4.8")]),
      &consumed(&[ADD_SUB_OUTPUT]),
    )
    .unwrap();
  let result = &out[ADD_SUB_OUTPUT];
  assert_eq!(result.shape(), &[1, 3]);
  assert_eq!(result.precision(), Precision::Fp32);
  assert_close(&result.to_f32_vec().unwrap(), &[0.9, 3.4, -4.7]);
  let (allocated, released) = testing::add_sub_leak_check::balance();
  assert!(allocated > 0);
  assert_eq!(allocated, released);
}

#[test]
fn missing_parameters_fail_execution() {
  let library = testing::add_sub::library();
  let err = library
    .execute(
      "add_sub",
      &numbers(&[1.0]),
      &params(&[("add_value", "1")]),
      &consumed(&[ADD_SUB_OUTPUT]),
    )
    .unwrap_err();
  assert_eq!(err, StatusCode::NodeLibraryExecutionFailed);
}

fn faulty(mode: &str, library: super::NodeLibrary) -> Result<HashMap<String, Buffer>, StatusCode> {
  library.execute(
    "faulty",
    &numbers(&[1.0, 2.0]),
    &params(&[("mode", mode)]),
    &consumed(&[ADD_SUB_OUTPUT]),
  )
}

macro_rules! failure_case {
  ($test:ident, $mode:literal, $module:ident, $status:expr) => {
    #[test]
    fn $test() {
      assert_eq!(
        faulty($mode, testing::$module::library()).unwrap_err(),
        $status
      );
      let (allocated, released) = testing::$module::balance();
      assert_eq!(allocated, released, "library allocations leaked");
    }
  };
}

failure_case!(
  execution_failure,
  "fail",
  fail_leak_check,
  StatusCode::NodeLibraryExecutionFailed
);
failure_case!(
  execution_failure_with_outputs,
  "fail_with_outputs",
  fail_with_outputs_leak_check,
  StatusCode::NodeLibraryExecutionFailed
);
failure_case!(
  null_handle_with_count,
  "null_handle",
  null_handle_leak_check,
  StatusCode::NodeLibraryOutputsCorrupted
);
failure_case!(
  handle_with_zero_count,
  "zero_count",
  zero_count_leak_check,
  StatusCode::NodeLibraryOutputsCorruptedCount
);
failure_case!(
  unnamed_output,
  "unnamed",
  unnamed_leak_check,
  StatusCode::NodeLibraryOutputsCorrupted
);
failure_case!(
  missing_consumed_output,
  "missing_output",
  missing_output_leak_check,
  StatusCode::NodeLibraryMissingOutput
);
failure_case!(
  unknown_precision,
  "invalid_precision",
  invalid_precision_leak_check,
  StatusCode::NodeLibraryInvalidPrecision
);
failure_case!(
  null_dims,
  "invalid_shape",
  invalid_shape_leak_check,
  StatusCode::NodeLibraryInvalidShape
);
failure_case!(
  content_size_mismatch,
  "invalid_content_size",
  invalid_content_size_leak_check,
  StatusCode::NodeLibraryInvalidContentSize
);

#[test]
fn unspecified_precision_is_invalid() {
  assert_eq!(
    faulty("unspecified_precision", testing::faulty::library()).unwrap_err(),
    StatusCode::NodeLibraryInvalidPrecision
  );
}

#[test]
fn unconsumed_outputs_are_dropped() {
  let out = faulty("extra_output", testing::faulty::library()).unwrap();
  assert_eq!(out.len(), 1);
  assert_close(&out[ADD_SUB_OUTPUT].to_f32_vec().unwrap(), &[1.0, 2.0]);
}

#[test]
fn metadata_is_reported_and_released() {
  let library = testing::metadata_leak_check::library();
  let inputs = library.inputs_info(&NodeParameters::default()).unwrap();
  let outputs = library.outputs_info(&NodeParameters::default()).unwrap();
  assert_eq!(
    inputs,
    vec![TensorInfo {
      name: ADD_SUB_INPUT.to_string(),
      precision: Precision::Fp32,
      shape: vec![],
    }]
  );
  assert_eq!(outputs[0].name, ADD_SUB_OUTPUT);
  assert_eq!(outputs[0].shape, vec![1, 2]);
  let (allocated, released) = testing::metadata_leak_check::balance();
  assert!(allocated > 0);
  assert_eq!(allocated, released);
}

#[test]
fn failing_metadata_call() {
  let library = testing::no_metadata::library();
  assert_eq!(
    library.inputs_info(&NodeParameters::default()).unwrap_err(),
    StatusCode::NodeLibraryMetadataFailed
  );
}

#[test]
fn parameters_with_nul_are_rejected() {
  let map = BTreeMap::from([("key".to_string(), "va\0lue".to_string())]);
  assert_eq!(
    NodeParameters::new(&map).unwrap_err(),
    StatusCode::PipelineDefinitionInvalidNodeLibrary
  );
}
