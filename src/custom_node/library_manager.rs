//! Registry of custom node libraries, keyed by library name.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, instrument};

use super::abi::{
  EXECUTE_SYMBOL, ExecuteFn, GET_INPUTS_INFO_SYMBOL, GET_OUTPUTS_INFO_SYMBOL, MetadataFn,
  RELEASE_SYMBOL, ReleaseFn,
};
use super::node_library::NodeLibrary;
use crate::status::StatusCode;

struct Entry {
  library: NodeLibrary,
  /// `None` for libraries registered in-process.
  path: Option<PathBuf>,
}

/// Loads custom node libraries and hands out their entry points by name.
pub struct CustomNodeLibraryManager {
  /// When set, library paths must stay inside this directory.
  root: Option<PathBuf>,
  libraries: RwLock<HashMap<String, Entry>>,
}

impl Default for CustomNodeLibraryManager {
  fn default() -> Self {
    Self::new(None)
  }
}

impl CustomNodeLibraryManager {
  pub fn new(root: Option<PathBuf>) -> Self {
    Self {
      root,
      libraries: RwLock::new(HashMap::new()),
    }
  }

  /// Resolves `path` against the root, rejecting parent components and root escapes.
  fn check_path(&self, path: &Path) -> Result<PathBuf, StatusCode> {
    if path
      .components()
      .any(|c| matches!(c, Component::ParentDir))
    {
      error!(path = %path.display(), "custom node library path contains parent directory");
      return Err(StatusCode::PathInvalid);
    }
    let Some(root) = &self.root else {
      return Ok(path.to_path_buf());
    };
    let resolved = root.join(path);
    if !resolved.starts_with(root) {
      error!(path = %path.display(), root = %root.display(), "custom node library path escapes root");
      return Err(StatusCode::PathInvalid);
    }
    if let (Ok(real), Ok(real_root)) = (resolved.canonicalize(), root.canonicalize())
      && !real.starts_with(&real_root)
    {
      error!(path = %path.display(), "custom node library path resolves outside root");
      return Err(StatusCode::PathInvalid);
    }
    Ok(resolved)
  }

  /// Loads the shared library at `path` under `name`.
  ///
  /// Reloading an unchanged path is a no-op; a new path replaces the previous library.
  /// Pipelines already holding the old entry points keep the old module alive.
  #[instrument(level = "trace", skip(self))]
  pub fn load_library(&self, name: &str, path: &Path) -> Result<(), StatusCode> {
    let resolved = self.check_path(path)?;
    if let Some(existing) = self.libraries.read().get(name)
      && existing.path.as_deref() == Some(resolved.as_path())
    {
      return Ok(());
    }
    let library = open(&resolved).inspect_err(|_| {
      error!(name, path = %resolved.display(), "failed to load custom node library");
    })?;
    info!(name, path = %resolved.display(), "loaded custom node library");
    self.libraries.write().insert(
      name.to_string(),
      Entry {
        library,
        path: Some(resolved),
      },
    );
    Ok(())
  }

  /// Registers an in-process library under `name`, replacing any previous one.
  pub fn register_library(&self, name: &str, library: NodeLibrary) {
    info!(name, "registered custom node library");
    self
      .libraries
      .write()
      .insert(name.to_string(), Entry { library, path: None });
  }

  pub fn get_library(&self, name: &str) -> Option<NodeLibrary> {
    self.libraries.read().get(name).map(|e| e.library.clone())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.libraries.read().contains_key(name)
  }
}

fn open(path: &Path) -> Result<NodeLibrary, StatusCode> {
  // SAFETY: loading runs the library's initializers; libraries are trusted operator config.
  let module = unsafe { libloading::Library::new(path) }.map_err(|e| {
    error!(error = %e, "dlopen failed");
    StatusCode::NodeLibraryLoadFailed
  })?;
  let symbol_err = |e: libloading::Error| {
    error!(error = %e, "custom node library is missing a required symbol");
    StatusCode::NodeLibraryLoadFailed
  };
  // SAFETY: symbol types follow the custom node ABI; the module outlives the pointers
  // because it is stored alongside them.
  let (execute, inputs_info, outputs_info, release) = unsafe {
    (
      *module.get::<ExecuteFn>(EXECUTE_SYMBOL).map_err(symbol_err)?,
      *module
        .get::<MetadataFn>(GET_INPUTS_INFO_SYMBOL)
        .map_err(symbol_err)?,
      *module
        .get::<MetadataFn>(GET_OUTPUTS_INFO_SYMBOL)
        .map_err(symbol_err)?,
      *module.get::<ReleaseFn>(RELEASE_SYMBOL).map_err(symbol_err)?,
    )
  };
  Ok(NodeLibrary::from_module(
    Arc::new(module),
    execute,
    inputs_info,
    outputs_info,
    release,
  ))
}
