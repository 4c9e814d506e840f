//! Pre-/post-build hook handles and the per-call parse context.

use std::fmt;
use std::sync::Arc;

use mlua::RegistryKey;

/// An opaque handle to a hook function held in the interpreter's registry.
///
/// The function itself stays on the Lua side; the engine only needs to get it
/// back at run time and to digest its bytecode into the target's cache key.
#[derive(Clone)]
pub struct HookHandle {
  key: Arc<RegistryKey>,
}

impl HookHandle {
  pub fn new(key: RegistryKey) -> Self {
    Self { key: Arc::new(key) }
  }

  pub fn key(&self) -> &RegistryKey {
    &self.key
  }
}

impl fmt::Debug for HookHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookHandle").finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
  Pre,
  Post,
}

/// The hook currently executing, when one is.
#[derive(Debug, Clone)]
pub struct HookCtx {
  pub target: String,
  pub phase: HookPhase,
}

/// What the interpreter is doing right now; stored as Lua app data so every
/// callback can tell which package it is mutating and whether it is inside a
/// hook.
#[derive(Debug, Clone)]
pub struct ParseCtx {
  pub package: String,
  pub hook: Option<HookCtx>,
}

impl ParseCtx {
  pub fn parsing(package: impl Into<String>) -> Self {
    Self {
      package: package.into(),
      hook: None,
    }
  }

  pub fn in_hook(package: impl Into<String>, target: impl Into<String>, phase: HookPhase) -> Self {
    Self {
      package: package.into(),
      hook: Some(HookCtx {
        target: target.into(),
        phase,
      }),
    }
  }
}
