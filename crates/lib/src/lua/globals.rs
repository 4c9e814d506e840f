//! The callback surface rule files invoke during parse.
//!
//! Registers:
//! - the `kiln` table: `add_target` plus the reflective helpers that are only
//!   valid inside pre-/post-build functions
//! - target handles as userdata, with one method per target attribute
//! - file-level globals: `subinclude`, `include_defs`, `glob`, `package_name`,
//!   and the `log` table
//!
//! Callbacks find the current package (and hook, if one is running) in the
//! [`ParseCtx`] stored as Lua app data by the interpreter host.

use std::sync::Arc;

use mlua::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::engine::Engine;
use crate::error::Error;
use crate::glob;
use crate::input::{self, BuildInput};
use crate::label::{self, BuildLabel};
use crate::lua::hooks::{HookHandle, HookPhase, ParseCtx};
use crate::target::{BuildTarget, TargetState};

pub fn register_globals(lua: &Lua, engine: Arc<Engine>) -> LuaResult<()> {
  let kiln = lua.create_table()?;
  register_add_target(lua, &kiln, engine.clone())?;
  register_hook_helpers(lua, &kiln, engine.clone())?;
  lua.globals().set("kiln", kiln)?;
  register_file_globals(lua, engine)?;
  register_log(lua)?;
  Ok(())
}

/// The current parse context, or an error when no build file is executing.
fn parse_ctx(lua: &Lua) -> LuaResult<ParseCtx> {
  lua
    .app_data_ref::<ParseCtx>()
    .map(|ctx| ctx.clone())
    .ok_or_else(|| external("no build file is being parsed"))
}

fn require_hook(lua: &Lua, what: &str) -> LuaResult<ParseCtx> {
  let ctx = parse_ctx(lua)?;
  if ctx.hook.is_none() {
    return Err(external(format!(
      "{what} is only valid inside a pre- or post-build function"
    )));
  }
  Ok(ctx)
}

fn external(message: impl Into<String>) -> LuaError {
  LuaError::external(Error::Interpreter(message.into()))
}

/// A registered target, handed back to the rule file so it can keep adding
/// attributes. Holds the label only; the target itself lives in the graph.
pub struct TargetHandle {
  label: BuildLabel,
  engine: Arc<Engine>,
}

impl TargetHandle {
  fn with_target<R>(&self, f: impl FnOnce(&mut BuildTarget) -> crate::error::Result<R>) -> LuaResult<R> {
    let mut graph = self.engine.graph.write().expect("graph lock poisoned");
    let target = graph.target_mut(&self.label).ok_or_else(|| {
      LuaError::external(Error::UnknownTarget {
        package: self.label.package.clone(),
        name: self.label.name.clone(),
      })
    })?;
    target.check_mutable().map_err(LuaError::external)?;
    f(target).map_err(Into::into)
  }

  fn parse_input(&self, src: &str) -> LuaResult<BuildInput> {
    input::parse_source(src, &self.label.package, &self.engine.boundary).map_err(LuaError::external)
  }

  fn parse_label(&self, s: &str) -> LuaResult<BuildLabel> {
    BuildLabel::parse(s, &self.label.package).map_err(LuaError::external)
  }
}

impl LuaUserData for TargetHandle {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("label", |_, this| Ok(this.label.to_string()));
    fields.add_field_method_get("name", |_, this| Ok(this.label.name.clone()));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method("add_src", |_, this, src: String| {
      let input = this.parse_input(&src)?;
      this.with_target(|t| {
        if let Some(dep) = input.label() {
          t.add_dependency(dep.clone());
        }
        t.sources.push(input);
        Ok(())
      })
    });

    methods.add_method("add_named_src", |_, this, (name, src): (String, String)| {
      let input = this.parse_input(&src)?;
      this.with_target(|t| {
        if let Some(dep) = input.label() {
          t.add_dependency(dep.clone());
        }
        t.add_named_source(&name, input);
        Ok(())
      })
    });

    methods.add_method("add_data", |_, this, src: String| {
      let input = this.parse_input(&src)?;
      this.with_target(|t| {
        if let Some(dep) = input.label() {
          t.add_dependency(dep.clone());
        }
        t.data.push(input);
        Ok(())
      })
    });

    methods.add_method("add_tool", |_, this, tool: String| {
      let input = this.parse_input(&tool)?;
      this.with_target(|t| {
        if let Some(dep) = input.label() {
          t.add_dependency(dep.clone());
        }
        t.tools.push(input);
        Ok(())
      })
    });

    methods.add_method("add_dep", |_, this, dep: String| {
      let dep = this.parse_label(&dep)?;
      this.with_target(|t| {
        t.add_dependency(dep);
        Ok(())
      })
    });

    methods.add_method("add_exported_dep", |_, this, dep: String| {
      let dep = this.parse_label(&dep)?;
      this.with_target(|t| {
        t.add_exported_dependency(dep);
        Ok(())
      })
    });

    methods.add_method("add_out", |_, this, out: String| {
      // Claim the file within the package before recording it on the target,
      // so two targets can't end up owning the same output.
      this.with_target(|t| t.check_mutable())?;
      this
        .engine
        .with_package_mut(&this.label.package, |pkg| pkg.register_output(&out, &this.label.name))
        .map_err(LuaError::external)?;
      this.with_target(|t| t.add_output(&out))
    });

    methods.add_method("add_vis", |_, this, vis: String| {
      let pattern = if vis == "PUBLIC" {
        BuildLabel::new("", "...")
      } else {
        this.parse_label(&vis)?
      };
      this.with_target(|t| {
        t.visibility.push(pattern);
        Ok(())
      })
    });

    methods.add_method("add_label", |_, this, l: String| {
      this.with_target(|t| {
        t.add_label(&l);
        Ok(())
      })
    });

    methods.add_method("add_hash", |_, this, hash: String| {
      this.with_target(|t| {
        t.hashes.push(hash);
        Ok(())
      })
    });

    methods.add_method("add_licence", |_, this, licence: String| {
      this.with_target(|t| {
        t.add_licence(&licence);
        Ok(())
      })
    });

    methods.add_method("add_test_output", |_, this, out: String| {
      this.with_target(|t| {
        t.test_outputs.push(out);
        Ok(())
      })
    });

    methods.add_method("add_require", |_, this, require: String| {
      this.with_target(|t| {
        t.add_require(&require);
        Ok(())
      })
    });

    methods.add_method("add_provide", |_, this, (language, dep): (String, String)| {
      let dep = this.parse_label(&dep)?;
      this.with_target(|t| {
        t.add_provide(&language, dep);
        Ok(())
      })
    });

    methods.add_method("set_container_setting", |_, this, (key, value): (String, String)| {
      this.with_target(|t| {
        t.set_container_setting(&key, &value);
        Ok(())
      })
    });

    methods.add_method("set_pre_build", |lua, this, func: LuaFunction| {
      let digest = Sha256::digest(func.dump(true)).to_vec();
      let key = lua.create_registry_value(func)?;
      this.with_target(move |t| {
        t.pre_build = Some(HookHandle::new(key));
        t.pre_build_hash = Some(digest);
        Ok(())
      })
    });

    methods.add_method("set_post_build", |lua, this, func: LuaFunction| {
      let digest = Sha256::digest(func.dump(true)).to_vec();
      let key = lua.create_registry_value(func)?;
      this.with_target(move |t| {
        t.post_build = Some(HookHandle::new(key));
        t.post_build_hash = Some(digest);
        Ok(())
      })
    });
  }
}

fn register_add_target(lua: &Lua, kiln: &LuaTable, engine: Arc<Engine>) -> LuaResult<()> {
  let add_target = lua.create_function(move |lua, spec: LuaTable| {
    let ctx = parse_ctx(lua)?;
    if ctx.hook.as_ref().is_some_and(|h| h.phase == HookPhase::Pre) {
      return Err(external("new targets cannot be registered from a pre-build function"));
    }
    let name: String = spec
      .get::<Option<String>>("name")?
      .ok_or_else(|| external("build targets require a name"))?;
    let label = BuildLabel::new(ctx.package.clone(), name.clone());

    let mut target = BuildTarget::new(label.clone());
    target.command = opt_string(&spec, "cmd")?;
    target.test_command = opt_string(&spec, "test_cmd")?;
    target.is_binary = opt_bool(&spec, "binary")?;
    target.is_test = opt_bool(&spec, "test")?;
    target.test_only = opt_bool(&spec, "test_only")?;
    target.needs_transitive_deps = opt_bool(&spec, "needs_transitive_deps")?;
    target.output_is_complete = opt_bool(&spec, "output_is_complete")?;
    target.containerise = opt_bool(&spec, "container")?;
    target.no_test_output = opt_bool(&spec, "no_test_output")?;
    target.skip_cache = opt_bool(&spec, "skip_cache")?;
    target.flakiness = opt_int(&spec, "flaky")?;
    target.build_timeout = opt_int(&spec, "timeout")?;
    target.test_timeout = opt_int(&spec, "test_timeout")?;
    target.building_description = spec.get("building_description")?;

    if !target.test_command.is_empty() && !target.is_test {
      return Err(external(format!(
        "target {label} has been given a test command but isn't a test"
      )));
    }
    if target.is_test && target.test_command.is_empty() {
      return Err(external(format!(
        "target {label} is a test but hasn't been given a test command"
      )));
    }
    if target.containerise {
      // Containerised tests are labelled automatically.
      target.add_label("container");
    }
    if target.is_binary {
      target.add_label("bin");
    }

    engine
      .graph
      .write()
      .expect("graph lock poisoned")
      .add_target(target)
      .map_err(LuaError::external)?;
    engine
      .with_package_mut(&ctx.package, |pkg| {
        pkg.register_target(&name);
        Ok(())
      })
      .map_err(LuaError::external)?;
    if ctx.hook.is_some() {
      debug!(target = %label, "adding new target to the graph from a build function");
    }

    Ok(TargetHandle {
      label,
      engine: engine.clone(),
    })
  })?;
  kiln.set("add_target", add_target)?;
  Ok(())
}

/// Resolve a hook argument naming a target, given as a bare name or a label
/// in the current package.
fn hook_target_label(ctx: &ParseCtx, spec: &str) -> LuaResult<BuildLabel> {
  let label = if label::looks_like_label(spec) {
    BuildLabel::parse(spec, &ctx.package).map_err(LuaError::external)?
  } else {
    BuildLabel::new(ctx.package.clone(), spec)
  };
  if label.package != ctx.package {
    return Err(external(format!(
      "build functions may only modify targets in their own package, not {label}"
    )));
  }
  Ok(label)
}

/// Look up a target a hook wants to mutate; it must exist and not be built.
fn with_target_post<R>(
  engine: &Engine,
  label: &BuildLabel,
  f: impl FnOnce(&mut BuildTarget) -> crate::error::Result<R>,
) -> LuaResult<R> {
  let mut graph = engine.graph.write().expect("graph lock poisoned");
  let target = graph.target_mut(label).ok_or_else(|| {
    LuaError::external(Error::UnknownTarget {
      package: label.package.clone(),
      name: label.name.clone(),
    })
  })?;
  target.check_mutable().map_err(LuaError::external)?;
  f(target).map_err(Into::into)
}

fn register_hook_helpers(lua: &Lua, kiln: &LuaTable, engine: Arc<Engine>) -> LuaResult<()> {
  let get_labels = {
    let engine = engine.clone();
    lua.create_function(move |lua, (name, prefix): (String, String)| {
      let ctx = require_hook(lua, "get_labels")?;
      let label = hook_target_label(&ctx, &name)?;
      let graph = engine.graph.read().expect("graph lock poisoned");
      let target = graph.target(&label).ok_or_else(|| {
        LuaError::external(Error::UnknownTarget {
          package: label.package.clone(),
          name: label.name.clone(),
        })
      })?;
      if target.state() != TargetState::Building {
        return Err(external(format!(
          "get_labels called for {label} incorrectly; it is only valid while the target is building"
        )));
      }
      Ok(graph.transitive_labels(&label, &prefix))
    })?
  };
  kiln.set("get_labels", get_labels)?;

  let get_command = {
    let engine = engine.clone();
    lua.create_function(move |lua, name: String| {
      let ctx = require_hook(lua, "get_command")?;
      let label = hook_target_label(&ctx, &name)?;
      let graph = engine.graph.read().expect("graph lock poisoned");
      graph.target(&label).map(|t| t.command.clone()).ok_or_else(|| {
        LuaError::external(Error::UnknownTarget {
          package: label.package.clone(),
          name: label.name.clone(),
        })
      })
    })?
  };
  kiln.set("get_command", get_command)?;

  let set_command = {
    let engine = engine.clone();
    lua.create_function(move |lua, (name, cmd): (String, String)| {
      let ctx = require_hook(lua, "set_command")?;
      if ctx.hook.as_ref().is_some_and(|h| h.phase == HookPhase::Post) {
        // Too late to have any effect: the command already ran.
        return Err(external("set_command cannot be called from a post-build function"));
      }
      let label = hook_target_label(&ctx, &name)?;
      with_target_post(&engine, &label, |t| {
        debug!(target = %label, new = %cmd, old = %t.command, "set command");
        t.command = cmd;
        Ok(())
      })
    })?
  };
  kiln.set("set_command", set_command)?;

  let add_dep = {
    let engine = engine.clone();
    lua.create_function(move |lua, (name, dep, exported): (String, String, Option<bool>)| {
      let ctx = require_hook(lua, "add_dep")?;
      let label = hook_target_label(&ctx, &name)?;
      let dep = BuildLabel::parse(&dep, &ctx.package).map_err(LuaError::external)?;
      with_target_post(&engine, &label, |t| {
        if exported.unwrap_or(false) {
          t.add_exported_dependency(dep);
        } else {
          t.add_dependency(dep);
        }
        Ok(())
      })
    })?
  };
  kiln.set("add_dep", add_dep)?;

  let add_out = {
    let engine = engine.clone();
    lua.create_function(move |lua, (name, out): (String, String)| {
      let ctx = require_hook(lua, "add_out")?;
      if ctx.hook.as_ref().is_some_and(|h| h.phase == HookPhase::Pre) {
        return Err(external("add_out is only valid inside a post-build function"));
      }
      let label = hook_target_label(&ctx, &name)?;
      with_target_post(&engine, &label, |t| t.check_mutable())?;
      engine
        .with_package_mut(&label.package, |pkg| pkg.register_output(&out, &label.name))
        .map_err(LuaError::external)?;
      with_target_post(&engine, &label, |t| t.add_output(&out))
    })?
  };
  kiln.set("add_out", add_out)?;

  let add_licence = {
    let engine = engine.clone();
    lua.create_function(move |lua, (name, licence): (String, String)| {
      let ctx = require_hook(lua, "add_licence")?;
      if ctx.hook.as_ref().is_some_and(|h| h.phase == HookPhase::Pre) {
        return Err(external("add_licence is only valid inside a post-build function"));
      }
      let label = hook_target_label(&ctx, &name)?;
      with_target_post(&engine, &label, |t| {
        t.add_licence(&licence);
        Ok(())
      })
    })?
  };
  kiln.set("add_licence", add_licence)?;

  Ok(())
}

fn register_file_globals(lua: &Lua, engine: Arc<Engine>) -> LuaResult<()> {
  let subinclude = {
    let engine = engine.clone();
    lua.create_function(move |lua, label_str: String| {
      let ctx = parse_ctx(lua)?;
      let label = BuildLabel::parse(&label_str, &ctx.package).map_err(LuaError::external)?;
      let path = engine
        .resolve_subinclude(&ctx.package, &label)
        .map_err(LuaError::external)?;
      engine
        .with_package_mut(&ctx.package, |pkg| {
          pkg.register_subinclude(&label.to_string());
          Ok(())
        })
        .map_err(LuaError::external)?;
      let source = std::fs::read_to_string(&path)
        .map_err(|e| LuaError::external(Error::Io(format!("cannot read {}: {e}", path.display()))))?;
      debug!(package = %ctx.package, label = %label, "loading subinclude");
      lua.load(&source).set_name(format!("@{}", path.display())).exec()
    })?
  };
  lua.globals().set("subinclude", subinclude)?;

  let include_defs = {
    let engine = engine.clone();
    lua.create_function(move |lua, label_str: String| {
      let ctx = parse_ctx(lua)?;
      let path = engine.resolve_include(&label_str).map_err(LuaError::external)?;
      engine
        .with_package_mut(&ctx.package, |pkg| {
          pkg.register_subinclude(label_str.trim_start_matches('/'));
          Ok(())
        })
        .map_err(LuaError::external)?;
      let source = std::fs::read_to_string(&path)
        .map_err(|e| LuaError::external(Error::Io(format!("cannot read {}: {e}", path.display()))))?;
      lua.load(&source).set_name(format!("@{}", path.display())).exec()
    })?
  };
  lua.globals().set("include_defs", include_defs)?;

  let glob_fn = {
    let engine = engine.clone();
    lua.create_function(
      move |lua, (includes, excludes, include_hidden): (LuaValue, Option<LuaValue>, Option<bool>)| {
        let ctx = parse_ctx(lua)?;
        let includes = string_list(includes)?;
        let excludes = excludes.map(string_list).transpose()?.unwrap_or_default();
        glob::glob(
          &engine.boundary,
          &ctx.package,
          &includes,
          &excludes,
          include_hidden.unwrap_or(false),
        )
        .map_err(LuaError::external)
      },
    )?
  };
  lua.globals().set("glob", glob_fn)?;

  let package_name = lua.create_function(move |lua, ()| parse_ctx(lua).map(|ctx| ctx.package))?;
  lua.globals().set("package_name", package_name)?;

  Ok(())
}

fn register_log(lua: &Lua) -> LuaResult<()> {
  fn current_package(lua: &Lua) -> String {
    lua
      .app_data_ref::<ParseCtx>()
      .map(|ctx| ctx.package.clone())
      .unwrap_or_default()
  }

  let log = lua.create_table()?;
  log.set(
    "debug",
    lua.create_function(|lua, msg: String| {
      tracing::debug!(package = %current_package(lua), "{}", msg);
      Ok(())
    })?,
  )?;
  log.set(
    "info",
    lua.create_function(|lua, msg: String| {
      tracing::info!(package = %current_package(lua), "{}", msg);
      Ok(())
    })?,
  )?;
  log.set(
    "notice",
    lua.create_function(|lua, msg: String| {
      tracing::info!(package = %current_package(lua), "{}", msg);
      Ok(())
    })?,
  )?;
  log.set(
    "warning",
    lua.create_function(|lua, msg: String| {
      tracing::warn!(package = %current_package(lua), "{}", msg);
      Ok(())
    })?,
  )?;
  log.set(
    "error",
    lua.create_function(|lua, msg: String| {
      tracing::error!(package = %current_package(lua), "{}", msg);
      Ok(())
    })?,
  )?;
  lua.globals().set("log", log)?;
  Ok(())
}

fn opt_string(spec: &LuaTable, key: &str) -> LuaResult<String> {
  Ok(spec.get::<Option<String>>(key)?.unwrap_or_default())
}

fn opt_bool(spec: &LuaTable, key: &str) -> LuaResult<bool> {
  Ok(spec.get::<Option<bool>>(key)?.unwrap_or(false))
}

fn opt_int(spec: &LuaTable, key: &str) -> LuaResult<i32> {
  Ok(spec.get::<Option<i32>>(key)?.unwrap_or(0))
}

fn string_list(value: LuaValue) -> LuaResult<Vec<String>> {
  match value {
    LuaValue::Nil => Ok(Vec::new()),
    LuaValue::String(s) => Ok(vec![s.to_str()?.to_string()]),
    LuaValue::Table(t) => {
      let mut out = Vec::new();
      for item in t.sequence_values::<String>() {
        out.push(item?);
      }
      Ok(out)
    }
    other => Err(external(format!(
      "expected a string or list of strings, got {}",
      other.type_name()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::sync::Arc;

  use tempfile::TempDir;

  use super::*;
  use crate::config::Config;

  fn setup(package: &str) -> (TempDir, Arc<Engine>, Lua) {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(Config::default(), tmp.path()).unwrap();
    let lua = Lua::new();
    register_globals(&lua, engine.clone()).unwrap();
    engine.ensure_pending(package);
    lua.set_app_data(ParseCtx::parsing(package));
    (tmp, engine, lua)
  }

  mod add_target {
    use super::*;

    #[test]
    fn registers_an_inactive_target() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(
          r#"
            local t = kiln.add_target { name = "a", cmd = "echo hi > $OUT" }
            t:add_out("a.txt")
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "a")).unwrap();
      assert_eq!(target.command, "echo hi > $OUT");
      assert_eq!(target.outputs(), ["a.txt"]);
      assert!(target.dependencies.is_empty());
      assert_eq!(target.state(), TargetState::Inactive);
    }

    #[test]
    fn duplicate_names_fail() {
      let (_tmp, _engine, lua) = setup("a");
      let result = lua
        .load(
          r#"
            kiln.add_target { name = "t", cmd = "true" }
            kiln.add_target { name = "t", cmd = "true" }
          "#,
        )
        .exec();
      let err = result.unwrap_err().to_string();
      assert!(err.contains("duplicate build target"), "unexpected error: {err}");
    }

    #[test]
    fn test_command_requires_test_flag() {
      let (_tmp, _engine, lua) = setup("a");
      let err = lua
        .load(r#"kiln.add_target { name = "t", cmd = "true", test_cmd = "run" }"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("isn't a test"), "unexpected error: {err}");

      let err = lua
        .load(r#"kiln.add_target { name = "u", cmd = "true", test = true }"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("hasn't been given a test command"), "unexpected error: {err}");
    }

    #[test]
    fn binary_and_container_targets_get_implicit_labels() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(r#"kiln.add_target { name = "b", cmd = "true", binary = true, container = true }"#)
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "b")).unwrap();
      assert!(target.labels.contains(&"container".to_string()));
      assert!(target.labels.contains(&"bin".to_string()));
    }
  }

  mod handle_methods {
    use super::*;

    #[test]
    fn label_sources_become_dependencies() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(
          r#"
            local t = kiln.add_target { name = "t", cmd = "true" }
            t:add_src("//x:lib")
            t:add_src("local.go")
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "t")).unwrap();
      assert_eq!(target.sources.len(), 2);
      assert!(target.dependencies.contains(&BuildLabel::new("x", "lib")));
      assert_eq!(target.dependencies.len(), 1);
    }

    #[test]
    fn cross_package_sources_are_rejected() {
      let (tmp, _engine, lua) = setup("a");
      fs::create_dir_all(tmp.path().join("a/b")).unwrap();
      fs::write(tmp.path().join("a/b/BUILD"), "").unwrap();

      let err = lua
        .load(
          r#"
            local t = kiln.add_target { name = "t", cmd = "true" }
            t:add_src("b/foo.go")
          "#,
        )
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("belongs to another package"), "unexpected error: {err}");
    }

    #[test]
    fn duplicate_outputs_across_targets_are_rejected() {
      let (_tmp, _engine, lua) = setup("a");
      let err = lua
        .load(
          r#"
            local one = kiln.add_target { name = "one", cmd = "true" }
            one:add_out("same.txt")
            local two = kiln.add_target { name = "two", cmd = "true" }
            two:add_out("same.txt")
          "#,
        )
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("already owned by"), "unexpected error: {err}");
    }

    #[test]
    fn public_visibility_covers_everything() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(
          r#"
            local t = kiln.add_target { name = "t", cmd = "true" }
            t:add_vis("PUBLIC")
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "t")).unwrap();
      assert_eq!(target.visibility, vec![BuildLabel::new("", "...")]);
    }

    #[test]
    fn hooks_record_bytecode_digests() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(
          r#"
            local t = kiln.add_target { name = "t", cmd = "true" }
            t:set_pre_build(function(name) end)
            t:set_post_build(function(name, output) end)
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "t")).unwrap();
      assert!(target.pre_build.is_some());
      assert!(target.post_build.is_some());
      let pre = target.pre_build_hash.as_ref().unwrap();
      let post = target.post_build_hash.as_ref().unwrap();
      assert_eq!(pre.len(), 32);
      assert_ne!(pre, post);
    }

    #[test]
    fn requires_become_labels_and_provides_resolve() {
      let (_tmp, engine, lua) = setup("a");
      lua
        .load(
          r#"
            local t = kiln.add_target { name = "t", cmd = "true" }
            t:add_require("go")
            t:add_provide("py", ":t_py")
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "t")).unwrap();
      assert_eq!(target.labels, vec!["go"]);
      assert_eq!(target.provide_for("py"), Some(&BuildLabel::new("a", "t_py")));
    }
  }

  mod hook_helpers {
    use super::*;

    #[test]
    fn reflective_helpers_require_a_hook() {
      let (_tmp, _engine, lua) = setup("a");
      lua.load(r#"kiln.add_target { name = "t", cmd = "true" }"#).exec().unwrap();
      let err = lua
        .load(r#"kiln.set_command("t", "false")"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(
        err.contains("only valid inside a pre- or post-build function"),
        "unexpected error: {err}"
      );
    }

    #[test]
    fn set_command_is_rejected_in_post_build() {
      let (_tmp, _engine, lua) = setup("a");
      lua.load(r#"kiln.add_target { name = "t", cmd = "true" }"#).exec().unwrap();
      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Post));
      let err = lua
        .load(r#"kiln.set_command("t", "false")"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("post-build"), "unexpected error: {err}");
    }

    #[test]
    fn post_build_can_add_outputs_by_label() {
      let (_tmp, engine, lua) = setup("x");
      lua.load(r#"kiln.add_target { name = "lib", cmd = "true" }"#).exec().unwrap();
      lua.set_app_data(ParseCtx::in_hook("x", "lib", HookPhase::Post));
      lua
        .load(
          r#"
            kiln.add_out("//x:lib", "Foo.class")
            kiln.add_out("lib", "Bar.class")
          "#,
        )
        .exec()
        .unwrap();

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("x", "lib")).unwrap();
      assert_eq!(target.outputs(), ["Foo.class", "Bar.class"]);
    }

    #[test]
    fn mutating_a_built_target_fails() {
      let (_tmp, engine, lua) = setup("a");
      lua.load(r#"kiln.add_target { name = "t", cmd = "true" }"#).exec().unwrap();
      engine
        .graph
        .write()
        .unwrap()
        .target_mut(&BuildLabel::new("a", "t"))
        .unwrap()
        .set_state(TargetState::Built);

      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Post));
      let err = lua
        .load(r#"kiln.add_out("t", "late.txt")"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("already built"), "unexpected error: {err}");
    }

    #[test]
    fn get_labels_works_from_either_hook_while_building() {
      let (_tmp, engine, lua) = setup("a");
      lua.load(r#"kiln.add_target({ name = "t", cmd = "true" }):add_label("x:flag")"#).exec().unwrap();

      // Not building yet: refused regardless of hook phase.
      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Post));
      let err = lua
        .load(r#"return kiln.get_labels("t", "x:")"#)
        .eval::<Vec<String>>()
        .unwrap_err()
        .to_string();
      assert!(err.contains("only valid while the target is building"), "unexpected error: {err}");

      engine
        .graph
        .write()
        .unwrap()
        .target_mut(&BuildLabel::new("a", "t"))
        .unwrap()
        .set_state(TargetState::Building);

      for phase in [HookPhase::Pre, HookPhase::Post] {
        lua.set_app_data(ParseCtx::in_hook("a", "t", phase));
        let labels: Vec<String> = lua.load(r#"return kiln.get_labels("t", "x:")"#).eval().unwrap();
        assert_eq!(labels, vec!["flag"]);
      }
    }

    #[test]
    fn pre_build_cannot_register_targets() {
      let (_tmp, _engine, lua) = setup("a");
      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Pre));
      let err = lua
        .load(r#"kiln.add_target { name = "late", cmd = "true" }"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("pre-build"), "unexpected error: {err}");
    }

    #[test]
    fn post_build_can_register_targets() {
      let (_tmp, engine, lua) = setup("a");
      lua.load(r#"kiln.add_target { name = "t", cmd = "true" }"#).exec().unwrap();
      engine.commit_package("a").unwrap();

      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Post));
      lua.load(r#"kiln.add_target { name = "discovered", cmd = "true" }"#).exec().unwrap();

      let graph = engine.graph.read().unwrap();
      assert!(graph.target(&BuildLabel::new("a", "discovered")).is_some());
      assert!(graph.package("a").unwrap().targets.contains("discovered"));
    }

    #[test]
    fn hooks_cannot_reach_other_packages() {
      let (_tmp, _engine, lua) = setup("a");
      lua.set_app_data(ParseCtx::in_hook("a", "t", HookPhase::Post));
      let err = lua
        .load(r#"kiln.add_out("//other:t", "o.txt")"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("their own package"), "unexpected error: {err}");
    }
  }

  mod file_globals {
    use super::*;

    #[test]
    fn glob_is_package_relative_and_prunes_subpackages() {
      let (tmp, _engine, lua) = setup("p");
      fs::create_dir_all(tmp.path().join("p/sub")).unwrap();
      fs::write(tmp.path().join("p/main.go"), "").unwrap();
      fs::write(tmp.path().join("p/sub/BUILD"), "").unwrap();
      fs::write(tmp.path().join("p/sub/inner.go"), "").unwrap();

      let found: Vec<String> = lua.load(r#"return glob({"**/*.go"})"#).eval().unwrap();
      assert_eq!(found, vec!["main.go"]);
    }

    #[test]
    fn package_name_reports_the_current_package() {
      let (_tmp, _engine, lua) = setup("some/pkg");
      let name: String = lua.load("return package_name()").eval().unwrap();
      assert_eq!(name, "some/pkg");
    }

    #[test]
    fn include_defs_requires_absolute_labels() {
      let (_tmp, _engine, lua) = setup("a");
      let err = lua
        .load(r#"include_defs("defs/build.lua")"#)
        .exec()
        .unwrap_err()
        .to_string();
      assert!(err.contains("start with //"), "unexpected error: {err}");
    }

    #[test]
    fn include_defs_loads_and_records_the_file() {
      let (tmp, engine, lua) = setup("a");
      fs::create_dir_all(tmp.path().join("defs")).unwrap();
      fs::write(tmp.path().join("defs/build.lua"), "SHARED_VALUE = 42").unwrap();

      lua.load(r#"include_defs("//defs/build.lua")"#).exec().unwrap();
      let value: i64 = lua.load("return SHARED_VALUE").eval().unwrap();
      assert_eq!(value, 42);

      engine
        .with_package_mut("a", |pkg| {
          assert_eq!(pkg.subincludes, vec!["defs/build.lua"]);
          Ok(())
        })
        .unwrap();
    }
  }
}
