//! The interpreter host.
//!
//! Owns the single-threaded Lua state. Initialization happens once per
//! engine: register the callback surface, publish the read-only `CONFIG`
//! table, then load the built-in rule files in a fixed order. The `Lua` value
//! is `!Send`, which confines every interpreter entry to one thread.

use std::path::Path;
use std::sync::Arc;

use mlua::prelude::*;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::label::BuildLabel;
use crate::lua::globals;
use crate::lua::hooks::{HookPhase, ParseCtx};

/// Built-in rule files, loaded at initialization in exactly this order.
/// They define the user-facing rule surface (`build_rule`, `genrule`, the
/// per-language rules) in terms of the primitive callbacks.
const BUILTIN_RULES: &[(&str, &str)] = &[
  ("misc_rules", include_str!("rules/misc_rules.lua")),
  ("sh_rules", include_str!("rules/sh_rules.lua")),
  ("python_rules", include_str!("rules/python_rules.lua")),
  ("java_rules", include_str!("rules/java_rules.lua")),
  ("cc_rules", include_str!("rules/cc_rules.lua")),
  ("go_rules", include_str!("rules/go_rules.lua")),
  ("proto_rules", include_str!("rules/proto_rules.lua")),
];

/// What happened to a single parse attempt.
#[derive(Debug)]
pub enum ParseOutcome {
  /// The file executed to completion.
  Parsed,
  /// The file cannot finish until this label is built.
  Deferred(BuildLabel),
  Failed(Error),
}

pub struct Interpreter {
  lua: Lua,
  engine: Arc<Engine>,
}

impl Interpreter {
  /// Create the runtime and load the built-in rules. Failure here is fatal to
  /// the run.
  pub fn new(engine: Arc<Engine>) -> Result<Self> {
    debug!("initialising interpreter");
    // Rule files get tables, strings, and math on top of the base library;
    // no io, os, package, or debug. Files only reach the interpreter through
    // subinclude and include_defs.
    let lua = Lua::new_with(
      LuaStdLib::TABLE | LuaStdLib::STRING | LuaStdLib::MATH,
      LuaOptions::default(),
    )
    .map_err(|e| Error::Interpreter(format!("failed to create the rule runtime: {e}")))?;
    globals::register_globals(&lua, engine.clone())
      .map_err(|e| Error::Interpreter(format!("failed to initialise interpreter callbacks: {e}")))?;
    install_config(&lua, &engine)
      .map_err(|e| Error::Interpreter(format!("failed to publish CONFIG: {e}")))?;
    for (name, source) in BUILTIN_RULES {
      debug!(rules = name, "loading built-in build rules");
      lua
        .load(*source)
        .set_name(format!("@{name}"))
        .exec()
        .map_err(|e| {
          Error::Interpreter(format!("failed to interpret built-in build rules from {name}: {e}"))
        })?;
    }
    debug!("interpreter ready");
    Ok(Self { lua, engine })
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  /// Parse a single build file for `package`.
  pub fn parse_file(&self, path: &Path, package: &str) -> ParseOutcome {
    let source = match std::fs::read_to_string(path) {
      Ok(source) => source,
      Err(e) => {
        return ParseOutcome::Failed(Error::ParseFailed {
          file: path.to_path_buf(),
          message: e.to_string(),
        });
      }
    };
    debug!(package, file = %path.display(), "parsing package file");
    self.parse_code(&source, &format!("@{}", path.display()), package)
  }

  /// Parse build-file code directly; the chunk name shows up in diagnostics.
  pub fn parse_code(&self, source: &str, chunk_name: &str, package: &str) -> ParseOutcome {
    self.engine.ensure_pending(package);
    self.lua.set_app_data(ParseCtx::parsing(package));
    let result = self.lua.load(source).set_name(chunk_name).exec();
    self.lua.remove_app_data::<ParseCtx>();
    match result {
      Ok(()) => ParseOutcome::Parsed,
      Err(lua_err) => match Error::from_lua(&lua_err) {
        Error::Defer(label) => ParseOutcome::Deferred(label),
        Error::Interpreter(message) => ParseOutcome::Failed(Error::ParseFailed {
          file: chunk_name.trim_start_matches('@').into(),
          message,
        }),
        other => ParseOutcome::Failed(other),
      },
    }
  }

  /// Run a target's pre-build function, if it has one.
  pub fn run_pre_build(&self, label: &BuildLabel) -> Result<()> {
    let handle = {
      let graph = self.engine.graph.read().expect("graph lock poisoned");
      let target = graph.target(label).ok_or_else(|| Error::UnknownTarget {
        package: label.package.clone(),
        name: label.name.clone(),
      })?;
      target.pre_build.clone()
    };
    let Some(handle) = handle else {
      return Ok(());
    };
    debug!(target = %label, "running pre-build function");
    let func: LuaFunction = self
      .lua
      .registry_value(handle.key())
      .map_err(|e| Error::Interpreter(e.to_string()))?;
    self
      .lua
      .set_app_data(ParseCtx::in_hook(&label.package, &label.name, HookPhase::Pre));
    let result = func.call::<()>(label.name.as_str());
    self.lua.remove_app_data::<ParseCtx>();
    result.map_err(|e| {
      let cause = Error::from_lua(&e);
      Error::Interpreter(format!("failed to run pre-build function for {label}: {cause}"))
    })
  }

  /// Run a target's post-build function with the command's stdout, if it has
  /// one.
  pub fn run_post_build(&self, label: &BuildLabel, output: &str) -> Result<()> {
    let handle = {
      let graph = self.engine.graph.read().expect("graph lock poisoned");
      let target = graph.target(label).ok_or_else(|| Error::UnknownTarget {
        package: label.package.clone(),
        name: label.name.clone(),
      })?;
      target.post_build.clone()
    };
    let Some(handle) = handle else {
      return Ok(());
    };
    debug!(target = %label, "running post-build function");
    let func: LuaFunction = self
      .lua
      .registry_value(handle.key())
      .map_err(|e| Error::Interpreter(e.to_string()))?;
    self
      .lua
      .set_app_data(ParseCtx::in_hook(&label.package, &label.name, HookPhase::Post));
    let result = func.call::<()>((label.name.as_str(), output));
    self.lua.remove_app_data::<ParseCtx>();
    result.map_err(|e| {
      let cause = Error::from_lua(&e);
      Error::Interpreter(format!("failed to run post-build function for {label}: {cause}"))
    })
  }
}

/// Publish configuration as the read-only `CONFIG` table. Unknown keys read
/// as the empty string; assignment is rejected.
fn install_config(lua: &Lua, engine: &Engine) -> LuaResult<()> {
  let config = lua.create_table()?;
  for (key, value) in engine.config.interpreter_values() {
    config.set(key, value)?;
  }
  let mt = lua.create_table()?;
  mt.set(
    "__index",
    lua.create_function(|_, (_table, _key): (LuaValue, LuaValue)| Ok(String::new()))?,
  )?;
  mt.set(
    "__newindex",
    lua.create_function(|_, (_table, _key, _value): (LuaValue, LuaValue, LuaValue)| {
      Err::<(), _>(LuaError::external(Error::Interpreter(
        "CONFIG is read-only".to_string(),
      )))
    })?,
  )?;
  config.set_metatable(Some(mt));
  lua.globals().set("CONFIG", config)
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::config::Config;
  use crate::target::TargetState;

  fn setup() -> (TempDir, Arc<Engine>, Interpreter) {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(Config::default(), tmp.path()).unwrap();
    let interp = Interpreter::new(engine.clone()).unwrap();
    (tmp, engine, interp)
  }

  mod initialisation {
    use super::*;

    #[test]
    fn builtin_rules_are_loaded() {
      let (_tmp, _engine, interp) = setup();
      for rule in ["build_rule", "genrule", "filegroup", "remote_file", "sh_binary", "java_library"] {
        let defined: bool = interp
          .lua()
          .load(format!("return type({rule}) == 'function'"))
          .eval()
          .unwrap();
        assert!(defined, "{rule} should be defined");
      }
    }

    #[test]
    fn config_is_published_and_unknown_keys_are_empty() {
      let (_tmp, _engine, interp) = setup();
      let version: String = interp.lua().load("return CONFIG.KILN_VERSION").eval().unwrap();
      assert_eq!(version, env!("CARGO_PKG_VERSION"));

      let unknown: String = interp.lua().load("return CONFIG.NO_SUCH_KEY").eval().unwrap();
      assert_eq!(unknown, "");
    }

    #[test]
    fn config_rejects_assignment() {
      let (_tmp, _engine, interp) = setup();
      let result = interp.lua().load(r#"CONFIG.NEW_KEY = "value""#).exec();
      assert!(result.is_err());
    }
  }

  mod parsing {
    use super::*;

    #[test]
    fn genrule_registers_a_target() {
      let (_tmp, engine, interp) = setup();
      let outcome = interp.parse_code(
        r#"genrule { name = "a", cmd = "echo hi > $OUT", outs = { "a.txt" } }"#,
        "@a/BUILD",
        "a",
      );
      assert!(matches!(outcome, ParseOutcome::Parsed), "unexpected outcome: {outcome:?}");

      let graph = engine.graph.read().unwrap();
      let target = graph.target(&BuildLabel::new("a", "a")).unwrap();
      assert_eq!(target.outputs(), ["a.txt"]);
      assert!(target.dependencies.is_empty());
      assert_eq!(target.state(), TargetState::Inactive);
    }

    #[test]
    fn subinclude_of_unparsed_package_defers() {
      let (_tmp, engine, interp) = setup();
      let outcome = interp.parse_code(r#"subinclude("//a:rules")"#, "@b/BUILD", "b");
      match outcome {
        ParseOutcome::Deferred(label) => assert_eq!(label, BuildLabel::new("a", "rules")),
        other => panic!("expected Deferred, got {other:?}"),
      }
      assert_eq!(engine.deferred_packages(), vec!["b".to_string()]);
    }

    #[test]
    fn lua_diagnostics_carry_the_build_file() {
      let (_tmp, _engine, interp) = setup();
      let outcome = interp.parse_code("this is not lua", "@a/BUILD", "a");
      match outcome {
        ParseOutcome::Failed(Error::ParseFailed { file, .. }) => {
          assert_eq!(file, std::path::PathBuf::from("a/BUILD"));
        }
        other => panic!("expected ParseFailed, got {other:?}"),
      }
    }
  }

  mod hooks {
    use super::*;

    #[test]
    fn pre_build_can_rewrite_the_command() {
      let (_tmp, engine, interp) = setup();
      let outcome = interp.parse_code(
        r#"
          build_rule {
            name = "t",
            cmd = "original",
            outs = { "t.txt" },
            pre_build = function(name)
              kiln.set_command(name, "rewritten " .. table.concat(kiln.get_labels(name, "x:"), ","))
            end,
          }
        "#,
        "@a/BUILD",
        "a",
      );
      assert!(matches!(outcome, ParseOutcome::Parsed), "unexpected outcome: {outcome:?}");

      let label = BuildLabel::new("a", "t");
      {
        let mut graph = engine.graph.write().unwrap();
        let target = graph.target_mut(&label).unwrap();
        target.add_label("x:flag");
        target.set_state(TargetState::Building);
      }
      interp.run_pre_build(&label).unwrap();

      let graph = engine.graph.read().unwrap();
      assert_eq!(graph.target(&label).unwrap().command, "rewritten flag");
    }

    #[test]
    fn post_build_registers_discovered_outputs() {
      let (_tmp, engine, interp) = setup();
      interp.parse_code(
        r#"
          build_rule {
            name = "lib",
            cmd = "compile",
            post_build = function(name, output)
              for line in output:gmatch("[^\n]+") do
                kiln.add_out(name, (line:gsub("^%./", "")))
              end
            end,
          }
        "#,
        "@x/BUILD",
        "x",
      );

      let label = BuildLabel::new("x", "lib");
      engine
        .graph
        .write()
        .unwrap()
        .target_mut(&label)
        .unwrap()
        .set_state(TargetState::Building);
      interp
        .run_post_build(&label, "./Foo.class\n./Bar.class\n")
        .unwrap();

      let graph = engine.graph.read().unwrap();
      assert_eq!(graph.target(&label).unwrap().outputs(), ["Foo.class", "Bar.class"]);
    }

    #[test]
    fn post_build_can_read_transitive_labels() {
      let (_tmp, engine, interp) = setup();
      interp.parse_code(
        r#"
          genrule { name = "leaf", cmd = "echo", outs = { "leaf.txt" }, labels = { "x:go" } }
          build_rule {
            name = "t",
            cmd = "echo",
            deps = { ":leaf" },
            post_build = function(name, output)
              for _, suffix in ipairs(kiln.get_labels(name, "x:")) do
                kiln.add_out(name, suffix .. ".txt")
              end
            end,
          }
        "#,
        "@a/BUILD",
        "a",
      );

      let label = BuildLabel::new("a", "t");
      engine
        .graph
        .write()
        .unwrap()
        .target_mut(&label)
        .unwrap()
        .set_state(TargetState::Building);
      interp.run_post_build(&label, "").unwrap();

      let graph = engine.graph.read().unwrap();
      assert_eq!(graph.target(&label).unwrap().outputs(), ["go.txt"]);
    }

    #[test]
    fn hook_errors_are_reported_with_the_target() {
      let (_tmp, engine, interp) = setup();
      interp.parse_code(
        r#"
          build_rule {
            name = "t",
            cmd = "true",
            outs = { "t.txt" },
            post_build = function(name, output)
              error("exploded")
            end,
          }
        "#,
        "@a/BUILD",
        "a",
      );

      let label = BuildLabel::new("a", "t");
      engine
        .graph
        .write()
        .unwrap()
        .target_mut(&label)
        .unwrap()
        .set_state(TargetState::Building);
      let err = interp.run_post_build(&label, "").unwrap_err().to_string();
      assert!(err.contains("post-build function for //a:t"), "unexpected error: {err}");
      assert!(err.contains("exploded"), "unexpected error: {err}");
    }

    #[test]
    fn targets_without_hooks_are_a_no_op() {
      let (_tmp, engine, interp) = setup();
      interp.parse_code(r#"genrule { name = "t", cmd = "true", outs = { "t.txt" } }"#, "@a/BUILD", "a");
      let label = BuildLabel::new("a", "t");
      interp.run_pre_build(&label).unwrap();
      interp.run_post_build(&label, "ignored").unwrap();
      let _ = engine;
    }
  }
}
