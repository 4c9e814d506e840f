//! Engine configuration.
//!
//! A read-only snapshot consumed at interpreter initialization. The nested
//! sections flatten into the `CONFIG` table rule files read; unknown keys
//! resolve to the empty string there.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub build: BuildConfig,
  pub go: GoConfig,
  pub python: PythonConfig,
  pub java: JavaConfig,
  pub cpp: CppConfig,
  pub proto: ProtoConfig,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
  pub version: String,
  /// Any directory containing one of these is a package.
  pub build_file_names: Vec<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      version: env!("CARGO_PKG_VERSION").to_string(),
      build_file_names: vec!["BUILD".to_string(), "BUILD.lua".to_string()],
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoConfig {
  pub version: String,
  pub strip: bool,
}

impl Default for GoConfig {
  fn default() -> Self {
    Self {
      version: String::new(),
      strip: true,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
  pub pip_tool: String,
  pub pex_tool: String,
  pub default_interpreter: String,
  pub module_dir: String,
  pub default_pip_repo: String,
  pub use_pypi: bool,
}

impl Default for PythonConfig {
  fn default() -> Self {
    Self {
      pip_tool: "pip".to_string(),
      pex_tool: "pex".to_string(),
      default_interpreter: "python".to_string(),
      module_dir: "third_party/python".to_string(),
      default_pip_repo: String::new(),
      use_pypi: true,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JavaConfig {
  pub javac_tool: String,
  pub jar_tool: String,
  pub jarcat_tool: String,
  pub junit_runner: String,
  pub default_test_package: String,
  pub maven_tool: String,
  pub source_level: String,
  pub target_level: String,
}

impl Default for JavaConfig {
  fn default() -> Self {
    Self {
      javac_tool: "javac".to_string(),
      jar_tool: "jar".to_string(),
      jarcat_tool: "jarcat".to_string(),
      junit_runner: "junit_runner.jar".to_string(),
      default_test_package: String::new(),
      maven_tool: "fetch_maven".to_string(),
      source_level: "8".to_string(),
      target_level: "8".to_string(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CppConfig {
  pub cc_tool: String,
  pub ld_tool: String,
  pub default_cflags: String,
  pub default_test_cflags: String,
  pub default_ldflags: String,
  pub default_test_ldflags: String,
  pub default_namespace: String,
}

impl Default for CppConfig {
  fn default() -> Self {
    Self {
      cc_tool: "gcc".to_string(),
      ld_tool: "ld".to_string(),
      default_cflags: String::new(),
      default_test_cflags: String::new(),
      default_ldflags: "-lpthread -ldl".to_string(),
      default_test_ldflags: String::new(),
      default_namespace: String::new(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtoConfig {
  pub languages: Vec<String>,
  pub protoc_tool: String,
  pub protoc_go_plugin: String,
  pub grpc_python_plugin: String,
  pub grpc_java_plugin: String,
  pub protoc_version: String,
  pub python_dep: String,
  pub java_dep: String,
  pub go_dep: String,
  pub cc_dep: String,
  pub python_package: String,
  pub grpc_version: String,
  pub python_grpc_dep: String,
  pub java_grpc_dep: String,
  pub go_grpc_dep: String,
}

impl Default for ProtoConfig {
  fn default() -> Self {
    Self {
      languages: vec!["go".to_string(), "py".to_string(), "java".to_string()],
      protoc_tool: "protoc".to_string(),
      protoc_go_plugin: "protoc-gen-go".to_string(),
      grpc_python_plugin: "grpc_python_plugin".to_string(),
      grpc_java_plugin: "protoc-gen-grpc-java".to_string(),
      protoc_version: String::new(),
      python_dep: String::new(),
      java_dep: String::new(),
      go_dep: String::new(),
      cc_dep: String::new(),
      python_package: "google.protobuf".to_string(),
      grpc_version: String::new(),
      python_grpc_dep: String::new(),
      java_grpc_dep: String::new(),
      go_grpc_dep: String::new(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Artifact cache root; empty disables the cache. Absolute, or relative to
  /// the repo root.
  pub dir: String,
  /// External cleaner binary trimming the cache to the water marks; empty
  /// disables it.
  pub cleaner: String,
  pub high_water_mark: String,
  pub low_water_mark: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      dir: String::new(),
      cleaner: String::new(),
      high_water_mark: "10G".to_string(),
      low_water_mark: "8G".to_string(),
    }
  }
}

impl Config {
  /// Flatten the configuration into the key/value pairs published to rule
  /// files as `CONFIG.<NAME>`. Booleans become `"true"` or `""` so they stay
  /// truthy/falsy after string conversion on the interpreter side.
  pub fn interpreter_values(&self) -> Vec<(&'static str, String)> {
    let flag = |b: bool| if b { "true".to_string() } else { String::new() };
    vec![
      ("KILN_VERSION", self.build.version.clone()),
      ("GO_VERSION", self.go.version.clone()),
      ("GO_STRIP", flag(self.go.strip)),
      ("PIP_TOOL", self.python.pip_tool.clone()),
      ("PEX_TOOL", self.python.pex_tool.clone()),
      ("DEFAULT_PYTHON_INTERPRETER", self.python.default_interpreter.clone()),
      ("PYTHON_MODULE_DIR", self.python.module_dir.clone()),
      ("PYTHON_DEFAULT_PIP_REPO", self.python.default_pip_repo.clone()),
      ("USE_PYPI", flag(self.python.use_pypi)),
      ("JAVAC_TOOL", self.java.javac_tool.clone()),
      ("JAR_TOOL", self.java.jar_tool.clone()),
      ("JARCAT_TOOL", self.java.jarcat_tool.clone()),
      ("JUNIT_RUNNER", self.java.junit_runner.clone()),
      ("DEFAULT_TEST_PACKAGE", self.java.default_test_package.clone()),
      ("MAVEN_TOOL", self.java.maven_tool.clone()),
      ("JAVA_SOURCE_LEVEL", self.java.source_level.clone()),
      ("JAVA_TARGET_LEVEL", self.java.target_level.clone()),
      ("CC_TOOL", self.cpp.cc_tool.clone()),
      ("LD_TOOL", self.cpp.ld_tool.clone()),
      ("DEFAULT_CFLAGS", self.cpp.default_cflags.clone()),
      ("DEFAULT_TEST_CFLAGS", self.cpp.default_test_cflags.clone()),
      ("DEFAULT_LDFLAGS", self.cpp.default_ldflags.clone()),
      ("DEFAULT_TEST_LDFLAGS", self.cpp.default_test_ldflags.clone()),
      ("DEFAULT_NAMESPACE", self.cpp.default_namespace.clone()),
      ("OS", std::env::consts::OS.to_string()),
      ("ARCH", std::env::consts::ARCH.to_string()),
      ("PROTO_LANGUAGES", self.proto.languages.join(",")),
      ("PROTOC_TOOL", self.proto.protoc_tool.clone()),
      ("PROTOC_GO_PLUGIN", self.proto.protoc_go_plugin.clone()),
      ("GRPC_PYTHON_PLUGIN", self.proto.grpc_python_plugin.clone()),
      ("GRPC_JAVA_PLUGIN", self.proto.grpc_java_plugin.clone()),
      ("PROTOC_VERSION", self.proto.protoc_version.clone()),
      ("PROTO_PYTHON_DEP", self.proto.python_dep.clone()),
      ("PROTO_JAVA_DEP", self.proto.java_dep.clone()),
      ("PROTO_GO_DEP", self.proto.go_dep.clone()),
      ("PROTO_CC_DEP", self.proto.cc_dep.clone()),
      ("PROTO_PYTHON_PACKAGE", self.proto.python_package.clone()),
      ("GRPC_VERSION", self.proto.grpc_version.clone()),
      ("GRPC_PYTHON_DEP", self.proto.python_grpc_dep.clone()),
      ("GRPC_JAVA_DEP", self.proto.java_grpc_dep.clone()),
      ("GRPC_GO_DEP", self.proto.go_grpc_dep.clone()),
    ]
  }
}
