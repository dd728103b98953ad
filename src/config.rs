//! Configuration for the harness.
//!
//! Two layers: [`HarnessConfig`] holds runtime options (where the benchmark
//! tree lives, echo/overwrite toggles, timeouts) and [`GridConfig`] is the YAML
//! document enumerating benchmarks, backends, tools and measurement suites.

use crate::error::{HarnessError, Result};
use crate::extract::ToolKind;
use crate::grid::Cell;
use crate::process::Command;
use crate::result::MeasurementKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Runtime options for the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root of the benchmark tree; cells live under `<root>/src/`.
    pub root: PathBuf,
    /// Path of the YAML grid document.
    pub config_path: PathBuf,
    /// Mirror child output to the console while capturing it.
    pub echo: bool,
    /// Re-measure cells that already have stored results.
    pub overwrite: bool,
    /// Kill a child process that runs longer than this.
    pub timeout: Option<Duration>,
    /// Output directory for matrix run summaries.
    pub output_dir: PathBuf,
    /// Tool shared-object paths overriding the grid document.
    pub tool_paths: BTreeMap<ToolKind, PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/work/HeCBench"),
            config_path: PathBuf::from("benchgrid.yaml"),
            echo: false,
            overwrite: false,
            timeout: None,
            output_dir: PathBuf::from("target/benchgrid"),
            tool_paths: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config from environment variables.
    ///
    /// Supported variables:
    /// - `BENCHGRID_ROOT`: benchmark tree root
    /// - `BENCHGRID_CONFIG`: grid document path
    /// - `BENCHGRID_ECHO`: echo child output (default: false)
    /// - `BENCHGRID_OVERWRITE`: ignore cached results (default: false)
    /// - `BENCHGRID_TIMEOUT_SECS`: per-process timeout in seconds
    /// - `BENCHGRID_OUTPUT_DIR`: run summary directory
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BENCHGRID_ROOT") {
            cfg.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BENCHGRID_CONFIG") {
            cfg.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BENCHGRID_ECHO") {
            cfg.echo = truthy(&v);
        }
        if let Ok(v) = std::env::var("BENCHGRID_OVERWRITE") {
            cfg.overwrite = truthy(&v);
        }
        if let Ok(v) = std::env::var("BENCHGRID_TIMEOUT_SECS") {
            match parse_timeout_secs(&v) {
                Ok(timeout) => cfg.timeout = Some(timeout),
                Err(e) => warn!("ignoring BENCHGRID_TIMEOUT_SECS={v:?}: {e}"),
            }
        }
        if let Ok(v) = std::env::var("BENCHGRID_OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }

        cfg
    }

    /// Set the benchmark tree root.
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.root = path.into();
        self
    }

    /// Set the grid document path.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Echo child output.
    pub fn echo(mut self, v: bool) -> Self {
        self.echo = v;
        self
    }

    /// Overwrite cached results.
    pub fn overwrite(mut self, v: bool) -> Self {
        self.overwrite = v;
        self
    }

    /// Set timeout per child process.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the output directory.
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Override the shared object used for `tool`.
    pub fn tool_path(mut self, tool: ToolKind, path: impl Into<PathBuf>) -> Self {
        self.tool_paths.insert(tool, path.into());
        self
    }
}

fn truthy(v: &str) -> bool {
    v != "0" && !v.eq_ignore_ascii_case("false")
}

/// Parse a per-process timeout given in whole seconds. Zero is rejected.
///
/// Shared by `BENCHGRID_TIMEOUT_SECS` and `--timeout-secs`.
pub fn parse_timeout_secs(raw: &str) -> std::result::Result<Duration, String> {
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("expected a whole number of seconds: {e}"))?;
    if secs == 0 {
        return Err("timeout must be positive".to_string());
    }
    Ok(Duration::from_secs(secs))
}

// ============================================================================
// Grid document
// ============================================================================

/// The grid document: benchmarks, their backends, tools and suites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    /// Build program invoked in each cell directory.
    #[serde(default = "default_make")]
    pub make: String,
    #[serde(default)]
    pub benchmarks: BTreeMap<String, BenchmarkSpec>,
    /// Build flags per backend, used when a cell declares none.
    #[serde(default)]
    pub build_defaults: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tools: BTreeMap<ToolKind, ToolProfile>,
    #[serde(default)]
    pub suites: BTreeMap<MeasurementKind, SuiteSpec>,
}

fn default_make() -> String {
    "make".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkSpec {
    pub backends: BTreeMap<String, BackendSpec>,
}

/// Build and run templates for one cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSpec {
    #[serde(default)]
    pub build_flags: Option<Vec<String>>,
    /// Argument tokens; may contain `{root}`, `{bench_dir}`, `{benchmark}`, `{backend}`.
    pub run_command: Vec<String>,
}

/// How to attach an instrumentation tool to a benchmark process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolProfile {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Variables set for both passes.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra variables for the pass-through (baseline) pass.
    #[serde(default)]
    pub baseline_env: BTreeMap<String, String>,
}

/// Which cells a measurement suite covers and which tool each backend uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteSpec {
    pub benchmarks: Vec<String>,
    pub backends: Vec<String>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolKind>,
    #[serde(default)]
    pub default_tool: Option<ToolKind>,
}

/// Dynamic-loader variable naming the tool's shared object.
pub const PRELOAD_VAR: &str = "LD_PRELOAD";

impl ToolProfile {
    /// Built-in activation settings for each tool.
    pub fn default_for(kind: ToolKind) -> Self {
        let (path, env, baseline_env): (&str, &[(&str, &str)], &[(&str, &str)]) = match kind {
            ToolKind::NvbitInstrCount => (
                "/work/nvbit_release/tools/instr_count/instr_count.so",
                &[("COUNT_WARP_LEVEL", "0"), ("MANGLED_NAMES", "0")],
                &[("INSTR_END", "0")],
            ),
            ToolKind::LuthierInstrCount => (
                "/work/Luthier/build/examples/InstrCount/libLuthierInstrCount.so",
                &[("HIP_ENABLE_DEFERRED_LOADING", "0")],
                &[("LUTHIER_DISABLE_INSTRUMENTATION", "1")],
            ),
            ToolKind::LuthierLdsBankConflict => (
                "/work/Luthier/build/examples/LDSBankConflict/libLuthierLDSBankConflict.so",
                &[("HIP_ENABLE_DEFERRED_LOADING", "0")],
                &[("LUTHIER_DISABLE_INSTRUMENTATION", "1")],
            ),
            ToolKind::LuthierOpcodeHistogram => (
                "/work/Luthier/build/examples/OpcodeHistogram/libLuthierOpcodeHistogram.so",
                &[("HIP_ENABLE_DEFERRED_LOADING", "0")],
                &[("LUTHIER_DISABLE_INSTRUMENTATION", "1")],
            ),
        };
        let owned = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            path: Some(PathBuf::from(path)),
            env: owned(env),
            baseline_env: owned(baseline_env),
        }
    }

    /// Layer `other` over `self`: its path wins if set, its variables win per key.
    pub fn merged(mut self, other: &ToolProfile) -> Self {
        if other.path.is_some() {
            self.path = other.path.clone();
        }
        self.env.extend(other.env.clone());
        self.baseline_env.extend(other.baseline_env.clone());
        self
    }

    fn preload(&self, kind: ToolKind) -> Result<String> {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .ok_or_else(|| HarnessError::Config(format!("no shared object path for tool '{kind}'")))
    }

    /// Environment overlay for the instrumented pass.
    pub fn instrumented_env(&self, kind: ToolKind) -> Result<BTreeMap<String, String>> {
        let mut env = self.env.clone();
        env.insert(PRELOAD_VAR.to_string(), self.preload(kind)?);
        Ok(env)
    }

    /// Environment overlay for the baseline pass: same preload, instrumentation off.
    pub fn baseline_env(&self, kind: ToolKind) -> Result<BTreeMap<String, String>> {
        let mut env = self.instrumented_env(kind)?;
        env.extend(self.baseline_env.clone());
        Ok(env)
    }
}

impl GridConfig {
    /// Load and validate a grid document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a grid document from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let cfg: GridConfig = serde_yaml::from_str(content)
            .map_err(|e| HarnessError::Config(format!("invalid grid document: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for (bench, spec) in &self.benchmarks {
            for (backend, cell) in &spec.backends {
                if cell.run_command.is_empty() {
                    return Err(HarnessError::Config(format!(
                        "{bench}-{backend}: run_command is empty"
                    )));
                }
            }
        }
        for (kind, suite) in &self.suites {
            if let Some(unknown) = suite
                .benchmarks
                .iter()
                .find(|b| !self.benchmarks.contains_key(*b))
            {
                return Err(HarnessError::Config(format!(
                    "suite '{kind}' names unknown benchmark '{unknown}'"
                )));
            }
        }
        Ok(())
    }

    /// The templates for `cell`, if that pairing is configured.
    pub fn backend(&self, cell: &Cell) -> Option<&BackendSpec> {
        self.benchmarks
            .get(&cell.benchmark)
            .and_then(|b| b.backends.get(&cell.backend))
    }

    pub fn suite(&self, kind: MeasurementKind) -> Result<&SuiteSpec> {
        self.suites
            .get(&kind)
            .ok_or_else(|| HarnessError::Config(format!("no suite '{kind}' configured")))
    }

    /// The tool measuring `backend` in suite `kind`.
    pub fn tool_for(&self, kind: MeasurementKind, backend: &str) -> Result<ToolKind> {
        let suite = self.suite(kind)?;
        suite
            .tools
            .get(backend)
            .copied()
            .or(suite.default_tool)
            .ok_or_else(|| HarnessError::UnknownTool {
                suite: kind.to_string(),
                backend: backend.to_string(),
            })
    }

    /// Effective profile for `tool`: built-in defaults, then the document, then overrides.
    pub fn profile(&self, tool: ToolKind, overrides: &BTreeMap<ToolKind, PathBuf>) -> ToolProfile {
        let mut profile = ToolProfile::default_for(tool);
        if let Some(configured) = self.tools.get(&tool) {
            profile = profile.merged(configured);
        }
        if let Some(path) = overrides.get(&tool) {
            profile.path = Some(path.clone());
        }
        profile
    }

    /// `make <flags>` for `cell`, run inside its directory.
    pub fn build_command(&self, cell: &Cell, root: &Path) -> Result<Command> {
        let spec = self.require(cell)?;
        let flags = spec
            .build_flags
            .clone()
            .or_else(|| self.build_defaults.get(&cell.backend).cloned())
            .unwrap_or_default();
        let vars = placeholders(cell, root);
        let flags = flags
            .iter()
            .map(|f| expand(f, &vars))
            .collect::<Result<Vec<_>>>()?;
        Ok(Command::new(&self.make, cell.dir(root)).args(flags))
    }

    /// `make clean` for `cell`.
    pub fn clean_command(&self, cell: &Cell, root: &Path) -> Result<Command> {
        self.require(cell)?;
        Ok(Command::new(&self.make, cell.dir(root)).arg("clean"))
    }

    /// The benchmark's run command with placeholders substituted.
    pub fn run_command(&self, cell: &Cell, root: &Path) -> Result<Command> {
        let spec = self.require(cell)?;
        let vars = placeholders(cell, root);
        let argv = spec
            .run_command
            .iter()
            .map(|t| expand(t, &vars))
            .collect::<Result<Vec<_>>>()?;
        Command::from_argv(&argv, cell.dir(root))
    }

    fn require(&self, cell: &Cell) -> Result<&BackendSpec> {
        self.backend(cell)
            .ok_or_else(|| HarnessError::Config(format!("{cell} is not configured")))
    }
}

fn placeholders(cell: &Cell, root: &Path) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("root", root.display().to_string()),
        ("bench_dir", cell.dir(root).display().to_string()),
        ("benchmark", cell.benchmark.clone()),
        ("backend", cell.backend.clone()),
    ])
}

/// Substitute `{name}` placeholders in one token. `{{` and `}}` are literal braces.
///
/// Tokens are never evaluated; an unknown placeholder is an error.
pub fn expand(token: &str, vars: &BTreeMap<&'static str, String>) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(HarnessError::Config(format!(
                                "unterminated placeholder in '{token}'"
                            )))
                        }
                    }
                }
                let value = vars.get(name.as_str()).ok_or_else(|| {
                    HarnessError::Config(format!("unknown placeholder '{{{name}}}' in '{token}'"))
                })?;
                out.push_str(value);
            }
            '}' => {
                return Err(HarnessError::Config(format!(
                    "unmatched '}}' in '{token}'"
                )))
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}
