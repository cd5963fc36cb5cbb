//! Container command generation.
//!
//! The command handed to an execution container is a small shell script
//! composing three phases: an optional pre-hook, the main program, and an
//! optional post-hook that sees the main program's exit code in `EXIT_CODE`.
//! The script is generated from typed parts rather than string templates so
//! interpreter selection stays exhaustive.

use std::path::Path;

/// In-container working directory; the program directory is mounted here.
pub const WORKSPACE_DIR: &str = "/workspace";

/// In-container mount point of the hooks directory.
pub const ACTIONS_MOUNT: &str = "/actions";

/// Interpreter chosen from a file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Python,
    Node,
    Shell,
}

impl Interpreter {
    /// Select an interpreter by extension: `.py` → python, `.js` → node,
    /// anything else runs under bash.
    pub fn for_file(file_name: &str) -> Self {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some("py") => Self::Python,
            Some("js") => Self::Node,
            _ => Self::Shell,
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Shell => "bash",
        }
    }
}

/// Which side of the main program a hook runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Before,
    After,
}

impl HookStage {
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Before => "act_before",
            Self::After => "act_after",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Before => "[ACT_BEFORE]",
            Self::After => "[ACT_AFTER]",
        }
    }
}

/// A hook resolved to a concrete file and interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub stage: HookStage,
    /// Path inside the container, e.g. `/actions/act_before.py`.
    pub container_path: String,
    pub interpreter: Interpreter,
}

/// Probe the host-side hooks directory for a stage's script.
///
/// Candidates are checked in interpreter order (`.py`, `.js`, `.sh`); the
/// first existing file wins. Returns `None` when the directory has no hook
/// for this stage.
pub fn detect_hook(actions_dir: &Path, stage: HookStage) -> Option<Hook> {
    for ext in ["py", "js", "sh"] {
        let file_name = format!("{}.{ext}", stage.file_stem());
        if actions_dir.join(&file_name).is_file() {
            return Some(Hook {
                stage,
                container_path: format!("{ACTIONS_MOUNT}/{file_name}"),
                interpreter: Interpreter::for_file(&file_name),
            });
        }
    }
    None
}

/// The full command for one execution container.
#[derive(Debug, Clone)]
pub struct ContainerCommand {
    /// Main file name, relative to the workspace.
    pub main_file: String,
    /// Literal argv suffix from the catalog, appended verbatim.
    pub static_params: Option<String>,
    pub pre_hook: Option<Hook>,
    pub post_hook: Option<Hook>,
}

impl ContainerCommand {
    /// Render the shell script run as the container command.
    ///
    /// Hook invocations keep an in-container existence guard even though
    /// detection already happened host-side: the hooks mount may be absent
    /// in the container. A hook's exit status is reported on the shared
    /// stream and otherwise ignored; the script always exits with the main
    /// program's code.
    pub fn shell_script(&self) -> String {
        let mut lines = vec![
            format!("cd {WORKSPACE_DIR}"),
            "if command -v pip >/dev/null 2>&1 && [ -f requirements.txt ]; then pip install -r requirements.txt; fi".to_string(),
        ];

        if let Some(hook) = &self.pre_hook {
            lines.push(hook_line(hook));
        }

        let mut main = format!(
            "{} {}",
            Interpreter::for_file(&self.main_file).binary(),
            self.main_file
        );
        if let Some(params) = self.static_params.as_deref() {
            if !params.is_empty() {
                main.push(' ');
                main.push_str(params);
            }
        }
        lines.push(main);
        lines.push("EXIT_CODE=$?".to_string());
        lines.push("export EXIT_CODE".to_string());

        if let Some(hook) = &self.post_hook {
            lines.push(hook_line(hook));
        }

        lines.push("exit $EXIT_CODE".to_string());
        lines.join("\n")
    }

    /// The exec form handed to the container runtime.
    pub fn as_exec(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            self.shell_script(),
        ]
    }
}

fn hook_line(hook: &Hook) -> String {
    format!(
        "if [ -f {path} ]; then {bin} {path} || echo \"{label} hook exited with status $?\"; fi",
        path = hook.container_path,
        bin = hook.interpreter.binary(),
        label = hook.stage.label(),
    )
}
