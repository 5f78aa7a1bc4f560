//! Filesystem allow-list enforcement over agent tool calls.
//!
//! File-oriented tools are hard-blocked when their resolved target falls
//! outside the allow-list. Shell execution cannot be validated that way, so
//! command text is only scanned for known-restricted path fragments and a
//! warning is raised. The asymmetry is deliberate: reliably blocking
//! arbitrary shell by text matching is not feasible, and pretending
//! otherwise would be worse than being loud about it.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

/// How the policy treats a given tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    /// read/write/edit/search tools whose input names a filesystem target.
    File,
    /// Arbitrary command execution.
    Shell,
    /// Everything else passes through untouched.
    Other,
}

pub fn classify_tool(tool: &str) -> ToolClass {
    match tool.to_ascii_lowercase().as_str() {
        "read" | "write" | "edit" | "multiedit" | "glob" | "grep" | "ls" | "notebookedit" => {
            ToolClass::File
        }
        "bash" | "shell" | "exec" | "run" => ToolClass::Shell,
        _ => ToolClass::Other,
    }
}

/// Outcome of checking one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolVerdict {
    Allow,
    /// File tool targeting a path outside the allow-list. The call must not
    /// execute and no result may reach the agent.
    Block { path: String },
    /// Shell command mentioning a restricted fragment. Logged, never blocked.
    Warn { fragment: String },
}

/// Command-text fragments that trigger the shell warning.
const RESTRICTED_FRAGMENTS: &[&str] = &[
    "..",
    "~/",
    "$HOME",
    "/etc/",
    "/usr/",
    "/var/",
    "/root/.ssh",
    "/.ssh",
];

/// Input keys that may carry a filesystem target.
const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "directory"];

/// Input keys that carry shell command text.
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script"];

#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
    allowed: Vec<PathBuf>,
}

impl PathPolicy {
    /// Build a policy rooted at `root` allowing the given subdirectories.
    /// An empty list allows the whole root.
    pub fn new(root: impl Into<PathBuf>, allowed_subdirs: &[&str]) -> Self {
        let root = normalize(&root.into());
        let allowed = if allowed_subdirs.is_empty() {
            vec![root.clone()]
        } else {
            allowed_subdirs
                .iter()
                .map(|sub| normalize(&root.join(sub)))
                .collect()
        };
        Self { root, allowed }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a tool-supplied path and check allow-list containment.
    pub fn path_allowed(&self, raw: &str) -> Result<PathBuf, PathBuf> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = normalize(&joined);
        if self
            .allowed
            .iter()
            .any(|allowed| resolved.starts_with(allowed))
        {
            Ok(resolved)
        } else {
            Err(resolved)
        }
    }

    /// Check one tool invocation against the policy.
    pub fn evaluate_tool(&self, tool: &str, input: &Value) -> ToolVerdict {
        match classify_tool(tool) {
            ToolClass::File => {
                for key in PATH_KEYS {
                    if let Some(raw) = input.get(key).and_then(Value::as_str) {
                        if let Err(resolved) = self.path_allowed(raw) {
                            return ToolVerdict::Block {
                                path: resolved.display().to_string(),
                            };
                        }
                    }
                }
                ToolVerdict::Allow
            }
            ToolClass::Shell => {
                for key in COMMAND_KEYS {
                    if let Some(command) = input.get(key).and_then(Value::as_str) {
                        if let Some(fragment) = scan_command(command) {
                            return ToolVerdict::Warn {
                                fragment: fragment.to_string(),
                            };
                        }
                    }
                }
                ToolVerdict::Allow
            }
            ToolClass::Other => ToolVerdict::Allow,
        }
    }
}

fn scan_command(command: &str) -> Option<&'static str> {
    RESTRICTED_FRAGMENTS
        .iter()
        .find(|fragment| command.contains(**fragment))
        .copied()
}

/// Lexical normalization: `.` removed, `..` pops. Works for paths that do
/// not exist yet, which `canonicalize` cannot do.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> PathPolicy {
        PathPolicy::new("/work/agent", &["notes", "scratch"])
    }

    #[test]
    fn allowed_subdir_paths_pass() {
        let policy = policy();
        assert!(policy.path_allowed("notes/todo.md").is_ok());
        assert!(policy.path_allowed("/work/agent/scratch/out.txt").is_ok());
    }

    #[test]
    fn outside_paths_are_blocked() {
        let policy = policy();
        assert!(policy.path_allowed("/etc/passwd").is_err());
        // Inside the root but not in an allowed subdirectory.
        assert!(policy.path_allowed("/work/agent/secrets.env").is_err());
    }

    #[test]
    fn two_directories_above_the_root_is_blocked() {
        let policy = policy();
        let resolved = policy
            .path_allowed("notes/../../../../etc/shadow")
            .expect_err("traversal must not pass");
        assert_eq!(resolved, PathBuf::from("/etc/shadow"));
    }

    #[test]
    fn file_tool_with_bad_path_blocks() {
        let policy = policy();
        let verdict = policy.evaluate_tool("Read", &json!({"file_path": "../../etc/passwd"}));
        assert!(matches!(verdict, ToolVerdict::Block { .. }));
    }

    #[test]
    fn shell_tool_only_warns() {
        let policy = policy();
        let verdict =
            policy.evaluate_tool("Bash", &json!({"command": "cat /etc/passwd | head"}));
        assert_eq!(
            verdict,
            ToolVerdict::Warn {
                fragment: "/etc/".to_string()
            }
        );
        // A clean command passes silently.
        assert_eq!(
            policy.evaluate_tool("Bash", &json!({"command": "cargo test"})),
            ToolVerdict::Allow
        );
    }

    #[test]
    fn unknown_tools_pass_through() {
        let policy = policy();
        assert_eq!(
            policy.evaluate_tool("WebSearch", &json!({"query": "/etc/passwd"})),
            ToolVerdict::Allow
        );
    }

    #[test]
    fn empty_allow_list_means_whole_root() {
        let policy = PathPolicy::new("/work/agent", &[]);
        assert!(policy.path_allowed("anything/below.txt").is_ok());
        assert!(policy.path_allowed("/elsewhere/file").is_err());
    }
}
