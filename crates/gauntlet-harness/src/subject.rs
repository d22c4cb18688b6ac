//! Selection of the implementation under test.
//!
//! The harness is implementation-agnostic: anything honoring the CLI
//! contract can be driven. [`SUBJECT_ENV`] picks a variant, each mapping to
//! the command and working directory used to launch one role process.

use std::path::PathBuf;

use crate::error::HarnessError;

/// Environment variable naming the subject variant (`builtin` when unset).
pub const SUBJECT_ENV: &str = "GAUNTLET_SUBJECT";

/// Overrides the discovered path of the built-in `echo_node` binary.
pub const SUBJECT_BIN_ENV: &str = "GAUNTLET_SUBJECT_BIN";

/// A launchable protocol implementation.
#[derive(Debug, Clone)]
pub struct Subject {
    /// Program plus any leading arguments; the positional contract arguments
    /// (`role laddr lport msg_size raddr rport iterations`) are appended.
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl Subject {
    /// Resolve the subject from [`SUBJECT_ENV`].
    pub fn from_env() -> Result<Self, HarnessError> {
        let variant = std::env::var(SUBJECT_ENV).unwrap_or_else(|_| "builtin".into());
        Self::from_variant(&variant)
    }

    pub fn from_variant(variant: &str) -> Result<Self, HarnessError> {
        match variant {
            "builtin" => Ok(Self {
                command: vec![echo_node_binary().to_string_lossy().into_owned()],
                workdir: None,
            }),
            "python" => Ok(Self {
                command: vec!["python".into(), "-m".into(), "protocol".into()],
                workdir: Some(PathBuf::from("./python")),
            }),
            "cpp" => Ok(Self {
                command: vec!["./build/protocol".into()],
                workdir: Some(PathBuf::from("./cpp")),
            }),
            "golang" => Ok(Self {
                command: vec!["./build/protocol".into()],
                workdir: Some(PathBuf::from("./golang")),
            }),
            other => Err(HarnessError::UnknownSubject(other.to_string())),
        }
    }
}

/// Locate the built-in `echo_node` binary.
///
/// Honors [`SUBJECT_BIN_ENV`], then walks up from the current executable
/// (test binaries live in `target/debug/deps`), then falls back to
/// `target/debug/echo_node` relative to the working directory.
pub fn echo_node_binary() -> PathBuf {
    if let Ok(p) = std::env::var(SUBJECT_BIN_ENV) {
        return PathBuf::from(p);
    }
    if let Ok(mut path) = std::env::current_exe() {
        path.pop();
        if path.ends_with("deps") {
            path.pop();
        }
        path.push("echo_node");
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("target/debug/echo_node")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_variants_map_to_commands() {
        let golang = Subject::from_variant("golang").expect("golang variant");
        assert_eq!(golang.command, vec!["./build/protocol"]);
        assert_eq!(golang.workdir.as_deref(), Some(std::path::Path::new("./golang")));

        let python = Subject::from_variant("python").expect("python variant");
        assert_eq!(python.command[0], "python");
        assert_eq!(python.workdir.as_deref(), Some(std::path::Path::new("./python")));

        let builtin = Subject::from_variant("builtin").expect("builtin variant");
        assert!(builtin.command[0].ends_with("echo_node"));
        assert!(builtin.workdir.is_none());
    }

    #[test]
    fn unknown_variant_is_an_error() {
        assert!(matches!(
            Subject::from_variant("fortran"),
            Err(HarnessError::UnknownSubject(v)) if v == "fortran"
        ));
    }
}
