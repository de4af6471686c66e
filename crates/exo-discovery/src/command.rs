//! Invocations of the container runtime CLI.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Runtime command has unbalanced quoting: {0}")]
    Unparseable(String),
    #[error("Runtime command is empty")]
    Empty,
    #[error("Runtime executable not found: {0}")]
    NotFound(String),
}

/// One concrete call of the runtime: a program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Locate the program, returning its path alongside the arguments.
    ///
    /// # Errors
    /// Returns [`CommandError::NotFound`] when the program cannot be located.
    pub async fn locate(self) -> Result<(PathBuf, Vec<String>), CommandError> {
        match locate_program(&self.program).await {
            Some(path) => Ok((path, self.args)),
            None => Err(CommandError::NotFound(self.program)),
        }
    }
}

/// The configured runtime command, such as `docker`, `podman` or
/// `docker --context remote`.
///
/// Words are split with POSIX shell rules when an invocation is made.
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    line: String,
}

impl RuntimeCommand {
    #[must_use]
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// The runtime command followed by `args`.
    ///
    /// # Errors
    /// Returns error if the command line does not split or has no words.
    pub fn invocation<I, S>(&self, args: I) -> Result<Invocation, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut words = shlex::split(&self.line)
            .ok_or_else(|| CommandError::Unparseable(self.line.clone()))?
            .into_iter();
        let program = words.next().ok_or(CommandError::Empty)?;
        let args = words.chain(args.into_iter().map(Into::into)).collect();
        Ok(Invocation { program, args })
    }
}

/// Absolute paths are taken as they are; anything else is looked up on
/// `PATH`.
pub async fn locate_program(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    let direct = Path::new(program);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    let name = program.to_string();
    match tokio::task::spawn_blocking(move || which::which(name)).await {
        Ok(found) => found.ok(),
        Err(e) => {
            tracing::warn!("PATH lookup for {program} did not finish: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_with_quoted_name() {
        let call = RuntimeCommand::new("docker --context 'remote box'")
            .invocation(["ps", "-q"])
            .unwrap();
        assert_eq!(call.program, "docker");
        assert_eq!(call.args, ["--context", "remote box", "ps", "-q"]);
    }

    #[test]
    fn test_bad_command_lines() {
        assert!(matches!(
            RuntimeCommand::new("docker 'unterminated").invocation(["ps"]),
            Err(CommandError::Unparseable(_))
        ));
        assert!(matches!(
            RuntimeCommand::new("   ").invocation(["ps"]),
            Err(CommandError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_unknown_program() {
        let call = RuntimeCommand::new("exo-no-such-binary-here")
            .invocation(Vec::<String>::new())
            .unwrap();
        assert!(matches!(call.locate().await, Err(CommandError::NotFound(_))));
        assert!(locate_program(" ").await.is_none());
        assert!(locate_program("/definitely/not/here/docker").await.is_none());
    }
}
