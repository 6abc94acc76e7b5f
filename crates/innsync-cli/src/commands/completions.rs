use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

const BIN_NAME: &str = "innsync";

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::Fish => Self::Fish,
        }
    }
}

/// Conventional file name each shell loads completions from
pub const fn script_file_name(shell: CompletionShell) -> &'static str {
    match shell {
        CompletionShell::Bash => "innsync.bash",
        CompletionShell::Zsh => "_innsync",
        CompletionShell::Fish => "innsync.fish",
    }
}

pub fn completion_script(shell: CompletionShell) -> Vec<u8> {
    let mut command = Cli::command();
    let mut script = Vec::new();
    generate(Shell::from(shell), &mut command, BIN_NAME, &mut script);
    script
}

/// Print the script, or write it to `output`. A directory gets the
/// shell's conventional file name inside it.
pub fn run_completions(shell: CompletionShell, output: Option<&Path>) -> Result<(), CliError> {
    let script = completion_script(shell);
    let Some(output) = output else {
        io::stdout().write_all(&script)?;
        return Ok(());
    };

    let path: PathBuf = if output.is_dir() {
        output.join(script_file_name(shell))
    } else {
        output.to_path_buf()
    };
    std::fs::write(&path, &script)?;
    println!("{}", path.display());
    Ok(())
}
