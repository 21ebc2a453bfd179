use std::collections::HashMap;
use std::process::Command;

use super::{basename, ProcessEntry, ProcessLister};
use crate::error::ScanError;

/// Which `ps` dialect to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// procps / POSIX: `-e` selects every process, `comm` is the short name.
    Posix,
    /// macOS and the BSDs: `-ax`, and `comm` is the full executable path.
    Bsd,
}

/// Lists processes with two `ps` invocations, one for the short names and one
/// for the command lines, joined on pid.
///
/// Each column is requested alone (after the pid) so that names and arguments
/// containing spaces survive column splitting.
#[derive(Debug, Clone)]
pub struct PsLister {
    flavor: Flavor,
}

impl PsLister {
    pub fn posix() -> Self {
        Self { flavor: Flavor::Posix }
    }

    pub fn bsd() -> Self {
        Self { flavor: Flavor::Bsd }
    }

    fn selection(&self) -> &'static [&'static str] {
        match self.flavor {
            Flavor::Posix => &["-e", "-ww"],
            Flavor::Bsd => &["-ax", "-ww"],
        }
    }

    fn run(&self, column: &str) -> Result<String, ScanError> {
        let mut args: Vec<&str> = self.selection().to_vec();
        args.extend(["-o", column]);
        run_command("ps", &args)
    }
}

impl ProcessLister for PsLister {
    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let names = self.run("pid,comm")?;
        let commands = self.run("pid,args")?;
        Ok(join_listings(self.flavor, &names, &commands))
    }
}

/// Runs `program` and returns its stdout.
pub(super) fn run_command(program: &str, args: &[&str]) -> Result<String, ScanError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ScanError::Spawn { program: program.to_string(), source })?;

    if !output.status.success() {
        return Err(ScanError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    String::from_utf8(output.stdout).map_err(|_| ScanError::Utf8 { program: program.to_string() })
}

/// Parses `PID <value>` rows, skipping the header row and anything whose first
/// column is not a pid.
fn parse_pid_column<'a>(output: &'a str) -> impl Iterator<Item = (u32, &'a str)> + 'a {
    output.lines().skip(1).filter_map(|line| {
        let (pid, rest) = line.trim_start().split_once(char::is_whitespace)?;
        Some((pid.parse().ok()?, rest.trim()))
    })
}

fn join_listings(flavor: Flavor, names: &str, commands: &str) -> Vec<ProcessEntry> {
    let commands: HashMap<u32, &str> = parse_pid_column(commands).collect();

    parse_pid_column(names)
        .map(|(pid, comm)| {
            let name = match flavor {
                Flavor::Posix => comm,
                Flavor::Bsd => basename(comm),
            };
            ProcessEntry {
                pid,
                name: name.to_string(),
                command: commands.get(&pid).copied().unwrap_or_default().to_string(),
            }
        })
        .collect()
}
