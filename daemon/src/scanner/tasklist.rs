use super::ps::run_command;
use super::{ProcessEntry, ProcessLister};
use crate::error::ScanError;

/// Windows listing via `tasklist /fo csv /nh`.
///
/// `tasklist` does not expose command lines, so `command` carries the image
/// name and matching falls back to the basename rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct TasklistLister;

impl ProcessLister for TasklistLister {
    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let output = run_command("tasklist", &["/fo", "csv", "/nh"])?;
        Ok(parse_tasklist(&output))
    }
}

/// Parses `"Image Name","PID","Session Name","Session#","Mem Usage"` rows.
fn parse_tasklist(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_csv_line(line.trim());
            let name = fields.first()?;
            let pid = fields.get(1)?.parse().ok()?;
            Some(ProcessEntry {
                pid,
                name: name.clone(),
                command: name.clone(),
            })
        })
        .collect()
}

/// Splits one CSV line, honouring double quotes (`""` is an escaped quote).
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !line.is_empty() {
        fields.push(current);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
\"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\r
\"Code.exe\",\"10244\",\"Console\",\"1\",\"152,340 K\"\r
\"Figma.exe\",\"5120\",\"Console\",\"1\",\"98,100 K\"\r
";

    #[test]
    fn parses_quoted_rows() {
        let processes = parse_tasklist(OUTPUT);
        assert_eq!(processes.len(), 3);
        assert_eq!(processes[0].name, "System Idle Process");
        assert_eq!(processes[0].pid, 0);
        assert_eq!(processes[1].name, "Code.exe");
        assert_eq!(processes[1].pid, 10244);
        assert_eq!(processes[1].command, "Code.exe");
    }

    #[test]
    fn skips_blank_and_informational_lines() {
        let output = "\r\nINFO: No tasks are running which match the specified criteria.\r\n";
        assert!(parse_tasklist(output).is_empty());
    }

    #[test]
    fn csv_split_handles_embedded_commas_and_quotes() {
        assert_eq!(
            split_csv_line(r#""a,b","say ""hi""",plain"#),
            vec!["a,b".to_string(), "say \"hi\"".to_string(), "plain".to_string()]
        );
        assert!(split_csv_line("").is_empty());
    }
}
