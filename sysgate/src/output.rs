//! Human-facing output for `--list-tools`.

use std::io::{self, Write};

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::tools::ToolSpec;

/// Comma-separated tool names, as accepted by `--enabled-tools`.
pub fn tool_names(tools: &[ToolSpec]) -> String {
    tools.iter().map(|t| t.name).collect::<Vec<_>>().join(",")
}

/// Two-column `TOOL  DESCRIPTION` table.
pub fn tool_table(tools: &[ToolSpec], color: bool) -> String {
    let width = tools
        .iter()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0)
        .max("TOOL".len());

    let mut out = String::new();
    let header = format!("{:<width$}  {}", "TOOL", "DESCRIPTION");
    if color {
        out.push_str(&header.bold().to_string());
    } else {
        out.push_str(&header);
    }
    out.push('\n');

    for tool in tools {
        let name = format!("{:<width$}", tool.name);
        if color {
            out.push_str(&name.cyan().to_string());
        } else {
            out.push_str(&name);
        }
        out.push_str("  ");
        out.push_str(&tool.description);
        out.push('\n');
    }
    out
}

pub fn print_tools(tools: &[ToolSpec], verbose: bool) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    if verbose {
        let color = io::stdout().is_terminal();
        write!(stdout, "{}", tool_table(tools, color))?;
    } else {
        writeln!(stdout, "{}", tool_names(tools))?;
    }
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::catalog;

    #[test]
    fn test_tool_names() {
        assert_eq!(
            tool_names(&catalog(true)),
            "list_units,change_unit_state,check_restart_reload,deauthorize"
        );
    }

    #[test]
    fn test_tool_table_aligns_columns() {
        let table = tool_table(&catalog(false), false);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("TOOL         DESCRIPTION"));
        assert!(lines[1].starts_with("deauthorize  Drop the interactive"));
    }
}
