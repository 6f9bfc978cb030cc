//! Line commands accepted on stdin by `blast-processing run`.
//!
//! Parsing is kept apart from execution so the grammar can be tested without
//! an emulator.

use std::path::PathBuf;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Status,
    Pause,
    Continue,
    Reset,
    Stop,
    PowerOff,
    Save(String),
    Load(String),
    /// Without a path the CLI picks a timestamped file name.
    Screendump(Option<PathBuf>),
    /// Raw human monitor command line.
    Hmp(String),
    Quit,
}

pub const HELP: &[(&str, &str)] = &[
    ("status", "Query the guest run state"),
    ("pause", "Pause the guest"),
    ("continue", "Resume a paused guest"),
    ("reset", "Reset the guest"),
    ("stop", "Quit the emulator"),
    ("poweroff", "Send an ACPI power-off to the guest"),
    ("save <name>", "Save a snapshot"),
    ("load <name>", "Restore a snapshot"),
    ("screendump [path]", "Write the display to a PPM file"),
    ("hmp <command line>", "Run a human monitor command"),
    ("help", "Show this help"),
    ("quit", "Stop the emulator and exit"),
];

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<ReplCommand>, String> {
    let line = line.trim();
    let Some((word, rest)) = split_first(line) else {
        return Ok(None);
    };

    let command = match word {
        "help" | "?" => ReplCommand::Help,
        "status" => ReplCommand::Status,
        "pause" => ReplCommand::Pause,
        "continue" | "cont" | "resume" => ReplCommand::Continue,
        "reset" => ReplCommand::Reset,
        "stop" => ReplCommand::Stop,
        "poweroff" | "powerdown" => ReplCommand::PowerOff,
        "save" => ReplCommand::Save(single_arg(word, rest)?),
        "load" => ReplCommand::Load(single_arg(word, rest)?),
        "screendump" => ReplCommand::Screendump(
            (!rest.is_empty()).then(|| PathBuf::from(rest)),
        ),
        "hmp" => {
            if rest.is_empty() {
                return Err("Usage: hmp <command line>".to_string());
            }
            ReplCommand::Hmp(rest.to_string())
        }
        "quit" | "exit" => ReplCommand::Quit,
        other => return Err(format!("Unknown command: `{other}`. Type `help` for usage.")),
    };
    Ok(Some(command))
}

fn split_first(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    })
}

fn single_arg(word: &str, rest: &str) -> Result<String, String> {
    match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
        [name] => Ok((*name).to_string()),
        _ => Err(format!("Usage: {word} <name>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("   \t"), Ok(None));
    }

    #[test]
    fn parses_plain_commands_and_aliases() {
        assert_eq!(parse("pause"), Ok(Some(ReplCommand::Pause)));
        assert_eq!(parse(" cont "), Ok(Some(ReplCommand::Continue)));
        assert_eq!(parse("poweroff"), Ok(Some(ReplCommand::PowerOff)));
        assert_eq!(parse("exit"), Ok(Some(ReplCommand::Quit)));
    }

    #[test]
    fn snapshot_commands_take_exactly_one_name() {
        assert_eq!(parse("save s1"), Ok(Some(ReplCommand::Save("s1".into()))));
        assert_eq!(parse("load  s1 "), Ok(Some(ReplCommand::Load("s1".into()))));
        assert!(parse("save").is_err());
        assert!(parse("load a b").is_err());
    }

    #[test]
    fn hmp_keeps_the_rest_of_the_line() {
        assert_eq!(
            parse("hmp info  block"),
            Ok(Some(ReplCommand::Hmp("info  block".into())))
        );
        assert!(parse("hmp").is_err());
    }

    #[test]
    fn screendump_path_is_optional() {
        assert_eq!(parse("screendump"), Ok(Some(ReplCommand::Screendump(None))));
        assert_eq!(
            parse("screendump /tmp/shot.ppm"),
            Ok(Some(ReplCommand::Screendump(Some(PathBuf::from("/tmp/shot.ppm")))))
        );
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = parse("frobnicate now").unwrap_err();
        assert!(err.contains("frobnicate"));
    }
}
