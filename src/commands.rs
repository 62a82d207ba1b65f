// Operator commands
// Line-oriented control input: start/stop collection sessions and quit

use std::io::BufRead;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::{ActivityClass, CLASS_COUNT};
use crate::pipeline::{ControlCommand, PipelineEvent};

pub const HELP: &str = "commands: <label 0-4> | start [label] [device] | s | stop [device] | q";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid label '{0}', expected 0-{max}", max = CLASS_COUNT - 1)]
    InvalidLabel(String),

    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),
}

fn parse_label(token: &str) -> Result<u32, CommandParseError> {
    token
        .parse::<u32>()
        .ok()
        .filter(|&label| (label as usize) < CLASS_COUNT)
        .ok_or_else(|| CommandParseError::InvalidLabel(token.to_string()))
}

/// Parse one operator line
pub fn parse_command(line: &str) -> Result<ControlCommand, CommandParseError> {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Err(CommandParseError::Empty);
    };
    let args: Vec<&str> = tokens.collect();

    let command = match head.to_ascii_lowercase().as_str() {
        "q" | "quit" | "exit" => {
            if let Some(extra) = args.first() {
                return Err(CommandParseError::UnexpectedArgument(extra.to_string()));
            }
            ControlCommand::Quit
        }
        "s" | "stop" => {
            if let Some(extra) = args.get(1) {
                return Err(CommandParseError::UnexpectedArgument(extra.to_string()));
            }
            ControlCommand::Stop {
                device: args.first().map(|d| d.to_string()),
            }
        }
        "start" => {
            if let Some(extra) = args.get(2) {
                return Err(CommandParseError::UnexpectedArgument(extra.to_string()));
            }
            ControlCommand::Start {
                label: args.first().map(|t| parse_label(t)).transpose()?,
                device: args.get(1).map(|d| d.to_string()),
            }
        }
        other if other.chars().all(|c| c.is_ascii_digit()) => {
            if let Some(extra) = args.first() {
                return Err(CommandParseError::UnexpectedArgument(extra.to_string()));
            }
            ControlCommand::Start {
                label: Some(parse_label(other)?),
                device: None,
            }
        }
        other => return Err(CommandParseError::UnknownCommand(other.to_string())),
    };

    Ok(command)
}

/// Forward parsed lines to the pipeline until quit or end of input
///
/// Blocks on the reader, so it runs on its own thread rather than the runtime.
/// End of input does not quit, so the service keeps running when stdin is closed.
pub fn read_operator_commands<R: BufRead>(
    reader: R,
    events: mpsc::Sender<PipelineEvent>,
) -> std::io::Result<()> {
    for line in reader.lines() {
        let line = line?;
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(CommandParseError::Empty) => continue,
            Err(e) => {
                log::warn!("Ignored operator input {:?}: {} ({})", line.trim(), e, HELP);
                continue;
            }
        };

        match &command {
            ControlCommand::Start {
                label: Some(label), ..
            } => {
                if let Some(class) = ActivityClass::from_index(*label as usize) {
                    log::info!("Collecting label {}: {}", label, class.display_name());
                }
            }
            ControlCommand::Quit => log::info!("Quit from operator input"),
            _ => {}
        }

        let quit = command == ControlCommand::Quit;
        if events.blocking_send(PipelineEvent::Command(command)).is_err() || quit {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("2"),
            Ok(ControlCommand::Start {
                device: None,
                label: Some(2)
            })
        );
        assert_eq!(
            parse_command("start"),
            Ok(ControlCommand::Start {
                device: None,
                label: None
            })
        );
        assert_eq!(
            parse_command("  START 4 wrist "),
            Ok(ControlCommand::Start {
                device: Some("wrist".to_string()),
                label: Some(4)
            })
        );
        assert_eq!(parse_command("s"), Ok(ControlCommand::Stop { device: None }));
        assert_eq!(
            parse_command("stop A"),
            Ok(ControlCommand::Stop {
                device: Some("A".to_string())
            })
        );
        assert_eq!(parse_command("q"), Ok(ControlCommand::Quit));
        assert_eq!(parse_command("quit"), Ok(ControlCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_command("   "), Err(CommandParseError::Empty));
        assert_eq!(
            parse_command("7"),
            Err(CommandParseError::InvalidLabel("7".to_string()))
        );
        assert_eq!(
            parse_command("start walking"),
            Err(CommandParseError::InvalidLabel("walking".to_string()))
        );
        assert_eq!(
            parse_command("jump"),
            Err(CommandParseError::UnknownCommand("jump".to_string()))
        );
        assert_eq!(
            parse_command("q now"),
            Err(CommandParseError::UnexpectedArgument("now".to_string()))
        );
    }

    #[test]
    fn test_reader_forwards_until_quit() {
        let input = "1\n\nbogus\nstop\nq\n3\n";
        let (tx, mut rx) = mpsc::channel(8);

        read_operator_commands(Cursor::new(input), tx).unwrap();

        let mut received = Vec::new();
        while let Some(PipelineEvent::Command(command)) = rx.blocking_recv() {
            received.push(command);
        }
        assert_eq!(
            received,
            vec![
                ControlCommand::Start {
                    device: None,
                    label: Some(1)
                },
                ControlCommand::Stop { device: None },
                ControlCommand::Quit,
            ]
        );
    }

    #[test]
    fn test_reader_end_of_input_does_not_quit() {
        let (tx, mut rx) = mpsc::channel(8);
        read_operator_commands(Cursor::new("0\n"), tx).unwrap();

        assert!(matches!(
            rx.blocking_recv(),
            Some(PipelineEvent::Command(ControlCommand::Start { .. }))
        ));
        assert!(rx.blocking_recv().is_none());
    }
}
