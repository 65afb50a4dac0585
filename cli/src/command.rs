// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::fmt;

/// A well-formed shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `calc a b`: run the patched function on `a` and `b`.
    Calc { a: i32, b: i32 },
    /// `set C`: rewrite the constant embedded in the code.
    Set { constant: i32 },
    Help,
    Exit,
}

/// A line that could not be turned into a [`Command`]. These are reported
/// and the shell keeps going; nothing here reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    WrongArgumentCount { command: &'static str },
    BadCalcArguments,
    BadSetArgument,
    UnknownCommand(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::WrongArgumentCount { command } => {
                write!(f, "Incorrect number of arguments for {command}")
            }
            ParseError::BadCalcArguments => {
                write!(f, "Arguments for calc are incorrect")
            }
            ParseError::BadSetArgument => {
                write!(f, "Argument for set is incorrect")
            }
            ParseError::UnknownCommand(word) => {
                write!(f, "Unknown command: {word}")
            }
        }
    }
}

/// Splits `line` on whitespace and parses it. Blank lines parse to
/// `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = words.split_first() else {
        return Ok(None);
    };
    match command {
        "calc" => {
            let [a, b] = args else {
                return Err(ParseError::WrongArgumentCount {
                    command: "calc",
                });
            };
            let (Ok(a), Ok(b)) = (a.parse::<i32>(), b.parse::<i32>()) else {
                return Err(ParseError::BadCalcArguments);
            };
            Ok(Some(Command::Calc { a, b }))
        }
        "set" => {
            let [value] = args else {
                return Err(ParseError::WrongArgumentCount { command: "set" });
            };
            let Ok(constant) = value.parse::<i32>() else {
                return Err(ParseError::BadSetArgument);
            };
            Ok(Some(Command::Set { constant }))
        }
        "help" => {
            if !args.is_empty() {
                return Err(ParseError::WrongArgumentCount {
                    command: "help",
                });
            }
            Ok(Some(Command::Help))
        }
        "exit" => {
            if !args.is_empty() {
                return Err(ParseError::WrongArgumentCount {
                    command: "exit",
                });
            }
            Ok(Some(Command::Exit))
        }
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}
