// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::{
    error,
    io::{self, BufRead, Write},
    process,
};

use retune_engine::{session::Session, template::CodeTemplate};

use crate::command::{parse, Command};

mod command;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("retune-cli ships x86-64 machine code and only runs there");

const HELP: &str = "This program reads commands from STDIN in a loop. All calculations are done with 32-bit signed integers.
\texit\t\texits loop
\thelp\t\tshows this message
\tcalc a b\tcalculates (a + b) * C
\tset C\t\tchanges C to a given value. Default value is 1.
";

fn main() -> process::ExitCode {
    match run() {
        Ok(()) => process::ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            process::ExitCode::FAILURE
        }
    }
}

/// Drives one session until `exit`, end of input, or a fatal engine
/// failure. Returning (rather than exiting the process) lets the session
/// release its mapping on every path out.
fn run() -> Result<(), Box<dyn error::Error>> {
    let mut session = Session::init(CodeTemplate::add_mul())?;

    println!("{HELP}");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("$ ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // end of input
        }

        match parse(&line) {
            Ok(Some(Command::Calc { a, b })) => {
                println!("{}", session.invoke(a, b));
            }
            Ok(Some(Command::Set { constant })) => {
                // a refused protection change leaves the code page
                // unusable, so this error ends the whole session
                session.patch(constant)?;
                println!("New value of C was set");
            }
            Ok(Some(Command::Help)) => println!("{HELP}"),
            Ok(Some(Command::Exit)) => break,
            Ok(None) => {}
            Err(error) => println!("{error}"),
        }
    }

    session.shutdown();
    Ok(())
}
