//! Line commands read from stdin.

use std::fmt;

use red_core::Edit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Invite(String),
    Edit(Edit),
    Peers,
    Stats,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
commands:
  invite <host:port>   add a collaborator
  insert <pos> <char>  insert one character
  delete <pos>         delete one character
  peers                list known collaborators
  stats                show session counters
  quit                 terminate the session";

impl Command {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let cmd = match verb {
            "invite" => Command::Invite(arg(words.next(), "invite needs an address")?.to_string()),
            "insert" => {
                let pos = position(words.next())?;
                let ch = single_char(words.next())?;
                Command::Edit(Edit::insert(pos, ch))
            }
            "delete" => Command::Edit(Edit::delete(position(words.next())?)),
            "peers" => Command::Peers,
            "stats" => Command::Stats,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(ParseError(format!("unknown command '{other}'"))),
        };

        if words.next().is_some() {
            return Err(ParseError(format!("too many arguments for '{verb}'")));
        }
        Ok(Some(cmd))
    }
}

fn arg<'a>(word: Option<&'a str>, missing: &str) -> Result<&'a str, ParseError> {
    word.ok_or_else(|| ParseError(missing.to_string()))
}

fn position(word: Option<&str>) -> Result<u32, ParseError> {
    let word = arg(word, "missing position")?;
    word.parse()
        .map_err(|_| ParseError(format!("invalid position '{word}'")))
}

fn single_char(word: Option<&str>) -> Result<char, ParseError> {
    let word = arg(word, "missing character")?;
    let mut chars = word.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(ch),
        _ => Err(ParseError(format!("expected a single character, got '{word}'"))),
    }
}
