//! Control-channel commands
//!
//! One command per line. The command word is case-insensitive; arguments are
//! separated by whitespace and the last argument takes the rest of the line
//! (so JSON events may contain spaces). Binary payloads are Base64-wrapped
//! JSON.
//!
//! ```text
//! SET-GROUPING-CONFIG <base64>
//! LIST-GROUPING-CONFIGS
//! GET-GROUPING-CONFIG <name>
//! CLEAR-GROUPING-CONFIGS
//! GET-ACTIVE-GROUPING
//! SET-ACTIVE-GROUPING <name>
//! SET-BROKER-CONNECTION <base64>
//! SET-CONSTANTS <base64>
//! SEND-LOCAL-EVENT <topic> <json>
//! SEND-EVENT <url> <topic> <json>
//! GET-STATS
//! CLEAR-STATS
//! CACHE LIST | CLEAR [RESET] | EXCLUDE <destination> | INCLUDE <destination>
//! EXIT
//! ```

use std::str::FromStr;

use crate::error::ControlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    SetGroupingConfig(String),
    ListGroupingConfigs,
    GetGroupingConfig(String),
    ClearGroupingConfigs,
    GetActiveGrouping,
    SetActiveGrouping(String),
    SetBrokerConnection(String),
    SetConstants(String),
    SendLocalEvent { topic: String, event: String },
    SendEvent { url: String, topic: String, event: String },
    GetStats,
    ClearStats,
    Cache(CacheCommand),
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    List,
    Clear { reset: bool },
    Exclude(String),
    Include(String),
}

/// Splits off whitespace-separated arguments, the last one keeps the remainder
struct Arguments<'a> {
    command: &'static str,
    rest: &'a str,
}

impl<'a> Arguments<'a> {
    fn next(&mut self, argument: &'static str) -> Result<&'a str, ControlError> {
        let rest = self.rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (word, rest) = rest.split_at(end);
        self.rest = rest;
        if word.is_empty() {
            return Err(ControlError::MissingArgument {
                command: self.command,
                argument,
            });
        }
        Ok(word)
    }

    fn remainder(&mut self, argument: &'static str) -> Result<&'a str, ControlError> {
        let rest = self.rest.trim();
        self.rest = "";
        if rest.is_empty() {
            return Err(ControlError::MissingArgument {
                command: self.command,
                argument,
            });
        }
        Ok(rest)
    }
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ControlError::Empty);
        }
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let word = word.to_ascii_uppercase();

        let arguments = |command: &'static str| Arguments { command, rest };

        let command = match word.as_str() {
            "SET-GROUPING-CONFIG" => {
                ControlCommand::SetGroupingConfig(arguments("SET-GROUPING-CONFIG").remainder("base64")?.to_string())
            }
            "LIST-GROUPING-CONFIGS" => ControlCommand::ListGroupingConfigs,
            "GET-GROUPING-CONFIG" => {
                ControlCommand::GetGroupingConfig(arguments("GET-GROUPING-CONFIG").remainder("name")?.to_string())
            }
            "CLEAR-GROUPING-CONFIGS" => ControlCommand::ClearGroupingConfigs,
            "GET-ACTIVE-GROUPING" => ControlCommand::GetActiveGrouping,
            "SET-ACTIVE-GROUPING" => {
                ControlCommand::SetActiveGrouping(arguments("SET-ACTIVE-GROUPING").remainder("name")?.to_string())
            }
            "SET-BROKER-CONNECTION" => ControlCommand::SetBrokerConnection(
                arguments("SET-BROKER-CONNECTION").remainder("base64")?.to_string(),
            ),
            "SET-CONSTANTS" => {
                ControlCommand::SetConstants(arguments("SET-CONSTANTS").remainder("base64")?.to_string())
            }
            "SEND-LOCAL-EVENT" => {
                let mut args = arguments("SEND-LOCAL-EVENT");
                ControlCommand::SendLocalEvent {
                    topic: args.next("topic")?.to_string(),
                    event: args.remainder("json")?.to_string(),
                }
            }
            "SEND-EVENT" => {
                let mut args = arguments("SEND-EVENT");
                ControlCommand::SendEvent {
                    url: args.next("url")?.to_string(),
                    topic: args.next("topic")?.to_string(),
                    event: args.remainder("json")?.to_string(),
                }
            }
            "GET-STATS" => ControlCommand::GetStats,
            "CLEAR-STATS" => ControlCommand::ClearStats,
            "CACHE" => ControlCommand::Cache(parse_cache(rest)?),
            "EXIT" => ControlCommand::Exit,
            _ => return Err(ControlError::UnknownCommand(word)),
        };
        Ok(command)
    }
}

fn parse_cache(rest: &str) -> Result<CacheCommand, ControlError> {
    let mut args = Arguments {
        command: "CACHE",
        rest,
    };
    let sub = args.next("LIST|CLEAR|EXCLUDE|INCLUDE")?.to_ascii_uppercase();
    match sub.as_str() {
        "LIST" => Ok(CacheCommand::List),
        "CLEAR" => Ok(CacheCommand::Clear {
            reset: args.rest.trim().eq_ignore_ascii_case("RESET"),
        }),
        "EXCLUDE" => Ok(CacheCommand::Exclude(args.remainder("destination")?.to_string())),
        "INCLUDE" => Ok(CacheCommand::Include(args.remainder("destination")?.to_string())),
        _ => Err(ControlError::UnknownCommand(format!("CACHE {sub}"))),
    }
}
