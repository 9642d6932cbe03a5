//! Parser for process lifecycle scripts.
//!
//! One command per line. `#` starts a comment; numbers are decimal or `0x` hexadecimal.

use std::fmt;

use vmm::{Permissions, VirtualAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a process with an empty address space and make it current.
    Spawn(String),
    /// Define a region in the current address space.
    Region {
        vaddr: VirtualAddress,
        size: usize,
        permissions: Permissions,
    },
    Prepare,
    Complete,
    Stack,
    /// Load a byte through the MMU.
    Read(VirtualAddress),
    /// Store a byte through the MMU.
    Write(VirtualAddress, u8),
    /// Copy the current process into a new one.
    Fork(String),
    Switch(String),
    /// Destroy the named process, or the current one.
    Exit(Option<String>),
    Stats,
}

/// A command and the line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parses a whole script.
pub fn parse(source: &str) -> Result<Vec<Line>, ParseError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index + 1;
        let text = text.split('#').next().unwrap_or_default();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let command = parse_command(&words).map_err(|message| ParseError {
            line: number,
            message,
        })?;
        lines.push(Line { number, command });
    }
    Ok(lines)
}

fn parse_command(words: &[&str]) -> Result<Command, String> {
    let (name, args) = (words[0], &words[1..]);
    let command = match (name, args) {
        ("spawn", [process]) => Command::Spawn(process.to_string()),
        ("region", [vaddr, size, permissions]) => Command::Region {
            vaddr: parse_address(vaddr)?,
            size: parse_number(size)?,
            permissions: parse_permissions(permissions)?,
        },
        ("prepare", []) => Command::Prepare,
        ("complete", []) => Command::Complete,
        ("stack", []) => Command::Stack,
        ("read", [vaddr]) => Command::Read(parse_address(vaddr)?),
        ("write", [vaddr, byte]) => {
            let value = parse_number(byte)?;
            let byte = u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", byte))?;
            Command::Write(parse_address(vaddr)?, byte)
        }
        ("fork", [process]) => Command::Fork(process.to_string()),
        ("switch", [process]) => Command::Switch(process.to_string()),
        ("exit", []) => Command::Exit(None),
        ("exit", [process]) => Command::Exit(Some(process.to_string())),
        ("stats", []) => Command::Stats,
        (
            "spawn" | "region" | "prepare" | "complete" | "stack" | "read" | "write" | "fork"
            | "switch" | "exit" | "stats",
            _,
        ) => return Err(format!("wrong number of arguments to `{}`", name)),
        _ => return Err(format!("unknown command `{}`", name)),
    };
    Ok(command)
}

fn parse_number(word: &str) -> Result<usize, String> {
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => word.replace('_', "").parse(),
    };
    parsed.map_err(|_| format!("invalid number `{}`", word))
}

fn parse_address(word: &str) -> Result<VirtualAddress, String> {
    let value = parse_number(word)?;
    if value > u32::MAX as usize {
        return Err(format!("address `{}` is wider than 32 bits", word));
    }
    Ok(VirtualAddress::new(value))
}

fn parse_permissions(word: &str) -> Result<Permissions, String> {
    match word.as_bytes() {
        [r @ (b'r' | b'-'), w @ (b'w' | b'-'), x @ (b'x' | b'-')] => {
            Ok(Permissions::from_rwx(*r == b'r', *w == b'w', *x == b'x'))
        }
        _ => Err(format!("invalid permissions `{}`, expected e.g. `r-x`", word)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        let source = "\
            spawn init\n\
            region 0x400000 8192 r-x\n\
            prepare\n\
            complete\n\
            stack\n\
            read 0x400010\n\
            write 0x1000_0000 0xff\n\
            fork child\n\
            switch child\n\
            exit\n\
            exit init\n\
            stats\n";
        let commands: Vec<_> = parse(source).unwrap().into_iter().map(|line| line.command).collect();

        assert_eq!(
            commands,
            [
                Command::Spawn("init".into()),
                Command::Region {
                    vaddr: VirtualAddress::new(0x40_0000),
                    size: 8192,
                    permissions: Permissions::READ | Permissions::EXECUTE,
                },
                Command::Prepare,
                Command::Complete,
                Command::Stack,
                Command::Read(VirtualAddress::new(0x40_0010)),
                Command::Write(VirtualAddress::new(0x1000_0000), 0xff),
                Command::Fork("child".into()),
                Command::Switch("child".into()),
                Command::Exit(None),
                Command::Exit(Some("init".into())),
                Command::Stats,
            ]
        );
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let lines = parse("# header\n\n   \nspawn a # trailing\n").unwrap();
        assert_eq!(
            lines,
            [Line {
                number: 4,
                command: Command::Spawn("a".into())
            }]
        );
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse("spawn a\nstats\nregion 0x1000 10 rwz\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("invalid permissions"));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("jump 0x1000").unwrap_err().message.contains("unknown command"));
        assert!(parse("read").unwrap_err().message.contains("wrong number"));
        assert!(parse("write 0x1000 256").unwrap_err().message.contains("byte"));
        assert!(parse("read 0x1_0000_0000").unwrap_err().message.contains("32 bits"));
        assert!(parse("read zero").unwrap_err().message.contains("invalid number"));
    }
}
