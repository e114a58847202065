//! Command-line front end over the batch engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::env::DirEnv;
use crate::filer;
use crate::format::{open_soundfile, OpenRequest};
use crate::table::{Table, TableSet};

/// Soundfile reader/writer for uncompressed PCM containers
#[derive(Parser, Debug)]
#[command(name = "sndfiler")]
#[command(version)]
#[command(about = "Read, write and inspect WAVE/AIFF/CAF/NeXT soundfiles", long_about = None)]
pub struct Cli {
    /// Directory filenames are resolved against
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub dir: String,

    /// Sample rate assumed for raw input and unflagged output
    #[arg(short, long, value_name = "HZ", default_value_t = 44100.0)]
    pub rate: f64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the registered formats in detection order
    List,
    /// Print the info tuple of a soundfile
    Info {
        /// File to inspect
        file: String,
    },
    /// Run a `read` command; tables are created on demand
    ///
    /// Tokens are the message-surface flags, e.g.
    /// `read -- -skip 100 -resize take.wav left right`
    Read {
        /// Flags, filename and table names
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },
    /// Copy a soundfile through the batch engine, re-encoding it
    Convert {
        /// Source file
        input: String,
        /// Write-command tokens: flags, then the output filename, e.g.
        /// `-bytes 3 -big out.aif`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let env = DirEnv::new(&cli.dir).with_sample_rate(cli.rate);
    match cli.command {
        Command::List => {
            for name in filer::list() {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Info { file } => {
            let path = std::path::Path::new(&cli.dir).join(&file);
            let mut sf = open_soundfile(&path, &OpenRequest::default())
                .with_context(|| format!("can't open {}", file))?;
            let info = sf.info();
            println!(
                "{} {} {} {} {}",
                info.sample_rate, info.header_size, info.channels, info.bytes_per_sample,
                info.endian
            );
            println!("{} frames", sf.frames_left());
            sf.close();
            Ok(())
        }
        Command::Read { tokens } => {
            let mut tables = tables_for(&tokens);
            let outcome = filer::read(&env, &mut tables, &tokens)
                .map_err(|err| anyhow::anyhow!("{}", err))?;
            println!("{} frames", outcome.frames);
            if let Some(info) = outcome.info {
                println!(
                    "{} {} {} {} {}",
                    info.sample_rate, info.header_size, info.channels, info.bytes_per_sample,
                    info.endian
                );
            }
            for (key, value) in outcome.metadata {
                println!("{}: {}", key, value);
            }
            Ok(())
        }
        Command::Convert { input, tokens } => {
            // pull the whole file into as many tables as it has channels
            let path = std::path::Path::new(&cli.dir).join(&input);
            let mut sf = open_soundfile(&path, &OpenRequest::default())
                .with_context(|| format!("can't open {}", input))?;
            let channels = sf.channels;
            sf.close();

            let mut tables = TableSet::new();
            let mut read_tokens = vec!["-resize".to_string(), input.clone()];
            for ch in 0..channels {
                let name = format!("ch{}", ch);
                tables.insert(Table::new(&name, 0));
                read_tokens.push(name);
            }
            let read = filer::read(&env, &mut tables, &read_tokens)
                .map_err(|err| anyhow::anyhow!("{}", err))?;

            let mut write_tokens = tokens;
            for ch in 0..channels {
                write_tokens.push(format!("ch{}", ch));
            }
            let written = filer::write(&env, &mut tables, &write_tokens)
                .map_err(|err| anyhow::anyhow!("{}", err))?;
            println!("{} frames in, {} frames out", read.frames, written.frames);
            Ok(())
        }
    }
}

/// Tables named after the trailing non-flag tokens of a read command,
/// sized zero so the read resizes them.
fn tables_for(tokens: &[String]) -> TableSet {
    let mut tables = TableSet::new();
    let mut rest = tokens.as_ref();
    // skip flags the same way the parser will
    while let Some(token) = rest.first() {
        if let Some(flag) = token.strip_prefix('-') {
            let consumed = match flag {
                "skip" | "maxsize" => 2,
                "raw" => 5,
                "-" => {
                    rest = &rest[1..];
                    break;
                }
                _ => 1,
            };
            rest = &rest[consumed.min(rest.len())..];
        } else {
            break;
        }
    }
    for name in rest.iter().skip(1) {
        tables.insert(Table::new(name, 0));
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_for_skips_flags() {
        let tokens: Vec<String> = ["-skip", "10", "-resize", "file.wav", "a", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let tables = tables_for(&tokens);
        assert!(tables.get("a").is_some());
        assert!(tables.get("b").is_some());
        assert!(tables.get("file.wav").is_none());
    }

    #[test]
    fn test_tables_for_raw_flag() {
        let tokens: Vec<String> = ["-raw", "0", "1", "2", "l", "data.bin", "t"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let tables = tables_for(&tokens);
        assert!(tables.get("t").is_some());
        assert!(tables.get("data.bin").is_none());
    }
}
