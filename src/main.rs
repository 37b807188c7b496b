use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use pcode_bridge::format::OutputFormat;
use pcode_bridge::image::{MemoryImage, SegmentedImage};
use pcode_bridge::sweep::linear_sweep;
use pcode_bridge::{ByteSource, DecodeEngine, DocumentStorage};

#[derive(Parser, Debug)]
#[command(author, version, about = "Decode machine code through a processor specification")]
struct Opts {
    /// Processor specification document
    #[arg(short, long)]
    spec: PathBuf,
    /// Image to decode (ELF or PE unless --raw is given)
    input: PathBuf,
    /// Treat the input as a flat image loaded at --base
    #[arg(long)]
    raw: bool,
    /// Load address of a raw image
    #[arg(long, default_value = "0", value_parser = parse_num)]
    base: u64,
    /// First address to decode (defaults to the first executable section)
    #[arg(long, value_parser = parse_num)]
    start: Option<u64>,
    /// Maximum number of listing entries
    #[arg(short = 'n', long, default_value_t = 32)]
    count: usize,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Also emit micro-operations for every instruction
    #[arg(long)]
    pcode: bool,
    /// Override a context default, e.g. --context wide=1
    #[arg(long = "context", value_parser = parse_assignment)]
    context: Vec<(String, u32)>,
}

fn parse_num(s: &str) -> Result<u64, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => t.parse::<u64>(),
    };
    parsed.map_err(|e| format!("bad number '{}': {}", s, e))
}

fn parse_assignment(s: &str) -> Result<(String, u32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    let value = parse_num(value)?;
    let value = u32::try_from(value).map_err(|_| format!("context value too large: {}", value))?;
    Ok((name.trim().to_string(), value))
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let text = fs::read_to_string(&opts.spec)
        .with_context(|| format!("reading specification {}", opts.spec.display()))?;
    let storage = DocumentStorage::from_text(&text)?;

    let (source, default_start): (Box<dyn ByteSource>, u64) = if opts.raw {
        let image = MemoryImage::from_file(&opts.input, opts.base)?;
        (Box::new(image), opts.base)
    } else {
        let image = SegmentedImage::from_file(&opts.input)?;
        let start = image
            .executable_segments()
            .next()
            .map(|s| s.address)
            .or(image.entry())
            .ok_or_else(|| anyhow!("{} has no executable section", opts.input.display()))?;
        (Box::new(image), start)
    };

    let mut engine = DecodeEngine::new(source, &storage)?;
    for (name, value) in &opts.context {
        engine.context_mut().set_default(name, *value)?;
    }

    let listing = linear_sweep(&mut engine, opts.start.unwrap_or(default_start), opts.count, opts.pcode);
    let formatter = opts.format.get_formatter();
    print!("{}", formatter.format(&listing)?);

    Ok(())
}
