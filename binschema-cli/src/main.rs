use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use binschema::runtime::bitstream::{BitOrder, ByteOrder};
use binschema::{Generator, Schema};

#[derive(FromArgs, Debug)]
/// Compile binary wire-format schemas into Rust encode/decode modules.
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Generate(Generate),
    Check(Check),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "generate")]
/// Generates the Rust module for a schema file
struct Generate {
    /// path to the schema YAML file
    #[argh(positional)]
    schema_path: PathBuf,

    /// output path for the generated module (stdout when omitted)
    #[argh(option)]
    out: Option<PathBuf>,

    /// runtime path used by the generated `use` items
    #[argh(option)]
    runtime_path: Option<String>,

    /// override the schema's default byte order (big | little)
    #[argh(option)]
    endianness: Option<Endianness>,

    /// override the schema's default bit order (msb | lsb)
    #[argh(option)]
    bit_order: Option<BitOrderArg>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "check")]
/// Parses, validates, and analyzes a schema without generating code
struct Check {
    /// path to the schema YAML file
    #[argh(positional)]
    schema_path: PathBuf,
}

#[derive(Debug, PartialEq, derive_more::FromStr)]
enum Endianness {
    Big,
    Little,
}

#[derive(Debug, PartialEq, derive_more::FromStr)]
enum BitOrderArg {
    Msb,
    Lsb,
}

fn main() -> anyhow::Result<()> {
    let cli: Cli = argh::from_env();
    match cli.command {
        Command::Generate(args) => generate(args),
        Command::Check(args) => check(args),
    }
}

fn generate(args: Generate) -> anyhow::Result<()> {
    let mut schema = Schema::load_from_file(&args.schema_path)
        .with_context(|| format!("loading schema {}", args.schema_path.display()))?;

    if let Some(endianness) = args.endianness {
        schema.config.endianness = match endianness {
            Endianness::Big => ByteOrder::Big,
            Endianness::Little => ByteOrder::Little,
        };
    }
    if let Some(bit_order) = args.bit_order {
        schema.config.bit_order = match bit_order {
            BitOrderArg::Msb => BitOrder::MsbFirst,
            BitOrderArg::Lsb => BitOrder::LsbFirst,
        };
    }

    let mut generator = Generator::new(&schema).context("analyzing schema")?;
    if let Some(runtime_path) = args.runtime_path {
        generator = generator.with_runtime_path(runtime_path);
    }
    let source = generator.generate().context("generating code")?;

    match args.out {
        Some(path) => {
            std::fs::write(&path, source)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{source}"),
    }
    Ok(())
}

fn check(args: Check) -> anyhow::Result<()> {
    let schema = Schema::load_from_file(&args.schema_path)
        .with_context(|| format!("loading schema {}", args.schema_path.display()))?;
    let generator = Generator::new(&schema).context("analyzing schema")?;

    for (name, facts) in &generator.facts().types {
        let mut notes = Vec::new();
        if facts.split_views {
            notes.push("input/output split".to_string());
        }
        if facts.needs_encode_context {
            notes.push("encode context".to_string());
        }
        if facts.needs_decode_context {
            notes.push(format!(
                "decode context [{}]",
                facts.decode_context_fields.join(", ")
            ));
        }
        if facts.contains_back_reference {
            notes.push("compression dictionary".to_string());
        }
        for (array, types) in &facts.tracked_arrays {
            notes.push(format!("position pre-pass on '{array}' ({})", types.join(", ")));
        }
        if notes.is_empty() {
            println!("{name}: plain");
        } else {
            println!("{name}: {}", notes.join("; "));
        }
    }
    Ok(())
}
