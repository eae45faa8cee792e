use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scxpak::publish::write_atomic;
use scxpak::{
    collect_sorted, Architecture, CodecConfig, ContainerReader, ContainerWriter, ErrorStats,
    JsonTensorMap, ShardSetReader, ShardSetWriter, DEFAULT_BLOCK_SIZE,
};

/// scxpak CLI: INT4 tensor containers and shard sets.
#[derive(Parser, Debug)]
#[command(author, version, about = "SCXM INT4 tensor container tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Quantize a JSON tensor map into a single SCXM container.
    Pack {
        /// Input JSON object of tensors
        #[arg(short, long)]
        input: PathBuf,
        /// Output container file
        #[arg(short, long)]
        output: PathBuf,
        /// Quantize on the calling thread only
        #[arg(long)]
        serial: bool,
    },
    /// Decode a container back into a JSON tensor map.
    Unpack {
        /// Input container file
        #[arg(short, long)]
        input: PathBuf,
        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,
        /// Optional JSON object of `name -> shape` to restore
        #[arg(long)]
        shapes: Option<PathBuf>,
    },
    /// Print the header and record table of a container.
    Inspect {
        /// Input container file
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Check the checksum and decode every record without writing anything.
    Verify {
        /// Input container file
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Quantize block-wise into a directory of per-layer shards.
    Shard {
        /// Input JSON object of tensors
        #[arg(short, long)]
        input: PathBuf,
        /// Output directory (must not exist)
        #[arg(short, long)]
        output: PathBuf,
        /// Elements per quantization block
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        /// Optional JSON file with model dimensions for the manifest
        #[arg(long)]
        architecture: Option<PathBuf>,
        /// Quantize on the calling thread only
        #[arg(long)]
        serial: bool,
    },
    /// Concatenate a shard set into one blob addressed by its offset index.
    Assemble {
        /// Shard set directory
        #[arg(short, long)]
        input: PathBuf,
        /// Output blob file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Pack {
            input,
            output,
            serial,
        } => pack_cmd(&input, &output, !serial)?,
        Commands::Unpack {
            input,
            output,
            shapes,
        } => unpack_cmd(&input, &output, shapes.as_deref())?,
        Commands::Inspect { input } => inspect_cmd(&input)?,
        Commands::Verify { input } => verify_cmd(&input)?,
        Commands::Shard {
            input,
            output,
            block_size,
            architecture,
            serial,
        } => shard_cmd(&input, &output, block_size, architecture.as_deref(), !serial)?,
        Commands::Assemble { input, output } => assemble_cmd(&input, &output)?,
    }

    Ok(())
}

fn load_tensors(input: &Path) -> Result<(JsonTensorMap, u64)> {
    let input_bytes = fs::metadata(input)
        .with_context(|| format!("Failed to read input JSON: {}", input.display()))?
        .len();
    let map = JsonTensorMap::from_path(input)
        .with_context(|| format!("Failed to load JSON tensor map: {}", input.display()))?;
    Ok((map, input_bytes))
}

fn print_stats(stats: &ErrorStats) {
    if stats.count > 0 {
        println!("Reconstruction error (over {} values):", stats.count);
        println!("  MSE:  {:.6}", stats.mse);
        println!("  MAE:  {:.6}", stats.mae);
        println!("  MAX:  {:.6}", stats.max);
    }
}

fn pack_cmd(input: &Path, output: &Path, parallel: bool) -> Result<()> {
    let (map, input_bytes) = load_tensors(input)?;
    let writer = ContainerWriter::new(CodecConfig { parallel });
    let bytes = writer.write(&map).context("Packing failed")?;
    write_atomic(output, &bytes)
        .with_context(|| format!("Failed to write container: {}", output.display()))?;

    println!("Input JSON size:   {} bytes", input_bytes);
    println!("Container size:    {} bytes", bytes.len());
    if !bytes.is_empty() {
        let ratio = input_bytes as f64 / bytes.len() as f64;
        println!("Compression ratio: {:.2}x (input / container)", ratio);
    }

    let original = collect_sorted(&map)?;
    let restored = ContainerReader::new(&bytes)?.read()?;
    print_stats(&ErrorStats::between(&original, &restored));
    Ok(())
}

fn unpack_cmd(input: &Path, output: &Path, shapes: Option<&Path>) -> Result<()> {
    let bytes = fs::read(input)
        .with_context(|| format!("Failed to read container: {}", input.display()))?;
    let reader = ContainerReader::new(&bytes).context("Invalid container")?;

    let tensors = match shapes {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read shapes: {}", path.display()))?;
            let shapes: BTreeMap<String, Vec<usize>> =
                serde_json::from_str(&json).context("Failed to parse shapes JSON")?;
            reader.read_with_shapes(&shapes)?
        }
        None => reader.read()?,
    };

    let json = serde_json::to_string_pretty(&tensors).context("Failed to serialize tensors")?;
    write_atomic(output, json.as_bytes())
        .with_context(|| format!("Failed to write JSON: {}", output.display()))?;
    println!("Unpacked {} tensors to {}", tensors.len(), output.display());
    Ok(())
}

fn inspect_cmd(input: &Path) -> Result<()> {
    let bytes = fs::read(input)
        .with_context(|| format!("Failed to read container: {}", input.display()))?;
    let reader = ContainerReader::new(&bytes).context("Invalid container")?;
    let header = reader.header();

    println!("Container: {}", input.display());
    println!("  Version: {}", header.version);
    println!("  Records: {}", header.record_count);
    println!("  Bytes:   {}", header.total_bytes);
    println!("  SHA-256: {}", header.checksum);

    for r in reader.records()? {
        println!(
            "    - {}: {} values, {} packed bytes, {} scales",
            r.name,
            r.element_count,
            r.packed.len(),
            r.scales.len()
        );
    }
    Ok(())
}

fn verify_cmd(input: &Path) -> Result<()> {
    let bytes = fs::read(input)
        .with_context(|| format!("Failed to read container: {}", input.display()))?;
    let tensors = ContainerReader::new(&bytes)
        .and_then(|r| r.read())
        .with_context(|| format!("Verification failed: {}", input.display()))?;
    println!("OK: {} tensors, {} bytes", tensors.len(), bytes.len());
    Ok(())
}

fn shard_cmd(
    input: &Path,
    output: &Path,
    block_size: usize,
    architecture: Option<&Path>,
    parallel: bool,
) -> Result<()> {
    let (map, _) = load_tensors(input)?;
    let architecture: Option<Architecture> = match architecture {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read architecture: {}", path.display()))?;
            Some(serde_json::from_str(&json).context("Failed to parse architecture JSON")?)
        }
        None => None,
    };

    let writer = ShardSetWriter::new(block_size, CodecConfig { parallel })?;
    let set = writer
        .write_partitioned(&map, architecture)
        .context("Sharding failed")?;
    set.write_to_dir(output)
        .with_context(|| format!("Failed to publish shard set: {}", output.display()))?;

    println!("Shard set: {}", output.display());
    for (entry, offset) in set.manifest.shards.iter().zip(&set.index.offsets) {
        println!(
            "    - {}: {} tensors, {} bytes at offset {}",
            entry.name,
            entry.tensors.len(),
            entry.bytes,
            offset
        );
    }
    println!("  Total: {} bytes", set.manifest.total_bytes);
    Ok(())
}

fn assemble_cmd(input: &Path, output: &Path) -> Result<()> {
    let reader = ShardSetReader::open(input)
        .with_context(|| format!("Failed to open shard set: {}", input.display()))?;
    let blob = reader.assemble()?;
    write_atomic(output, &blob)
        .with_context(|| format!("Failed to write blob: {}", output.display()))?;
    println!(
        "Assembled {} shards ({} bytes) into {}",
        reader.shard_names().len(),
        blob.len(),
        output.display()
    );
    Ok(())
}
