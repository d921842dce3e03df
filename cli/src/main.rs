use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{Block, BlockGraph, ImageDisk, Registry, ScanOptions, Uid, Vfs, VfsState};
use strata_decoders::register_builtin_plugins;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Discover partitions, volumes and filesystems inside disk images", long_about = None)]
struct Cli {
    /// Log decoding details
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Upper bound on decode passes
    #[arg(long, global = true)]
    max_passes: Option<usize>,

    /// Let a panicking plugin abort the scan
    #[arg(long, global = true)]
    no_catch_panics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan images and print the block tree
    Scan {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List mounted filesystems and their root directories
    Roots {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Scan images and write the resulting state as JSON
    Save {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Load a saved state without decoding and print the block tree
    Show { state: PathBuf },
    /// List registered decoders and filesystem types
    Plugins,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut registry = Registry::new();
    register_builtin_plugins(&mut registry);
    let registry = Arc::new(registry);

    let mut options = ScanOptions::default();
    if let Some(max_passes) = cli.max_passes {
        options.max_passes = max_passes;
    }
    options.catch_panics = !cli.no_catch_panics;

    match cli.command {
        Commands::Scan { images } => {
            let vfs = open_images(&images, registry, options)?;
            let graph = vfs.blocks()?;
            print_tree(&graph);
            print_summary(&graph);
        }
        Commands::Roots { images } => {
            let vfs = open_images(&images, registry, options)?;
            let roots = vfs.root_entries()?;
            if roots.is_empty() {
                println!("No filesystems found.");
            }
            for root in roots.iter() {
                let fs = root.filesystem();
                let info = fs.info();
                println!("{}: {} (block {})", root.name(), info.filesystem_type, root.block_uid());
                if let Some(label) = &info.volume_label {
                    println!("  Label: {}", label);
                }
                if let Some(serial) = &info.volume_serial {
                    println!("  Serial: {}", serial);
                }
                println!("  Size: {}", format_size(info.total_bytes));
                match fs.root_directory() {
                    Ok(entries) => {
                        for entry in entries {
                            if entry.is_directory {
                                println!("    {}/", entry.name);
                            } else {
                                println!("    {:<16} {:>12}", entry.name, entry.size);
                            }
                        }
                    }
                    Err(e) => println!("    (root directory unavailable: {})", e),
                }
                println!();
            }
        }
        Commands::Save { images, output } => {
            let vfs = open_images(&images, registry, options)?;
            let state = vfs.state()?;
            state
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved {} blocks to {}", state.blocks.len(), output.display());
        }
        Commands::Show { state } => {
            let loaded = VfsState::load(&state)
                .with_context(|| format!("failed to load {}", state.display()))?;
            let vfs = Vfs::from_state_with_options(&loaded, registry, options)?;
            let graph = vfs.blocks()?;
            print_tree(&graph);
            print_summary(&graph);
        }
        Commands::Plugins => {
            println!("Decoders (in order):");
            for name in registry.decoder_names() {
                println!("  {}", name);
            }
            println!("\nFilesystem types:");
            for implementation in registry.filesystem_types() {
                println!("  {}", implementation);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "strata=debug" } else { "strata=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_images(images: &[PathBuf], registry: Arc<Registry>, options: ScanOptions) -> anyhow::Result<Vfs> {
    let vfs = Vfs::with_options(registry, options);
    for path in images {
        let disk = ImageDisk::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let index = vfs.add_disk(Arc::new(disk))?;
        debug!(index, path = %path.display(), "Image added");
    }
    Ok(vfs)
}

fn print_tree(graph: &BlockGraph) {
    for root in graph.roots() {
        print_block(graph, root, 0);
    }
}

/// Blocks with several parents are printed under their first one
fn print_block(graph: &BlockGraph, block: &Block, depth: usize) {
    let mut flags = Vec::new();
    if !block.is_available() {
        flags.push("unavailable");
    }
    if !block.is_complete() {
        flags.push("incomplete");
    }
    if !block.is_handled() {
        flags.push("unknown");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };

    let attributes: Vec<String> = block
        .attributes()
        .iter()
        .filter(|(key, _)| key.starts_with("fs.") || key.starts_with("partition.type_name") || *key == "path")
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    println!(
        "{}#{} {} {}{}  {}",
        "  ".repeat(depth),
        block.uid(),
        block.block_type(),
        format_size(block.size()),
        flags,
        attributes.join(" ")
    );

    for &child in block.children() {
        if let Some(child_block) = graph.get(child) {
            if child_block.parents().first() == Some(&block.uid()) {
                print_block(graph, child_block, depth + 1);
            }
        }
    }
}

fn print_summary(graph: &BlockGraph) {
    let filesystems = graph.by_type("filesystem").count();
    let unknown: Vec<Uid> = graph.unhandled().map(|b| b.uid()).collect();
    println!(
        "\n{} blocks, {} filesystems, {} passes",
        graph.len(),
        filesystems,
        graph.passes()
    );
    if !unknown.is_empty() {
        println!("Unrecognised blocks: {:?}", unknown);
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
