use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pffkit::config::{CachePolicy, IndexMode, OpenOptions};
use pffkit::container::Container;
use pffkit::integrity::{self, IntegrityQuality};
use pffkit::item::Item;
use pffkit::record::names::{PropertyName, FIRST_NAMED_ID};
use pffkit::record::tags;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pffinfo", about = "Inspect PST/OST/PAB containers")]
struct Cli {
    /// Codepage for 8-bit strings that do not name one
    #[arg(long, global = true)]
    codepage: Option<u16>,
    /// Load the whole descriptors table at open
    #[arg(long, global = true)]
    eager_index: bool,
    /// Keep up to this many decoded blocks in memory
    #[arg(long, global = true)]
    cache_entries: Option<usize>,
    /// JSON file with open options; flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// -v for debug logging, -vv for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header and table metadata
    Info {
        input: PathBuf,
    },
    /// Print the folder/message/attachment tree
    Tree {
        input: PathBuf,
        #[arg(short, long)]
        depth: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Dump the properties of one descriptor (hex with 0x, or decimal)
    Props {
        input: PathBuf,
        descriptor: String,
        #[arg(long)]
        json: bool,
    },
    /// Check every block and descriptor
    Verify {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = open_options(&cli)?;

    match cli.command {
        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let pst = Container::open(&input, options)?;
            let header = pst.header();
            println!("File:             {}", input.display());
            println!("Content type:     {:?}", header.content_type);
            println!("Format:           {:?} (data version {})", header.variant, header.data_version);
            println!("Encryption:       {:?}", header.encryption);
            println!("Size:             {} bytes", pst.size());
            println!("Blocks:           {}", pst.allocation().len());
            println!("Offsets pages:    {}", pst.allocation().page_count());
            println!("Descriptors root: {}", header.descriptors_root);
            println!("Offsets root:     {}", header.offsets_root);
            if let Some(line) = store_name_line(&pst) {
                println!("Store name:       {line}");
            }
            let root = pst.open_root()?;
            println!("Root children:    {}", root.children().count());
            let stats = pst.cache_stats();
            println!("Cache:            {} hits / {} misses", stats.hits, stats.misses);
            pst.close()?;
        }

        // ── Tree ─────────────────────────────────────────────────────────────
        Commands::Tree { input, depth, json } => {
            let limit = depth.unwrap_or(usize::MAX);
            let tree = Container::with_open(&input, options, |pst| {
                let root = pst.open_root()?;
                if json {
                    return Ok(Some(tree_json(&root, limit)));
                }
                print_tree(&root, 0, limit);
                Ok(None)
            })?;
            if let Some(tree) = tree {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            }
        }

        // ── Props ────────────────────────────────────────────────────────────
        Commands::Props { input, descriptor, json } => {
            let id = parse_id(&descriptor)?;
            let pst = Container::open(&input, options)?;
            let item = pst.item(id)?;
            let props = item.properties()?;
            if json {
                println!("{}", serde_json::to_string_pretty(props)?);
            } else {
                println!("Descriptor {id:#x} ({:?})", item.item_type()?);
                for record in props.iter() {
                    let name = property_label(&pst, record.tag.id);
                    println!("  {}  {:<24} {}", record.tag, name, record.value);
                }
                for issue in props.issues() {
                    println!("  {}  {:<24} <{:?}: {}>", issue.tag, "", issue.kind, issue.message);
                }
            }
            drop(item);
            pst.close()?;
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, json } => {
            let pst = Container::open(&input, options.verify_checksums(false))?;
            let report = integrity::scan::<fn(u64, u64)>(&pst, None);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
                for block in &report.block_log {
                    println!("  block {:#x} @ {:#x}: {:?}", block.id, block.offset, block.health);
                }
                for issue in &report.descriptor_issues {
                    println!("  descriptor {:#x}: {:?}", issue.id, issue.problem);
                }
                if let Some(e) = &report.walk_error {
                    println!("  descriptor walk stopped: {e}");
                }
            }
            if report.quality != IntegrityQuality::Intact {
                return Err(format!("container is {:?}", report.quality).into());
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_options(cli: &Cli) -> Result<OpenOptions, Box<dyn std::error::Error>> {
    let mut options = match &cli.config {
        Some(path) => OpenOptions::from_json_file(path)?,
        None => OpenOptions::default(),
    };
    if let Some(cp) = cli.codepage {
        options = options.ascii_codepage(cp);
    }
    if cli.eager_index {
        options = options.index_mode(IndexMode::Eager);
    }
    if let Some(n) = cli.cache_entries {
        options = options.cache(CachePolicy::MaxEntries(n));
    }
    Ok(options)
}

fn parse_id(text: &str) -> Result<u32, Box<dyn std::error::Error>> {
    Ok(match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => text.parse()?,
    })
}

/// Store display name for `info`. A damaged store record is reported in
/// place so the rest of the summary still prints.
fn store_name_line(pst: &Container) -> Option<String> {
    let store = pst.message_store().ok()?;
    match store.display_name() {
        Ok(name) => name,
        Err(e) => Some(format!("<error: {e}>")),
    }
}

/// Display name of a property id; named ids go through the container's map.
fn property_label(pst: &Container, id: u16) -> String {
    if id < FIRST_NAMED_ID {
        return tags::name(id).unwrap_or("").to_owned();
    }
    match pst.named_property(id) {
        Ok(Some(named)) => match &named.name {
            PropertyName::Numeric(n) => format!("{{{}}}:{n:#x}", named.guid),
            PropertyName::String(s) => format!("{{{}}}:{s}", named.guid),
        },
        Ok(None) => String::new(),
        Err(e) => format!("<error: {e}>"),
    }
}

fn label(item: &Item<'_>) -> String {
    let name = item
        .display_name()
        .ok()
        .flatten()
        .or_else(|| item.subject().ok().flatten())
        .or_else(|| item.filename().ok().flatten())
        .unwrap_or_default();
    let kind = item.item_type().map(|t| format!("{t:?}")).unwrap_or_else(|_| "?".into());
    format!("{:#x} [{kind}] {name}", item.id())
}

fn print_tree(item: &Item<'_>, level: usize, limit: usize) {
    println!("{}{}", "  ".repeat(level), label(item));
    if level >= limit {
        return;
    }
    for child in item.children() {
        match child {
            Ok(child) => print_tree(&child, level + 1, limit),
            Err(e) => println!("{}<error: {e}>", "  ".repeat(level + 1)),
        }
    }
}

fn tree_json(item: &Item<'_>, limit: usize) -> Value {
    let children: Vec<Value> = if limit == 0 {
        Vec::new()
    } else {
        item.children()
            .map(|child| match child {
                Ok(child) => tree_json(&child, limit - 1),
                Err(e) => json!({ "error": e.to_string(), "kind": e.kind() }),
            })
            .collect()
    };
    json!({
        "id":       item.id(),
        "origin":   item.origin(),
        "type":     item.item_type().ok(),
        "name":     item.display_name().ok().flatten().or_else(|| item.subject().ok().flatten()),
        "children": children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pffkit::header::FormatVariant;
    use pffkit::index::NID_MESSAGE_STORE;
    use pffkit::record::names::PS_PUBLIC_STRINGS;
    use pffkit::record::{PropertyRecord, PropertyValue};
    use pffkit::writer::{BuildOptions, ContainerBuilder};

    fn with_store() -> (Vec<u8>, u64) {
        let mut builder = ContainerBuilder::new(BuildOptions::new(FormatVariant::Unicode));
        builder.add_message_store(vec![PropertyRecord::new(
            tags::DISPLAY_NAME,
            PropertyValue::Unicode("Personal Folders".into()),
        )]);
        let built = builder.build().unwrap();
        let data_id = built.descriptor(NID_MESSAGE_STORE).unwrap().data_id;
        let offset = built.block(data_id).unwrap().offset;
        (built.bytes, offset)
    }

    #[test]
    fn store_name_is_printed() {
        let (bytes, _) = with_store();
        let pst = Container::open_bytes(bytes, OpenOptions::default()).unwrap();
        assert_eq!(store_name_line(&pst).as_deref(), Some("Personal Folders"));
    }

    #[test]
    fn named_property_labels() {
        let mut builder = ContainerBuilder::new(BuildOptions::new(FormatVariant::Unicode));
        builder.add_name_to_id_map(&[(PS_PUBLIC_STRINGS, PropertyName::String("Keywords".into()))]);
        let pst = Container::open_bytes(builder.build().unwrap().bytes, OpenOptions::default()).unwrap();
        assert_eq!(property_label(&pst, tags::SUBJECT), "Subject");
        assert_eq!(property_label(&pst, 0x8000), "{00020329-0000-0000-c000-000000000046}:Keywords");
        assert_eq!(property_label(&pst, 0x8001), "");
    }

    #[test]
    fn damaged_store_name_is_reported_in_place() {
        let (mut bytes, offset) = with_store();
        bytes[offset as usize + 4] ^= 0xA5;
        let pst = Container::open_bytes(bytes, OpenOptions::default()).unwrap();
        let line = store_name_line(&pst).unwrap();
        assert!(line.starts_with("<error: "), "{line}");
        assert!(pst.open_root().is_ok());
    }
}
