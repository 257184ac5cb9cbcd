//! hfsread-tool — inspect HFS+ / HFSX volumes
//!
//! # Usage
//!
//! ```text
//! hfsread-tool <device>                      Volume header, flags, journal
//! hfsread-tool <device> ls [path]            List directory contents
//! hfsread-tool <device> stat <cnid|path>     Record metadata
//! hfsread-tool <device> read <cnid|path>     File bytes (or listing) to stdout
//! hfsread-tool <device> xattr <path>         Extended attributes
//! ```
//!
//! `RUST_LOG=debug` surfaces the library's diagnostics, including the
//! dirty-volume warning.

mod style;

use std::env;
use std::io::{self, Write};
use std::process;

use hfsread::{CatalogRecord, EntryKind, ForkKind, ResolvedPath, Volume};

use style::*;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || matches!(args[1].as_str(), "-h" | "--help" | "help") {
        print_usage();
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let device = &args[1];
    let result = match args.get(2).map(String::as_str) {
        None | Some("info") => info(device),
        Some("ls") => ls(device, args.get(3).map(String::as_str).unwrap_or("/")),
        Some("stat") => stat(device, required_arg(&args, 3, "stat <cnid|path>")),
        Some("read") => read(device, required_arg(&args, 3, "read <cnid|path>")),
        Some("xattr") => xattr(device, required_arg(&args, 3, "xattr <path>")),
        Some(other) => {
            eprintln!("{RED}Unknown command: {other}{RESET}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}hfsread-tool{RESET} — HFS+ / HFSX volume inspector

{BOLD}USAGE:{RESET}
    hfsread-tool <device> [COMMAND] [ARG]

{BOLD}COMMANDS:{RESET}
    {GREEN}info{RESET}                     Volume header, flags, journal (default)
    {GREEN}ls{RESET}     [path]            List directory contents
    {GREEN}stat{RESET}   <cnid|path>       Record metadata (CNID, perms, dates, forks)
    {GREEN}read{RESET}   <cnid|path>       File bytes (or directory listing) to stdout
    {GREEN}xattr{RESET}  <path>            Extended attributes

{BOLD}EXAMPLES:{RESET}
    hfsread-tool backup.img
    hfsread-tool backup.img ls /Backups.backupdb
    hfsread-tool /dev/disk2s1 stat 16
    hfsread-tool backup.img read /notes.txt > notes.txt
"#
    );
}

fn required_arg<'a>(args: &'a [String], index: usize, usage: &str) -> &'a str {
    match args.get(index) {
        Some(arg) => arg,
        None => {
            eprintln!("Usage: hfsread-tool <device> {usage}");
            process::exit(1);
        }
    }
}

/// `stat`/`read` targets: a bare CNID or a path.
fn resolve_target(vol: &Volume, target: &str) -> hfsread::Result<ResolvedPath> {
    if let Ok(cnid) = target.parse::<u32>() {
        return vol.find_by_cnid(cnid);
    }
    vol.lookup(target)
}

fn info(device: &str) -> Result<(), Box<dyn std::error::Error>> {
    let vol = Volume::open(device)?;
    let vh = vol.header();

    header(&format!("HFS+ Volume: {device}"));

    section("Volume Header");
    let signature = if vh.is_hfsx() {
        format!("HFSX {DIM}(case-sensitive){RESET}")
    } else {
        format!("HFS+ {DIM}(case-insensitive){RESET}")
    };
    kv("Name", vol.name()?);
    kv("Signature", &signature);
    kv("Version", &vh.version.to_string());
    kv("Block size", &format!("{} bytes", vh.block_size));
    kv("Total blocks", &format_commas(vh.total_blocks as u64));
    kv("Free blocks", &format_commas(vh.free_blocks as u64));
    kv_highlight("Files", &format_commas(vh.file_count as u64));
    kv_highlight("Folders", &format_commas(vh.folder_count as u64));
    kv("Next CNID", &vh.next_catalog_id.to_string());

    section("State");
    kv("Journaled", if vol.is_journaled() { "yes" } else { "no" });
    let dirty = if vol.is_dirty() {
        format!("{RED}dirty (not cleanly unmounted){RESET}")
    } else {
        format!("{GREEN}clean{RESET}")
    };
    kv("Consistency", &dirty);
    if let Some(journal) = vol.journal_info()? {
        kv(
            "Journal",
            &format!(
                "at +{} ({})",
                journal.journal_offset,
                format_size(journal.journal_size)
            ),
        );
    }
    println!();

    Ok(())
}

fn ls(device: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let vol = Volume::open(device)?;
    let resolved = vol.lookup(path)?;
    let cnid = match &resolved.record {
        CatalogRecord::Folder(f) => f.cnid,
        _ => return Err(format!("not a directory: {path}").into()),
    };

    let entries = vol.read_dir(cnid)?;

    header(&format!("{device}:{path}"));
    println!();
    println!("  {DIM}{:<5} {:>10} {:>12}  {}{RESET}", "Kind", "CNID", "Size", "Name");
    println!("  {DIM}{}{RESET}", "-".repeat(56));

    for entry in &entries {
        let color = kind_color(entry.kind);
        let icon = kind_icon(entry.kind);
        let size = if entry.kind == EntryKind::File {
            format_size(entry.size)
        } else {
            "-".to_string()
        };
        println!(
            "  {DIM}{icon}{RESET}   {:>10} {:>12}  {color}{}{RESET}",
            entry.cnid, size, entry.name
        );
    }

    println!();
    let files = entries.iter().filter(|e| e.kind == EntryKind::File).count();
    let dirs = entries.iter().filter(|e| e.kind == EntryKind::Directory).count();
    println!("  {DIM}{files} file(s), {dirs} directory(ies){RESET}");
    println!();

    Ok(())
}

fn stat(device: &str, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let vol = Volume::open(device)?;
    let resolved = resolve_target(&vol, target)?;
    let st = vol.stat(&resolved.record, resolved.fork)?;

    header(&format!("stat: {target}"));

    section("Record");
    kv("CNID", &st.cnid.to_string());
    kv("Path", &vol.path_of(st.cnid)?);
    kv("Mode", &mode_string(st.mode));
    kv("Owner", &format!("{}:{}", st.uid, st.gid));
    kv("Links", &st.nlink.to_string());
    kv("Size", &format!("{} ({})", format_size(st.size), format_commas(st.size)));
    kv("Blocks (512B)", &st.blocks.to_string());
    if st.rdev != 0 {
        kv("Device", &format!("{:#010x}", st.rdev));
    }
    if st.bsd_flags != 0 {
        kv("BSD flags", &format!("{:#06x}", st.bsd_flags));
    }

    section("Times (POSIX)");
    kv("Born", &st.birthtime.to_string());
    kv("Modified", &st.mtime.to_string());
    kv("Changed", &st.ctime.to_string());
    kv("Accessed", &st.atime.to_string());

    if let CatalogRecord::File(f) = &resolved.record {
        section("Forks");
        kv("Data fork", &format_size(f.data_fork.logical_size));
        if f.rsrc_fork.logical_size > 0 {
            kv("Resource fork", &format_size(f.rsrc_fork.logical_size));
        }
        let extents = vol.extents(f.cnid, ForkKind::Data, &f.data_fork)?;
        kv("Data extents", &extents.len().to_string());
    }
    println!();

    Ok(())
}

fn read(device: &str, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let vol = Volume::open(device)?;
    let resolved = resolve_target(&vol, target)?;

    match &resolved.record {
        CatalogRecord::File(f) => {
            let mut stdout = io::stdout().lock();
            vol.read_to(f, resolved.fork, &mut stdout)?;
            stdout.flush()?;
        }
        CatalogRecord::Folder(f) => {
            let mut stdout = io::stdout().lock();
            for entry in vol.read_dir(f.cnid)? {
                writeln!(stdout, "{}", entry.name)?;
            }
        }
        _ => return Err("target is not a file or directory".into()),
    }

    Ok(())
}

fn xattr(device: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let vol = Volume::open(device)?;
    let resolved = vol.lookup(path)?;

    header(&format!("xattr: {path}"));
    println!();

    for name in vol.listxattr(&resolved.record)? {
        let value = vol.getxattr(&resolved.record, &name)?;
        println!("  {BOLD}{name}{RESET} {DIM}({} bytes){RESET}", value.len());
        for chunk in value.chunks(16).take(4) {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("    {DIM}{}{RESET}", hex.join(" "));
        }
        if value.len() > 64 {
            println!("    {DIM}...{RESET}");
        }
    }
    println!();

    Ok(())
}
