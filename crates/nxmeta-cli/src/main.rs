use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use nxmeta_contracts::{NXMETA_BUILD_REPORT_SCHEMA_VERSION, NXMETA_EXTRACT_REPORT_SCHEMA_VERSION};
use nxmeta_core::config::{read_document, Doc};
use nxmeta_core::layout::SegmentLayout;
use nxmeta_core::pfs0::{read_dir_entries, write_entries};
use nxmeta_core::util::{sha256_hex, write_output};
use nxmeta_core::{
    build_kip, build_npdm, build_pfs0, parse_pfs0, KipConfig, KipOptions, NpdmConfig,
    SegmentSource,
};

#[derive(Parser, Debug)]
#[command(name = "nxmeta")]
#[command(about = "Builds KIP1 images, NPDM descriptors and PFS0 archives.", long_about = None)]
struct Cli {
    /// Print a machine-readable JSON report on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a kernel initial process image from an ELF and a JSON config.
    Kip {
        elf: PathBuf,
        config: PathBuf,
        /// Defaults to the config path with a `.kip` extension.
        out: Option<PathBuf>,
        /// Compress the segments (not supported).
        #[arg(long, default_value_t = false)]
        compress: bool,
    },
    /// Build a program metadata descriptor from a JSON config.
    Npdm {
        config: PathBuf,
        /// Defaults to the config path with a `.npdm` extension.
        out: Option<PathBuf>,
    },
    /// Pack the files of a directory into a PFS0 archive.
    Pfs0 {
        dir: PathBuf,
        /// Defaults to `<dir>.nsp`.
        out: Option<PathBuf>,
    },
    /// Unpack a PFS0 archive into a directory.
    #[command(name = "extract-pfs0")]
    ExtractPfs0 {
        file: PathBuf,
        /// Defaults to the archive path without its extension.
        out_dir: Option<PathBuf>,
    },
}

struct Reporter {
    json: bool,
    quiet: bool,
}

impl Reporter {
    fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }
}

#[derive(Debug, Serialize)]
struct BuildReport {
    schema_version: &'static str,
    command: &'static str,
    inputs: Vec<String>,
    output: String,
    bytes: usize,
    sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    layout: Option<SegmentLayout>,
}

#[derive(Debug, Serialize)]
struct ExtractedEntry {
    name: String,
    size: usize,
}

#[derive(Debug, Serialize)]
struct ExtractReport {
    schema_version: &'static str,
    command: &'static str,
    input: String,
    output_dir: String,
    entries: Vec<ExtractedEntry>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.cmd {
        Command::Kip {
            elf,
            config,
            out,
            compress,
        } => cmd_kip(&elf, &config, out, compress, &reporter),
        Command::Npdm { config, out } => cmd_npdm(&config, out, &reporter),
        Command::Pfs0 { dir, out } => cmd_pfs0(&dir, out, &reporter),
        Command::ExtractPfs0 { file, out_dir } => cmd_extract_pfs0(&file, out_dir, &reporter),
    }
}

fn cmd_kip(
    elf_path: &Path,
    config_path: &Path,
    out: Option<PathBuf>,
    compress: bool,
    reporter: &Reporter,
) -> Result<()> {
    let out = out.unwrap_or_else(|| config_path.with_extension("kip"));

    let value = read_document(config_path)?;
    let config = Doc::root(&value)
        .and_then(|doc| KipConfig::from_doc(&doc))
        .with_context(|| format!("config: {}", config_path.display()))?;
    let source = SegmentSource::read(elf_path)?;
    for (i, seg) in source.segments.iter().enumerate() {
        reporter.progress(&format!(
            "segment {i}: {} file={:#x} mem={:#x}",
            seg.perm,
            seg.file_size(),
            seg.mem_size
        ));
    }

    let kip = build_kip(&config, &source, KipOptions { compress })
        .with_context(|| format!("build KIP: {}", config.name))?;
    finish_build(
        reporter,
        "kip",
        &[elf_path, config_path],
        &out,
        kip.image.as_bytes(),
        Some(kip.layout),
    )
}

fn cmd_npdm(config_path: &Path, out: Option<PathBuf>, reporter: &Reporter) -> Result<()> {
    let out = out.unwrap_or_else(|| config_path.with_extension("npdm"));

    let value = read_document(config_path)?;
    let config = Doc::root(&value)
        .and_then(|doc| NpdmConfig::from_doc(&doc))
        .with_context(|| format!("config: {}", config_path.display()))?;
    reporter.progress(&format!(
        "{}: {} kernel capabilities, {} hosted and {} accessed services",
        config.name,
        config.capabilities.len(),
        config.services.host.len(),
        config.services.access.len()
    ));

    let npdm = build_npdm(&config).with_context(|| format!("build NPDM: {}", config.name))?;
    finish_build(reporter, "npdm", &[config_path], &out, npdm.as_bytes(), None)
}

fn cmd_pfs0(dir: &Path, out: Option<PathBuf>, reporter: &Reporter) -> Result<()> {
    let out = out.unwrap_or_else(|| with_suffix(dir, ".nsp"));

    let entries = read_dir_entries(dir)?;
    for entry in &entries {
        reporter.progress(&format!("add {} ({} bytes)", entry.name, entry.data.len()));
    }
    let pfs0 = build_pfs0(&entries).with_context(|| format!("pack: {}", dir.display()))?;
    finish_build(reporter, "pfs0", &[dir], &out, pfs0.as_bytes(), None)
}

fn cmd_extract_pfs0(file: &Path, out_dir: Option<PathBuf>, reporter: &Reporter) -> Result<()> {
    let out_dir = out_dir.unwrap_or_else(|| file.with_extension(""));
    if out_dir == file {
        anyhow::bail!(
            "can't derive an output dir from {}; pass one explicitly",
            file.display()
        );
    }

    let bytes = std::fs::read(file).with_context(|| format!("read: {}", file.display()))?;
    let entries = parse_pfs0(&bytes).with_context(|| format!("parse PFS0: {}", file.display()))?;
    let written = write_entries(&out_dir, &entries)?;
    for path in &written {
        reporter.progress(&format!("wrote {}", path.display()));
    }

    if reporter.json {
        write_json_stdout(&ExtractReport {
            schema_version: NXMETA_EXTRACT_REPORT_SCHEMA_VERSION,
            command: "extract-pfs0",
            input: file.display().to_string(),
            output_dir: out_dir.display().to_string(),
            entries: entries
                .iter()
                .map(|e| ExtractedEntry {
                    name: e.name.clone(),
                    size: e.data.len(),
                })
                .collect(),
        })?;
    }
    Ok(())
}

fn finish_build(
    reporter: &Reporter,
    command: &'static str,
    inputs: &[&Path],
    out: &Path,
    bytes: &[u8],
    layout: Option<SegmentLayout>,
) -> Result<()> {
    write_output(out, bytes)?;
    reporter.progress(&format!("wrote {} ({} bytes)", out.display(), bytes.len()));

    if reporter.json {
        write_json_stdout(&BuildReport {
            schema_version: NXMETA_BUILD_REPORT_SCHEMA_VERSION,
            command,
            inputs: inputs.iter().map(|p| p.display().to_string()).collect(),
            output: out.display().to_string(),
            bytes: bytes.len(),
            sha256: sha256_hex(bytes),
            layout,
        })?;
    }
    Ok(())
}

/// `path` with `suffix` appended to its last component (`exefs/` -> `exefs.nsp`).
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let normalized: PathBuf = path.components().collect();
    let mut s = normalized.into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}
