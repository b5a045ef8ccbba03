use std::path::{Path, PathBuf};
use std::process::Command;

use nxmeta_contracts::{NXMETA_BUILD_REPORT_SCHEMA_VERSION, NXMETA_EXTRACT_REPORT_SCHEMA_VERSION};
use nxmeta_core::BinaryWriter;
use serde_json::Value;

fn repo_root() -> PathBuf {
    let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .to_path_buf()
}

fn fixture(name: &str) -> PathBuf {
    let path = repo_root().join("tests/fixtures").join(name);
    assert!(path.is_file(), "missing {}", path.display());
    path
}

fn run_nxmeta(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_nxmeta");
    Command::new(exe).args(args).output().expect("run nxmeta")
}

fn parse_json_stdout(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).expect("parse stdout JSON")
}

fn stderr(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

/// ELF64 AArch64 executable with r-x, r-- and rw- loadable segments.
fn write_elf(path: &Path) {
    let segs: [(u32, usize, u64); 3] = [(5, 0x40, 0x40), (4, 0x10, 0x10), (6, 0x20, 0x2000)];
    let mut w = BinaryWriter::new();
    w.write_bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    w.seek(0x10);
    w.write_u16(2);
    w.write_u16(183);
    w.write_u32(1);
    w.write_u64(0);
    w.write_u64(64);
    w.write_u64(0);
    w.write_u32(0);
    w.write_u16(64);
    w.write_u16(56);
    w.write_u16(segs.len() as u16);
    w.write_u16(64);
    w.write_u16(0);
    w.write_u16(0);
    for (i, (flags, size, mem_size)) in segs.iter().enumerate() {
        let offset = 0x100 * (i as u64 + 1);
        w.write_u32(1);
        w.write_u32(*flags);
        w.write_u64(offset);
        w.write_u64(offset);
        w.write_u64(offset);
        w.write_u64(*size as u64);
        w.write_u64(*mem_size);
        w.write_u64(0x100);
    }
    for (i, (_, size, _)) in segs.iter().enumerate() {
        w.seek(0x100 * (i + 1));
        w.fill(0xA0 + i as u8, *size);
    }
    std::fs::write(path, w.as_bytes()).expect("write ELF");
}

#[test]
fn kip_json_report() {
    let tmp = tempfile::tempdir().unwrap();
    let elf = tmp.path().join("sample.elf");
    write_elf(&elf);
    let out = tmp.path().join("sample.kip");

    let res = run_nxmeta(&[
        "--json",
        "kip",
        path_arg(&elf),
        path_arg(&fixture("kip.json")),
        path_arg(&out),
    ]);
    assert_eq!(res.status.code(), Some(0), "stderr:\n{}", stderr(&res));
    assert!(res.stderr.is_empty(), "--json keeps stderr quiet");

    let v = parse_json_stdout(&res);
    assert_eq!(v["schema_version"], NXMETA_BUILD_REPORT_SCHEMA_VERSION);
    assert_eq!(v["command"], "kip");
    assert_eq!(v["layout"]["segments"][1]["memory_offset"], 0x1000);
    assert_eq!(v["layout"]["bss"]["memory_offset"], 0x3000);
    assert_eq!(v["layout"]["bss"]["decompressed_size"], 0x1000);

    let kip = std::fs::read(&out).unwrap();
    assert_eq!(v["bytes"], kip.len());
    assert_eq!(kip.len(), 0x100 + 0x40 + 0x10 + 0x20);
    assert_eq!(&kip[0..4], b"KIP1");
    assert_eq!(&kip[4..0x10], b"Sample\0\0\0\0\0\0");
    assert_eq!(v["sha256"].as_str().unwrap().len(), 64);
}

#[test]
fn npdm_default_output_path() {
    let tmp = tempfile::tempdir().unwrap();
    let config = tmp.path().join("main.json");
    std::fs::copy(fixture("npdm.json"), &config).unwrap();

    let res = run_nxmeta(&["--quiet", "npdm", path_arg(&config)]);
    assert_eq!(res.status.code(), Some(0), "stderr:\n{}", stderr(&res));
    assert!(res.stdout.is_empty());

    let npdm = std::fs::read(tmp.path().join("main.npdm")).unwrap();
    assert_eq!(&npdm[0..4], b"META");
    assert_eq!(&npdm[0x80 + 0x200..0x80 + 0x204], b"ACID");
}

#[test]
fn config_error_is_one_line_with_key_path() {
    let tmp = tempfile::tempdir().unwrap();
    let mut value: Value =
        serde_json::from_slice(&std::fs::read(fixture("npdm.json")).unwrap()).unwrap();
    value["kernel_capabilities"][1]["value"] = serde_json::json!([0xC0]);
    let config = tmp.path().join("bad.json");
    std::fs::write(&config, serde_json::to_vec(&value).unwrap()).unwrap();

    let res = run_nxmeta(&["npdm", path_arg(&config)]);
    assert_eq!(res.status.code(), Some(1));
    let err = stderr(&res);
    assert_eq!(err.trim_end().lines().count(), 1, "{err}");
    assert!(err.contains("kernel_capabilities[1]"), "{err}");
    assert!(!tmp.path().join("bad.npdm").exists(), "no partial output");
}

#[test]
fn kip_compress_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let elf = tmp.path().join("sample.elf");
    write_elf(&elf);
    let out = tmp.path().join("sample.kip");

    let res = run_nxmeta(&[
        "kip",
        "--compress",
        path_arg(&elf),
        path_arg(&fixture("kip.json")),
        path_arg(&out),
    ]);
    assert_eq!(res.status.code(), Some(1));
    assert!(stderr(&res).contains("not supported"), "{}", stderr(&res));
    assert!(!out.exists());
}

#[test]
fn pfs0_pack_and_extract() {
    let tmp = tempfile::tempdir().unwrap();
    let exefs = tmp.path().join("exefs");
    std::fs::create_dir(&exefs).unwrap();
    std::fs::write(exefs.join("main"), b"main segment bytes").unwrap();
    std::fs::write(exefs.join("main.npdm"), b"META").unwrap();

    let res = run_nxmeta(&["--quiet", "pfs0", path_arg(&exefs)]);
    assert_eq!(res.status.code(), Some(0), "stderr:\n{}", stderr(&res));
    let archive = tmp.path().join("exefs.nsp");
    assert!(archive.is_file());

    let out_dir = tmp.path().join("unpacked");
    let res = run_nxmeta(&["--json", "extract-pfs0", path_arg(&archive), path_arg(&out_dir)]);
    assert_eq!(res.status.code(), Some(0), "stderr:\n{}", stderr(&res));
    let v = parse_json_stdout(&res);
    assert_eq!(v["schema_version"], NXMETA_EXTRACT_REPORT_SCHEMA_VERSION);
    let names: Vec<&str> = v["entries"]
        .as_array()
        .expect("entries[]")
        .iter()
        .map(|e| e["name"].as_str().expect("entry.name"))
        .collect();
    assert_eq!(names, vec!["main", "main.npdm"]);
    assert_eq!(v["entries"][0]["size"], 18);

    assert_eq!(std::fs::read(out_dir.join("main")).unwrap(), b"main segment bytes");
    assert_eq!(std::fs::read(out_dir.join("main.npdm")).unwrap(), b"META");
}

#[test]
fn extract_rejects_non_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("junk.nsp");
    std::fs::write(&file, b"not an archive at all").unwrap();

    let res = run_nxmeta(&["extract-pfs0", path_arg(&file)]);
    assert_eq!(res.status.code(), Some(1));
    assert!(stderr(&res).contains("PFS0"), "{}", stderr(&res));
    assert!(!tmp.path().join("junk").exists());
}
