use nxmeta_core::pfs0::{read_dir_entries, write_entries};
use nxmeta_core::{build_pfs0, parse_pfs0, ErrorKind, Pfs0Entry};

fn entry(name: &str, data: &[u8]) -> Pfs0Entry {
    Pfs0Entry {
        name: name.to_string(),
        data: data.to_vec(),
    }
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

#[test]
fn archive_layout() {
    let entries = [entry("a.bin", b"abc"), entry("main.npdm", b"META!")];
    let pfs0 = build_pfs0(&entries).unwrap().into_bytes();

    assert_eq!(&pfs0[0..4], b"PFS0");
    assert_eq!(u32_at(&pfs0, 4), 2);
    assert_eq!(u32_at(&pfs0, 8), 0x10);
    assert_eq!(u32_at(&pfs0, 0xC), 0);

    assert_eq!(u64_at(&pfs0, 0x10), 0);
    assert_eq!(u64_at(&pfs0, 0x18), 3);
    assert_eq!(u32_at(&pfs0, 0x20), 0);
    assert_eq!(u64_at(&pfs0, 0x28), 3);
    assert_eq!(u64_at(&pfs0, 0x30), 5);
    assert_eq!(u32_at(&pfs0, 0x38), 6);

    assert_eq!(&pfs0[0x40..0x50], b"a.bin\0main.npdm\0");
    assert_eq!(&pfs0[0x50..], b"abcMETA!");
}

#[test]
fn string_pool_is_padded_to_sixteen() {
    let pfs0 = build_pfs0(&[entry("x", b"1")]).unwrap().into_bytes();
    // header + one entry = 0x28, "x\0" pads up to 0x30
    assert_eq!(u32_at(&pfs0, 8), 8);
    assert_eq!(pfs0.len(), 0x31);
    assert_eq!(pfs0[0x30], b'1');
}

#[test]
fn parse_recovers_entries() {
    let entries = vec![entry("exefs.nca", &[7; 40]), entry("empty", b"")];
    let pfs0 = build_pfs0(&entries).unwrap().into_bytes();
    assert_eq!(parse_pfs0(&pfs0).unwrap(), entries);
}

#[test]
fn bad_magic_is_structural() {
    let mut pfs0 = build_pfs0(&[entry("x", b"1")]).unwrap().into_bytes();
    pfs0[0] = b'H';
    let err = parse_pfs0(&pfs0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn truncated_data_is_structural() {
    let mut pfs0 = build_pfs0(&[entry("x", b"12345678")]).unwrap().into_bytes();
    pfs0.truncate(pfs0.len() - 1);
    let err = parse_pfs0(&pfs0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn path_like_names_are_rejected() {
    for name in ["", ".", "..", "../evil", "dir/file"] {
        let err = build_pfs0(&[entry(name, b"1")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural, "{name:?}");
    }

    // Forge a traversal name into an otherwise valid archive.
    let mut pfs0 = build_pfs0(&[entry("ab", b"1")]).unwrap().into_bytes();
    pfs0[0x28..0x2A].copy_from_slice(b"..");
    let err = parse_pfs0(&pfs0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn directory_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("exefs");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("main.npdm"), b"npdm").unwrap();
    std::fs::write(src.join("main"), b"nso").unwrap();

    let entries = read_dir_entries(&src).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["main", "main.npdm"]);

    let pfs0 = build_pfs0(&entries).unwrap().into_bytes();
    let out = tmp.path().join("out");
    let written = write_entries(&out, &parse_pfs0(&pfs0).unwrap()).unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(std::fs::read(out.join("main")).unwrap(), b"nso");
    assert_eq!(std::fs::read(out.join("main.npdm")).unwrap(), b"npdm");
}

#[test]
fn subdirectory_in_input_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("nested")).unwrap();
    let err = read_dir_entries(tmp.path()).unwrap_err();
    let build_err = err.downcast_ref::<nxmeta_core::BuildError>().unwrap();
    assert_eq!(build_err.kind(), ErrorKind::Structural);
}
