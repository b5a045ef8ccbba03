use nxmeta_core::caps::CapabilityKind;
use nxmeta_core::config::Doc;
use nxmeta_core::writer::BinaryWriter;
use nxmeta_core::{build_kip, ErrorKind, KipConfig, KipOptions, SegmentSource};
use serde_json::json;

const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Seg {
    flags: u32,
    data: Vec<u8>,
    mem_size: u64,
}

/// Minimal little-endian ELF64 executable: header, program headers, then each
/// segment's bytes at its own 0x100-aligned file offset.
fn synth_elf(machine: u16, segs: &[Seg]) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    w.seek(0x10);
    w.write_u16(2);
    w.write_u16(machine);
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

    let mut offset = 0x100u64;
    for seg in segs {
        w.write_u32(1);
        w.write_u32(seg.flags);
        w.write_u64(offset);
        w.write_u64(offset);
        w.write_u64(offset);
        w.write_u64(seg.data.len() as u64);
        w.write_u64(seg.mem_size);
        w.write_u64(0x100);
        offset += 0x100;
    }
    for (i, seg) in segs.iter().enumerate() {
        w.seek(0x100 * (i + 1));
        w.write_bytes(&seg.data);
    }
    w.into_bytes()
}

fn three_segments() -> Vec<Seg> {
    vec![
        Seg {
            flags: PF_R | PF_X,
            data: vec![0xC0; 0x10],
            mem_size: 0x10,
        },
        Seg {
            flags: PF_R,
            data: vec![0x80; 0x8],
            mem_size: 0x8,
        },
        Seg {
            flags: PF_R | PF_W,
            data: vec![0x40; 0x20],
            mem_size: 0x3000,
        },
    ]
}

fn config_json() -> serde_json::Value {
    json!({
        "name": "Test",
        "title_id": "0x0100000000000042",
        "main_thread_priority": 0x2C,
        "default_cpu_id": 3,
        "main_thread_stack_size": "0x4000",
        "kernel_capabilities": [
            {
                "type": "kernel_flags",
                "value": {
                    "highest_thread_priority": 10,
                    "lowest_thread_priority": 2,
                    "lowest_cpu_id": 0,
                    "highest_cpu_id": 3
                }
            },
            { "type": "syscalls", "value": { "a": "0x01", "b": "0x19" } }
        ]
    })
}

fn config() -> KipConfig {
    let value = config_json();
    KipConfig::from_doc(&Doc::root(&value).unwrap()).unwrap()
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

#[test]
fn parses_segments_in_file_order() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    assert_eq!(source.machine, EM_AARCH64);
    let perms: Vec<String> = source.segments.iter().map(|s| s.perm.to_string()).collect();
    assert_eq!(perms, ["r-x", "r--", "rw-"]);
    assert_eq!(source.segments[2].file_size(), 0x20);
    assert_eq!(source.segments[2].mem_size, 0x3000);
}

#[test]
fn thirty_two_bit_arm_is_accepted() {
    let elf = synth_elf(EM_ARM, &three_segments());
    // The synthesized header is ELF64; only the machine field matters here.
    let source = SegmentSource::parse(&elf).unwrap();
    assert_eq!(source.machine, EM_ARM);
}

#[test]
fn kip_header_fields() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let kip = build_kip(&config(), &source, KipOptions::default()).unwrap();
    let b = kip.image.as_bytes();

    assert_eq!(&b[0..4], b"KIP1");
    assert_eq!(&b[4..0x10], b"Test\0\0\0\0\0\0\0\0");
    assert_eq!(u64_at(b, 0x10), 0x0100_0000_0000_0042);
    assert_eq!(u32_at(b, 0x18), 1, "version defaults to 1");
    assert_eq!(b[0x1C], 0x2C);
    assert_eq!(b[0x1D], 3);
    assert_eq!(b[0x1E], 0);
    assert_eq!(b[0x1F], 0x78, "64-bit, secure memory and immortal set, no compression");
    assert_eq!(u32_at(b, 0x3C), 0x4000);
}

#[test]
fn kip_segment_table_and_data() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let kip = build_kip(&config(), &source, KipOptions::default()).unwrap();
    let b = kip.image.as_bytes();

    let rows: Vec<(u32, u32, u32)> = [0x20, 0x30, 0x40, 0x50]
        .iter()
        .map(|&at| (u32_at(b, at), u32_at(b, at + 4), u32_at(b, at + 8)))
        .collect();
    assert_eq!(
        rows,
        vec![
            (0, 0x10, 0x10),
            (0x1000, 0x8, 0x8),
            (0x2000, 0x20, 0x20),
            (0x3000, 0x2000, 0),
        ]
    );

    assert_eq!(b.len(), 0x100 + 0x10 + 0x8 + 0x20);
    assert!(b[0x100..0x110].iter().all(|x| *x == 0xC0));
    assert!(b[0x110..0x118].iter().all(|x| *x == 0x80));
    assert!(b[0x118..].iter().all(|x| *x == 0x40));
}

#[test]
fn kip_capability_region_is_ff_padded() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let kip = build_kip(&config(), &source, KipOptions::default()).unwrap();
    let b = kip.image.as_bytes();

    assert_eq!(u32_at(b, 0x80), 0x0300_08A7);
    assert_eq!(u32_at(b, 0x84), 0x0000_004F);
    assert_eq!(u32_at(b, 0x88), 0x2000_004F);
    assert!(b[0x8C..0x100].iter().all(|x| *x == 0xFF));

    let kinds: Vec<Option<CapabilityKind>> = (0x80..0x100)
        .step_by(4)
        .map(|at| CapabilityKind::from_word(u32_at(b, at)))
        .take_while(Option::is_some)
        .collect();
    assert_eq!(kinds.len(), 3);
}

#[test]
fn misaligned_stack_is_rejected() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let mut config = config();
    config.main_thread_stack_size = 0x1234;
    let err = build_kip(&config, &source, KipOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
    assert!(err.to_string().contains("main_thread_stack_size"), "{err}");
}

#[test]
fn compression_is_unimplemented() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let err = build_kip(&config(), &source, KipOptions { compress: true }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unimplemented);
}

#[test]
fn wrong_machine_is_structural() {
    let elf = synth_elf(EM_X86_64, &three_segments());
    let err = SegmentSource::parse(&elf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn two_segments_is_structural() {
    let mut segs = three_segments();
    segs.pop();
    let elf = synth_elf(EM_AARCH64, &segs);
    let err = SegmentSource::parse(&elf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(err.to_string().contains("got 2"), "{err}");
}

#[test]
fn segment_past_end_of_file_is_structural() {
    let mut elf = synth_elf(EM_AARCH64, &three_segments());
    elf.truncate(0x310);
    let err = SegmentSource::parse(&elf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn long_name_is_rejected_from_config() {
    let mut value = config_json();
    value["name"] = json!("ThirteenChars");
    let err = KipConfig::from_doc(&Doc::root(&value).unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
}

#[test]
fn missing_required_key_names_the_key() {
    let mut value = config_json();
    value.as_object_mut().unwrap().remove("default_cpu_id");
    let err = KipConfig::from_doc(&Doc::root(&value).unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(err.to_string().contains("default_cpu_id"), "{err}");
}

#[test]
fn returned_layout_matches_written_segment_table() {
    let elf = synth_elf(EM_AARCH64, &three_segments());
    let source = SegmentSource::parse(&elf).unwrap();
    let kip = build_kip(&config(), &source, KipOptions::default()).unwrap();
    let b = kip.image.as_bytes();

    let rows = kip.layout.segments.iter().chain([&kip.layout.bss]);
    for (row, at) in rows.zip([0x20, 0x30, 0x40, 0x50]) {
        assert_eq!(u32_at(b, at) as u64, row.memory_offset, "row at {at:#x}");
        assert_eq!(u32_at(b, at + 4) as u64, row.decompressed_size);
        assert_eq!(u32_at(b, at + 8) as u64, row.stored_size);
    }
}

#[test]
fn oversized_bss_fails_instead_of_wrapping() {
    let mut segs = three_segments();
    segs[2].data.clear();
    segs[2].mem_size = u64::MAX;
    let elf = synth_elf(EM_AARCH64, &segs);
    let source = SegmentSource::parse(&elf).unwrap();
    let err = build_kip(&config(), &source, KipOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}
