//! Shared, version-pinned format identifiers.
//!
//! These constants are the single source of truth for container magics and for
//! the schema/version strings that appear in the CLI's machine-readable reports.

pub const KIP_MAGIC: &[u8; 4] = b"KIP1";
pub const NPDM_META_MAGIC: &[u8; 4] = b"META";
pub const NPDM_ACID_MAGIC: &[u8; 4] = b"ACID";
pub const NPDM_ACI_MAGIC: &[u8; 4] = b"ACI0";
pub const PFS0_MAGIC: &[u8; 4] = b"PFS0";

pub const NXMETA_BUILD_REPORT_SCHEMA_VERSION: &str = "nxmeta.build.report@0.1.0";
pub const NXMETA_EXTRACT_REPORT_SCHEMA_VERSION: &str = "nxmeta.extract.report@0.1.0";

/// Page granularity used for segment placement and stack sizes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Upper bound on kernel capability descriptors per capability list.
pub const MAX_KERNEL_CAPABILITIES: usize = 32;
