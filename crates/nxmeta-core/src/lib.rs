//! Builders for Horizon kernel initial process (KIP1) images, program
//! metadata (NPDM) descriptors and PFS0 archives.

pub mod caps;
pub mod config;
pub mod elf;
pub mod error;
pub mod kip;
pub mod layout;
pub mod npdm;
pub mod pfs0;
mod process;
pub mod util;
pub mod writer;

pub use caps::{Capability, CapabilityKind};
pub use config::Doc;
pub use elf::SegmentSource;
pub use error::{BuildError, BuildResult, ErrorKind};
pub use kip::{build_kip, KipConfig, KipImage, KipOptions};
pub use layout::SegmentLayout;
pub use npdm::{build_npdm, NpdmConfig};
pub use pfs0::{build_pfs0, parse_pfs0, Pfs0Entry};
pub use writer::{BinaryWriter, ByteOrder};
