//! SCE container codec
//!
//! Builds and opens signed, encrypted SCE containers: loadable images
//! wrapping an ELF executable, and raw revoke-list, package and
//! secure-payload containers.
//!
//! ## Layers
//!
//! ```text
//! Executable → Sections → Compress → HMAC-SHA1 → AES-128-CTR     (per section, parallel)
//!            → Metadata body ── AES-128-CTR under the metadata info
//!            → Metadata info ── AES-256-CBC under the keyset key
//!                            └─ AES-128-CBC under the license key   (NPDRM only)
//!            → ECDSA-SHA1 signature over everything before it
//!            → License block + its own signature                    (NPDRM only)
//! ```
//!
//! Decode runs the same layers backwards, and refuses to decrypt anything
//! until the signature has been verified.
//!
//! ## Example
//!
//! ```no_run
//! use sce_codec::{Codec, DecodeOverrides, EncodeAttributes, KeyOverrides, Registry};
//! use std::path::Path;
//!
//! let registry = Registry::from_dir(Path::new("data")).unwrap();
//! let codec = Codec::new(&registry);
//!
//! let elf = std::fs::read("app.elf").unwrap();
//! let container = codec
//!     .encode(&elf, &EncodeAttributes::default(), &KeyOverrides::default())
//!     .unwrap();
//!
//! let decoded = codec.decode(&container, &DecodeOverrides::default()).unwrap();
//! assert_eq!(decoded.payload.bytes(), elf.as_slice());
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod curve;
pub mod error;
pub mod header;
pub mod image;
pub mod keyset;
pub mod license;
pub mod metadata;
pub mod pipeline;
pub mod report;
pub mod signature;

#[cfg(any(test, feature = "testkit"))]
#[doc(hidden)]
pub mod testkit;

pub use codec::{inspect, Codec, ContainerSummary, Decoded, DecodedPayload};
pub use config::{DataPaths, DecodeOverrides, EncodeAttributes, KeyMaterialPolicy, KeyOverrides};
pub use error::{Result, SceError};
pub use header::{ContainerHeader, ContainerType, LicenseType, NpAppType, SelfType};
pub use keyset::{KeyContext, KeyEntry, Registry};
pub use license::LicenseParams;
pub use report::DecodeReport;
