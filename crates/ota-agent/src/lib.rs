//! Device-side Uptane OTA agent.
//!
//! The crate wires the `uptane-core` verifier into a running device:
//! persistent metadata storage, bounded-size role fetching, cross-repository
//! target selection, package drivers for the Primary, the Secondary
//! distribution protocol, and the command-driven [`engine::UpdateEngine`]
//! on top of them all.

pub mod bootloader;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod flow;
pub mod manifest;
pub mod package;
pub mod pkcs11;
pub mod provision;
pub mod report;
pub mod resolver;
pub mod secondary;
pub mod storage;
pub mod transport;

pub use bootloader::Bootloader;
pub use config::{AgentConfig, DriverKind, Pkcs11Config};
pub use engine::UpdateEngine;
pub use error::AgentError;
pub use events::{Command, EngineState, Event};
pub use fetcher::Fetcher;
pub use flow::FlowControlToken;
pub use package::{
    BinaryDriver, InstallationResult, InstalledPackage, OstreeDriver, PackageDriver, ResultCode,
};
pub use pkcs11::{P11EngineGuard, Pkcs11Uri};
pub use report::ReportQueue;
pub use resolver::{select, EcuInventory, ResolveError};
pub use secondary::{RawMetaPack, Secondary, SecondaryError, VirtualSecondary};
pub use storage::{
    EcuInfo, EcuState, InstalledVersion, MetaStore, MisconfiguredEcu, PendingInstall, StoreError,
    TlsCreds,
};
pub use transport::{HttpTransport, HttpTransportOptions, Transport, TransportError};
