//! Field-upgrade artifact assembly for Yocto wic images and OSTree repos.
//!
//! This crate packages the artifacts a device consumes to move from one
//! firmware state to another: changed-file tarballs diffed out of two disk
//! images, and OSTree static deltas between commits. The hard operations
//! (mounting, content diffing, delta encoding) are delegated to host tools;
//! this crate owns the sequencing and the guarantees around it:
//!
//! - **Image Resolver** ([`resolve`]) - validated upgrade requests,
//!   including the from-scratch special case and machine-ref selection
//! - **Mount Manager** ([`mount`]) - loopback pool with host-wide mutual
//!   exclusion and scoped, always-released mounts
//! - **Delta Producer** ([`delta`]) - rsync tree diffs and OSTree static
//!   delta staging
//! - **Artifact Packager** ([`package`]) - deterministic tarballs, atomic
//!   installs, ownership normalization
//!
//! # Pipeline
//!
//! ```text
//! resolve ──> mount ──> delta ──> package
//!    │          │          │         │
//!    │          │          │         └─ <tag>-field-upgradeupdate.tar.gz,
//!    │          │          │            delta.bin, data.tar.gz / data.bin
//!    │          │          └─ rsync --compare-dest / static-delta generate
//!    │          └─ losetup + mount, released on every exit path
//!    └─ paths, shas, --empty, machine ref
//! ```
//!
//! A workflow per CLI operation wires the stages together in
//! [`workflows`]; failures are classified by [`error::UpgradeError`] and
//! map to stable exit codes.

pub mod delta;
pub mod error;
pub mod mount;
pub mod package;
pub mod preflight;
pub mod process;
pub mod repo;
pub mod resolve;
pub mod workflows;

pub use error::UpgradeError;
