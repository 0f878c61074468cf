//! # Dockhand
//!
//! Validation and release orchestration for a multi-package monorepo.
//!
//! Dockhand drives every package of the ecosystem through an isolated
//! build-and-test pipeline and cuts releases in dependency order. It wraps
//! the standard packaging toolchain (environment provisioning, build
//! backend, metadata linters, test runner, release tool) without replacing
//! any of it.
//!
//! ## Pipeline
//!
//! The validation flow per package is **env → build → check → test →
//! clean**:
//!
//! 1. [`executor`] provisions an isolated per-package environment and runs
//!    each phase against the package's released artifact, never the raw
//!    source checkout.
//! 2. [`pipeline`] composes phases into the full or reduced chain and
//!    short-circuits a package's remaining phases on its first failure.
//! 3. [`dispatch`] fans the chain out across the registry: parallel for
//!    most packages, strictly serialized for the subset that shares the
//!    single directory-service test fixture. Failures are collected, never
//!    propagated across sibling packages.
//! 4. [`artifacts`] diffs the built wheel against the built sdist to catch
//!    packaging mistakes.
//!
//! The release flow is **scan → plan → release**: [`changelog`] decides
//! which packages have unreleased changes, groups them into dependency
//! tiers, and [`release`] hands each one to the external release tool in
//! order, halting on the first failure.
//!
//! ## Key types
//!
//! - `Registry` — static package enumeration with tiers and flags
//! - `PhaseOutcome` / `BatchReport` — per-phase and per-batch results
//! - `ReleasePlan` / `ReleaseResult` — tiered release batch and outcomes
//! - `Config` — `.dockhand.toml` settings merged over defaults
//!
//! ## CLI usage
//!
//! For command-line usage see the `dockhand-cli` crate.

/// Wheel vs sdist content comparison.
pub mod artifacts;

/// Change-log parsing, release eligibility and plan building.
pub mod changelog;

/// Configuration file (`.dockhand.toml`) loading and the directory layout.
pub mod config;

/// Fail-soft parallel fan-out and batch reporting.
pub mod dispatch;

/// Append-only JSONL event log.
pub mod events;

/// Single-phase execution against the packaging toolchain.
pub mod executor;

/// Phase chain composition per validation mode.
pub mod pipeline;

/// External tool invocation with deadline enforcement.
pub mod process;

/// Static package registry loaded from `packages.toml`.
pub mod registry;

/// Tier-ordered, fail-fast release driver.
pub mod release;

/// Batch report persistence.
pub mod state;

/// Shared cross-package artifact store.
pub mod store;

/// Domain types: phases, outcomes, reports, events.
pub mod types;
