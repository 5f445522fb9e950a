// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Review-server project lifecycle reconciliation.
//!
//! Regent takes a declarative list of projects and makes a Gerrit review
//! server match it: projects get created, their initial history gets
//! imported from an upstream or initialized fresh, access-control and
//! policy configuration gets pushed onto each project's metadata ref
//! (`refs/meta/config`), groups get created with their members, local bare
//! mirrors get set up, and an optional hosting-side mirror repository gets
//! reconciled along the way.
//!
//! Runs are batch-shaped and repeatable. A per-project change cache plus
//! content hashing of the configuration sources keep repeat runs cheap:
//! nothing is pushed unless the declaration or its sources actually
//! changed, and a project that fails mid-flight is simply retried from its
//! last confirmed step on the next run.

pub mod cache;
pub mod config;
pub mod gerrit;
pub mod git;
pub mod github;
pub mod hash;
pub mod path;
pub mod reconcile;
pub mod retry;
