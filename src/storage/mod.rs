// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: sorted score stores and the durable view count table.

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
