// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Offline tools for Ambrosia log directories.
pub mod commands;
pub mod scan;
