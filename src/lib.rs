/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Codec for Android-family boot images.
//!
//! The reader side supports plain Android boot images (including the Samsung
//! SEAndroid and Bump trailer variants) and MTK images, with automatic format
//! detection when more than one format is enabled. The writer side produces
//! plain Android and MTK images. Payload data is streamed through a shared
//! segment pipeline, so images of any size can be processed with a small,
//! bounded amount of memory.

pub mod entry;
pub mod format;
pub mod header;
pub mod reader;
pub mod stream;
pub mod writer;
