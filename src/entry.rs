// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Type of a payload region within a boot image.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum EntryKind {
    Kernel,
    Ramdisk,
    SecondBoot,
    DeviceTree,
    /// The 512-byte MTK sub-header preceding the kernel payload.
    MtkKernelHeader,
    /// The 512-byte MTK sub-header preceding the ramdisk payload.
    MtkRamdiskHeader,
}

/// A typed payload region as seen by the caller. Instances are produced by the
/// reader and writer entry cycles; they carry no payload data themselves.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    pub kind: EntryKind,
    /// Payload size in bytes. When writing, this is unknown until the entry
    /// has been finished.
    pub size: Option<u64>,
}
