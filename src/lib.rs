//! isograft rebuilds a bootable Linux ISO with extra kernel modules and
//! RPM packages grafted into it. The original image is never modified;
//! the pipeline extracts the ISO tree, patches the boot image (initrd or
//! squashfs) in place, and assembles a new ISO whose El Torito boot chain
//! matches the source.

pub mod archive;
pub mod artifact;
pub mod assemble;
pub mod boot;
pub mod cli;
pub mod config;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod utils;
