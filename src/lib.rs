#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod cloudinit;
pub mod error;
pub mod host;
pub mod image;
pub mod iso;
pub mod monitor;
pub mod paths;
pub mod rootfs;
pub mod ssh;
pub mod vm;
pub mod workload;
pub mod workspace;
