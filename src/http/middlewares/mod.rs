//! Stock middleware controllers

pub mod static_files;
