// src/io/mod.rs
//
// Device links.

pub mod serial;
