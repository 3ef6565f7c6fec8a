//! setmirror CLI - publish image set archives to a registry.

pub mod commands;
