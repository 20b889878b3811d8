//! Shared utility functions.
//!
//! - `mime`: file kind detection used for routing
//! - `folders`: OS folder naming and lookup

mod folders;
mod mime;

pub use folders::{find_os_folder, os_folder_name, sanitize_component, unique_path};
pub use mime::{detect_kind, kind_from_extension, mime_type_kind, FileKind};
