//! HTML parsing and Markdown utilities for html2doc.
//!
//! - [`parse_sections`] turns an HTML manual into ordered [`SectionChunk`]s
//!   and the [`Asset`]s they own, with tables linearized as pipe tables.
//! - [`normalize_markdown`] runs the cleanup passes over composed output.
//! - [`headings`], [`links`], and [`slugify`] scan Markdown for validation.
//!
//! [`SectionChunk`]: html2doc_shared::SectionChunk
//! [`Asset`]: html2doc_shared::Asset

mod cleanup;
mod scan;
mod sections;
mod tables;

pub use cleanup::normalize_markdown;
pub use scan::{Heading, Link, headings, links, prose_lines, prose_text, slugify};
pub use sections::parse_sections;
pub use tables::table_to_markdown;
