//! Data model and wire parsing for "Simple Repository" package indexes.
//!
//! This crate is the protocol leaf of proxpi: it knows what a project
//! listing and a file record look like in both the HTML
//! ([PEP 503](https://peps.python.org/pep-0503/)) and JSON
//! ([PEP 691](https://peps.python.org/pep-0691/)) forms, and how project
//! names are normalized for comparison. It performs no I/O.

mod file;
mod html;
mod json;
mod media_type;
mod name;

pub use file::{CoreMetadata, File, Yanked};
pub use html::{parse_project_page, parse_root_page, HtmlError};
pub use json::{IndexMeta, ProjectDetail, ProjectListEntry, RootIndex, SIMPLE_API_VERSION};
pub use media_type::MediaType;
pub use name::{InvalidNameError, ProjectName};
