#![warn(clippy::cloned_instead_of_copied)]
#![warn(clippy::empty_structs_with_brackets)]
#![warn(clippy::equatable_if_let)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::expect_used)]
#![warn(clippy::from_iter_instead_of_collect)]
#![warn(clippy::manual_let_else)]
#![warn(clippy::match_same_arms)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::needless_collect)]
#![warn(clippy::option_if_let_else)]
#![warn(clippy::print_stdout)]
#![warn(clippy::str_to_string)]
#![warn(clippy::uninlined_format_args)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::use_self)]

//! Common components shared by the workflow engine: the error taxonomy and small filesystem
//! helpers used when loading a workflow description from disk.

pub mod error;
pub mod fs;
