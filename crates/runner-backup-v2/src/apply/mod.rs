//! Staged apply: extract into a private staging directory, then swap each
//! live target with its staged counterpart by rename. The previous content
//! stays beside the target as `<name>.old` until every swap has succeeded.

mod staging;
mod swap;

pub(crate) use staging::{create_staging_dir, remove_path, remove_staging_dir};
pub(crate) use swap::{SwapTarget, discard_old, old_sibling, preflight, swap_all};
