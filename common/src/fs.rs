//! Module containing file system utilities

use std::path::Path;

use tokio::{fs::File, io::AsyncReadExt};

use crate::error::EmResult;

/// Read the specified file using the `path` provided, returning the contents as a single [String]
/// buffer.
/// # Errors
/// This function will return an error if the file could not be opened or the contents of the file
/// could not be read into a [String] buffer.
pub async fn read_file<P: AsRef<Path> + Send>(path: P) -> EmResult<String> {
    let path = path.as_ref();
    let mut file = match File::open(path).await {
        Ok(inner) => inner,
        Err(error) => return Err(format!("Could not open file, {path:?}. {error}").into()),
    };
    let mut block = String::new();
    file.read_to_string(&mut block).await?;
    Ok(block)
}
