use crate::config::DataPaths;
use crate::error::Result;
use crate::keyset::Registry;
use crate::report::keyset_listing;

/// List the keyset records found in the data directory
pub fn print_keys(paths: &DataPaths) -> Result<String> {
    let registry = Registry::from_dir(&paths.data_dir)?;
    let mut output = format!("Data path: {}\n", paths.data_dir.display());
    output.push_str(&keyset_listing(&registry));
    Ok(output)
}
