use std::fs::File;
use std::path::Path;

use anyhow::Context;
use dccwave_core::driver::DriverOptions;

/// Load driver options from a JSON file, or fall back to the defaults.
pub fn load_driver_options(path: Option<&Path>) -> anyhow::Result<DriverOptions> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("could not open config file {}", path.display()))?;
            let options = serde_json::from_reader(file)
                .with_context(|| format!("could not parse config file {}", path.display()))?;
            log::debug!("loaded driver options from {}: {options:?}", path.display());
            Ok(options)
        }
        None => Ok(DriverOptions::default()),
    }
}
