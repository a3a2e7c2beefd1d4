// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resolution of the vendor HAL library.

use super::native::NativeHal;
use super::{EntryPoints, NfcHal};
use crate::error::{Error, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Library used when no vendor specific library fits.
pub const DEFAULT_HAL_LIBRARY: &str = "libnfc-nci.so";

/// Constructor of a HAL library instance.
pub type HalFactory = Box<dyn Fn() -> Arc<dyn NfcHal> + Send + Sync>;

/// Resolution of the HAL library, keyed by path.
///
/// The library is resolved once, at initialization: the vendor library
/// for the chip type is preferred, the default library is used when the
/// vendor one is absent or lacks a required entry point. Paths with a
/// registered in-process implementation use it; the others are opened
/// as shared libraries.
#[derive(Default)]
pub struct HalLoader {
    libraries: HashMap<String, HalFactory>,
}

impl HalLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Default::default()
    }

    /// Path of the vendor library for a chip type.
    pub fn vendor_library(chip_type: &str) -> String {
        format!("libnfc-nci-{}.so", chip_type.to_ascii_lowercase())
    }

    /// Make a library available under `path`.
    pub fn register(&mut self, path: impl Into<String>, factory: HalFactory) {
        self.libraries.insert(path.into(), factory);
    }

    fn open(&self, path: &str) -> Result<Arc<dyn NfcHal>> {
        let hal: Arc<dyn NfcHal> = match self.libraries.get(path) {
            Some(factory) => factory(),
            None => Arc::new(NativeHal::open(path)?),
        };
        match hal.entry_points().first_missing(EntryPoints::REQUIRED) {
            None => Ok(hal),
            Some(entry_point) => {
                Err(Error::MissingEntryPoint { library: path.to_owned(), entry_point })
            }
        }
    }

    /// Resolve the HAL for the chip type reported by the device.
    pub fn load(&self, chip_type: Option<&str>) -> Result<Arc<dyn NfcHal>> {
        if let Some(chip_type) = chip_type {
            let path = HalLoader::vendor_library(chip_type);
            match self.open(&path) {
                Ok(hal) => {
                    info!("loaded HAL library {}", path);
                    return Ok(hal);
                }
                Err(err) => warn!("{}, falling back to {}", err, DEFAULT_HAL_LIBRARY),
            }
        }
        let hal = self.open(DEFAULT_HAL_LIBRARY)?;
        info!("loaded HAL library {}", DEFAULT_HAL_LIBRARY);
        Ok(hal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::hal::sim::SimulatedController;

    fn sim_factory(entry_points: EntryPoints, chip: &'static str) -> HalFactory {
        Box::new(move || -> Arc<dyn NfcHal> {
            let mut store = ConfigStore::new();
            store.set("CHIP", crate::config::ConfigValue::Text(chip.into()));
            Arc::new(SimulatedController::with_entry_points(store, entry_points))
        })
    }

    fn chip_of(hal: &Arc<dyn NfcHal>) -> Option<crate::config::ConfigValue> {
        hal.config_get("CHIP")
    }

    #[test]
    fn vendor_library_preferred() {
        let mut loader = HalLoader::new();
        loader.register(DEFAULT_HAL_LIBRARY, sim_factory(EntryPoints::all(), "default"));
        loader.register("libnfc-nci-pn7160.so", sim_factory(EntryPoints::all(), "vendor"));
        let hal = loader.load(Some("PN7160")).unwrap();
        assert_eq!(chip_of(&hal), Some(crate::config::ConfigValue::Text("vendor".into())));
    }

    #[test]
    fn incomplete_vendor_library_falls_back() {
        let mut loader = HalLoader::new();
        loader.register(DEFAULT_HAL_LIBRARY, sim_factory(EntryPoints::all(), "default"));
        loader.register(
            "libnfc-nci-pn7160.so",
            sim_factory(EntryPoints::all().difference(EntryPoints::SELECT), "vendor"),
        );
        let hal = loader.load(Some("pn7160")).unwrap();
        assert_eq!(chip_of(&hal), Some(crate::config::ConfigValue::Text("default".into())));
    }

    #[test]
    fn missing_default_fails_explicitly() {
        let mut loader = HalLoader::new();
        loader.register(
            DEFAULT_HAL_LIBRARY,
            sim_factory(EntryPoints::REQUIRED.difference(EntryPoints::UPDATE_ROUTING), "default"),
        );
        assert_eq!(
            loader.load(None).err(),
            Some(Error::MissingEntryPoint {
                library: DEFAULT_HAL_LIBRARY.into(),
                entry_point: "UPDATE_ROUTING"
            })
        );
        assert_eq!(
            HalLoader::new().load(Some("x")).err(),
            Some(Error::HalUnavailable(DEFAULT_HAL_LIBRARY.into()))
        );
    }
}
