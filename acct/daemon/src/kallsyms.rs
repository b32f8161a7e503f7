//! Kernel symbol lookup
//!
//! A [`Kallsyms`] is refreshed once before building a probe, queried for
//! every probe target and then dropped. Checking targets up front gives a
//! readable error instead of an opaque attach failure.

use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Error, Result},
    kernel::KernelProbe,
};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Set of symbol names exported by the running kernel
#[derive(Debug, Clone, Default)]
pub struct Kallsyms {
    path: PathBuf,
    symbols: HashSet<String>,
}

impl Kallsyms {
    /// Read the running kernel's symbol table.
    pub fn load() -> Result<Self> {
        Self::load_from(KALLSYMS_PATH)
    }

    /// Read a symbol table in `/proc/kallsyms` format from `path`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut kallsyms = Kallsyms {
            path: path.as_ref().to_path_buf(),
            symbols: HashSet::new(),
        };
        kallsyms.refresh()?;
        Ok(kallsyms)
    }

    /// Parse a symbol table from any reader.
    ///
    /// Lines have the form `address type name [module]`.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut symbols = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(name) = line.split_whitespace().nth(2) {
                symbols.insert(name.to_string());
            }
        }
        Ok(Kallsyms {
            path: PathBuf::new(),
            symbols,
        })
    }

    /// Re-read the table from the path it was loaded from.
    pub fn refresh(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        let fresh = Self::from_reader(BufReader::new(file))?;
        self.symbols = fresh.symbols;
        debug!(
            "loaded {} kernel symbols from {}",
            self.symbols.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Check that every probe's target function exists.
    pub fn check_probes(&self, probes: &[KernelProbe]) -> Result<()> {
        match probes.iter().find(|p| !self.contains(p.symbol)) {
            Some(p) => Err(Error::SymbolMissing {
                symbol: p.symbol.to_string(),
                probe: p.to_string(),
            }),
            None => Ok(()),
        }
    }
}
