//! eBPF program loader
//!
//! Loads the accounting program build, writes its configuration maps,
//! attaches its kprobes and hands the perf maps to the readers.

use acct_common::{
    ConfigKey, CONFIG_MAP, CONFIG_RATECURVE_MAP, PERF_DESTROY_MAP, PERF_UPDATE_MAP, READY_VALUE,
};
use aya::{
    maps::{perf::AsyncPerfEventArray, Array, MapData},
    programs::{KProbe, ProgramError},
    Bpf,
};
use log::info;
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    error::{Error, Result},
    kernel::{Kernel, KernelProbe, KernelVersion},
    perf,
    probe::{PerfStreams, Program},
};

/// eBPF program loader and manager
pub struct ProbeLoader {
    bpf: Option<Bpf>,
    version: KernelVersion,
    perf_pages: Option<usize>,
}

impl ProbeLoader {
    /// Load the program build for `kernel` and apply `config`.
    ///
    /// The program stays inert until the Ready flag is written, which
    /// happens last.
    ///
    /// # Arguments
    ///
    /// * `kernel` - Selected build whose object file is read
    /// * `config` - Object directory, perf buffer size and rate curve
    ///
    /// # Returns
    ///
    /// A loader holding the configured but unattached program
    pub fn load(kernel: &Kernel, config: &Config) -> Result<Self> {
        info!("Loading BPF program build {}...", kernel.version);

        let data = kernel.read_object(&config.object_dir)?;
        let bpf = Bpf::load(&data).map_err(|e| Error::LoadFailed {
            version: kernel.version.to_string(),
            // Verifier output can carry trailing NULs.
            source: e.to_string().trim_end_matches('\0').to_string().into(),
        })?;

        let mut loader = Self {
            bpf: Some(bpf),
            version: kernel.version,
            perf_pages: config.perf_pages,
        };
        loader.configure(config)?;

        info!("BPF program loaded successfully");

        Ok(loader)
    }

    /// Write the rate curve and mark the program ready.
    fn configure(&mut self, config: &Config) -> Result<()> {
        let bpf = self.bpf_mut()?;

        let map = bpf
            .map_mut(CONFIG_RATECURVE_MAP)
            .ok_or_else(|| Error::map(CONFIG_RATECURVE_MAP, "not found in BPF object"))?;
        let mut curve: Array<_, u64> =
            Array::try_from(map).map_err(|e| Error::map(CONFIG_RATECURVE_MAP, e))?;
        for (index, value) in config.rate_curve_entries() {
            curve
                .set(index, value, 0)
                .map_err(|e| Error::map(CONFIG_RATECURVE_MAP, e))?;
        }

        let map = bpf
            .map_mut(CONFIG_MAP)
            .ok_or_else(|| Error::map(CONFIG_MAP, "not found in BPF object"))?;
        let mut settings: Array<_, u64> =
            Array::try_from(map).map_err(|e| Error::map(CONFIG_MAP, e))?;
        settings
            .set(ConfigKey::Ready as u32, READY_VALUE, 0)
            .map_err(|e| Error::map(CONFIG_MAP, e))?;

        info!(
            "Configured rate curve: {}",
            config
                .rate_curve
                .iter()
                .map(|p| format!("{}s/{}s", p.age_secs, p.interval_secs))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(())
    }

    /// Build version of the loaded program
    pub fn version(&self) -> KernelVersion {
        self.version
    }

    fn bpf_mut(&mut self) -> Result<&mut Bpf> {
        self.bpf.as_mut().ok_or(Error::Stopped)
    }
}

impl Program for ProbeLoader {
    fn attach(&mut self, probes: &[KernelProbe]) -> Result<()> {
        info!("Attaching kprobes for conntrack accounting...");

        let bpf = self.bpf_mut()?;
        for probe in probes {
            let name = probe.program_name();

            let program: &mut KProbe = bpf
                .program_mut(&name)
                .ok_or_else(|| Error::attach(&name, "program not found in BPF object"))?
                .try_into()
                .map_err(|e: ProgramError| Error::attach(&name, e))?;
            program.load().map_err(|e| Error::attach(&name, e))?;
            program
                .attach(probe.symbol, 0)
                .map_err(|e| Error::attach(&name, e))?;

            info!("  ✓ Attached {}", probe);
        }

        info!("All kprobes attached successfully");

        Ok(())
    }

    fn poll(&mut self, streams: PerfStreams) -> Result<Vec<JoinHandle<()>>> {
        let pages = self.perf_pages;
        let bpf = self.bpf_mut()?;

        let update = take_perf_array(bpf, PERF_UPDATE_MAP)?;
        let destroy = take_perf_array(bpf, PERF_DESTROY_MAP)?;

        let mut readers = perf::spawn_cpu_readers(
            PERF_UPDATE_MAP,
            update,
            pages,
            streams.update,
            streams.notices.clone(),
        )?;
        readers.extend(perf::spawn_cpu_readers(
            PERF_DESTROY_MAP,
            destroy,
            pages,
            streams.destroy,
            streams.notices,
        )?);

        Ok(readers)
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the object detaches every link and closes its maps.
        if self.bpf.take().is_some() {
            info!("Released BPF program build {}", self.version);
        }
        Ok(())
    }
}

fn take_perf_array(bpf: &mut Bpf, name: &str) -> Result<AsyncPerfEventArray<MapData>> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| Error::map(name, "not found in BPF object"))?;

    AsyncPerfEventArray::try_from(map).map_err(|e| Error::map(name, e))
}
