//! Per-item stage timing, compiled to no-ops unless the `profiling` feature is on.
//!
//! With the feature on, `PATCHDL_PROFILING_WHITELIST` (comma separated names)
//! limits the reports to the listed timings.

use crate::common::*;

#[cfg(feature = "profiling")]
mod enabled {
    use crate::common::*;
    use dashmap::DashSet;

    #[derive(Debug, Deserialize)]
    struct Whitelist {
        profiling_whitelist: Option<Vec<String>>,
    }

    lazy_static! {
        static ref WHITELIST: Option<HashSet<String>> =
            match envy::prefixed("PATCHDL_").from_env::<Whitelist>() {
                Ok(whitelist) => whitelist
                    .profiling_whitelist
                    .map(|names| names.into_iter().collect()),
                Err(err) => {
                    warn!("ignore invalid profiling environment variables: {:?}", err);
                    None
                }
            };
        static ref REGISTERED: DashSet<&'static str> = DashSet::new();
    }

    pub fn register(name: &'static str) {
        if REGISTERED.insert(name) {
            info!("registered timing profile '{}'", name);
        }
    }

    pub fn is_reported(name: &str) -> bool {
        WHITELIST
            .as_ref()
            .map(|whitelist| whitelist.contains(name))
            .unwrap_or(true)
    }
}

/// Elapsed time between the named stages of one pipeline item.
#[derive(Debug, Clone)]
pub struct Timing {
    #[cfg(feature = "profiling")]
    name: &'static str,
    #[cfg(feature = "profiling")]
    instant: Instant,
    #[cfg(feature = "profiling")]
    stages: Vec<(&'static str, Duration)>,
}

impl Timing {
    pub fn new(name: &'static str) -> Self {
        #[cfg(feature = "profiling")]
        {
            enabled::register(name);
            Self {
                name,
                instant: Instant::now(),
                stages: vec![],
            }
        }

        #[cfg(not(feature = "profiling"))]
        {
            let _ = name;
            Self {}
        }
    }

    /// Marks the end of the stage `name`.
    pub fn add_event(&mut self, name: &'static str) {
        #[cfg(feature = "profiling")]
        {
            let now = Instant::now();
            self.stages.push((name, now - self.instant));
            self.instant = now;
        }

        #[cfg(not(feature = "profiling"))]
        let _ = name;
    }

    /// A one-line summary of the stages, or `None` if profiling is off.
    pub fn summary(&self) -> Option<String> {
        #[cfg(feature = "profiling")]
        {
            let total: Duration = self.stages.iter().map(|(_, elapsed)| *elapsed).sum();
            let stages = self
                .stages
                .iter()
                .map(|(name, elapsed)| format!("{} {:?}", name, elapsed))
                .join(", ");
            Some(format!("'{}' took {:?}: {}", self.name, total, stages))
        }

        #[cfg(not(feature = "profiling"))]
        {
            None
        }
    }

    pub fn report(&self) {
        #[cfg(feature = "profiling")]
        {
            if enabled::is_reported(self.name) {
                if let Some(summary) = self.summary() {
                    info!("{}", summary);
                }
            }
        }
    }
}
