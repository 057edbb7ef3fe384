use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;

use crate::config::{HatchRateConfig, InvokerConfig};
use crate::http::HttpInvoker;
use crate::invoker::Invoker;
use crate::openwhisk::WhiskInvoker;
use crate::rate::{ConstantRate, FixedRpsRate, HatchRate, NoopRate, SlopingRate};

/// Rate type names claimed by the built-in policies.
pub const RESERVED_RATE_NAMES: &[&str] = &["noop", "slope", "fixed", "constant"];

/// Invoker type names claimed by the built-in invokers.
pub const RESERVED_INVOKER_NAMES: &[&str] = &["http", "ow"];

pub type RateConstructor =
    Box<dyn Fn(&HatchRateConfig) -> Result<Arc<dyn HatchRate>> + Send + Sync>;

pub type InvokerConstructor =
    Box<dyn Fn(&InvokerConfig) -> Result<Arc<dyn Invoker>> + Send + Sync>;

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Name-to-constructor map for hatch rates.
///
/// The process-wide instance is [`rates`]; tests may hold private ones.
#[derive(Default)]
pub struct RateRegistry {
    entries: Mutex<HashMap<String, RateConstructor>>,
}

impl RateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension rate; built-in names are reserved.
    pub fn register(&self, name: &str, constructor: RateConstructor) -> Result<()> {
        let name = normalize(name);
        if RESERVED_RATE_NAMES.contains(&name.as_str()) {
            bail!("cannot use {name} to register a hatch rate");
        }
        self.entries.lock().unwrap().insert(name, constructor);
        Ok(())
    }

    pub fn build(&self, config: &HatchRateConfig) -> Result<Arc<dyn HatchRate>> {
        match normalize(&config.kind).as_str() {
            "noop" => Ok(Arc::new(NoopRate::default())),
            "constant" => Ok(Arc::new(ConstantRate::from_config(config)?)),
            "fixed" => Ok(Arc::new(FixedRpsRate::from_config(config)?)),
            "slope" => Ok(Arc::new(SlopingRate::from_config(config)?)),
            other => match self.entries.lock().unwrap().get(other) {
                Some(constructor) => constructor(config),
                None => bail!("unknown rate type"),
            },
        }
    }
}

/// Name-to-constructor map for invokers.
#[derive(Default)]
pub struct InvokerRegistry {
    entries: Mutex<HashMap<String, InvokerConstructor>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension invoker; built-in names are reserved.
    pub fn register(&self, name: &str, constructor: InvokerConstructor) -> Result<()> {
        let name = normalize(name);
        if RESERVED_INVOKER_NAMES.contains(&name.as_str()) {
            bail!("cannot use {name} to register an invoker");
        }
        self.entries.lock().unwrap().insert(name, constructor);
        Ok(())
    }

    pub fn build(&self, config: &InvokerConfig) -> Result<Arc<dyn Invoker>> {
        match normalize(&config.kind).as_str() {
            "http" => Ok(Arc::new(HttpInvoker::from_config(config)?)),
            "ow" => Ok(Arc::new(WhiskInvoker::from_config(config)?)),
            other => match self.entries.lock().unwrap().get(other) {
                Some(constructor) => constructor(config),
                None => bail!("unknown invoker type"),
            },
        }
    }
}

static RATES: Lazy<RateRegistry> = Lazy::new(RateRegistry::new);
static INVOKERS: Lazy<InvokerRegistry> = Lazy::new(InvokerRegistry::new);

/// Process-wide rate registry.
pub fn rates() -> &'static RateRegistry {
    &RATES
}

/// Process-wide invoker registry.
pub fn invokers() -> &'static InvokerRegistry {
    &INVOKERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn expect_err<T>(result: Result<T>) -> anyhow::Error {
        match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        }
    }

    fn rate_config(kind: &str, options: &[(&str, serde_yaml::Value)]) -> HatchRateConfig {
        HatchRateConfig {
            kind: kind.to_string(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn reserved_rate_names_rejected() {
        let registry = RateRegistry::new();
        for name in RESERVED_RATE_NAMES {
            let err = registry
                .register(name, Box::new(|_| Ok(Arc::new(NoopRate::default()))))
                .unwrap_err();
            assert!(err.to_string().contains("cannot use"), "{name}");
        }
    }

    #[test]
    fn reserved_invoker_names_rejected() {
        let registry = InvokerRegistry::new();
        for name in RESERVED_INVOKER_NAMES {
            assert!(
                registry
                    .register(
                        name,
                        Box::new(|_| Ok(Arc::new(crate::invoker::MockInvoker::new(
                            std::time::Duration::ZERO
                        )))),
                    )
                    .is_err(),
                "{name}"
            );
        }
    }

    #[test]
    fn unknown_types_error() {
        let registry = RateRegistry::new();
        let err = expect_err(registry.build(&rate_config("warp", &[])));
        assert_eq!(err.to_string(), "unknown rate type");

        let registry = InvokerRegistry::new();
        let err = expect_err(registry.build(&InvokerConfig {
            kind: "grpc".to_string(),
            options: Options::new(),
        }));
        assert_eq!(err.to_string(), "unknown invoker type");
    }

    #[test]
    fn lookup_trims_and_lowercases() {
        let registry = RateRegistry::new();
        registry
            .register("Custom", Box::new(|_| Ok(Arc::new(NoopRate::default()))))
            .unwrap();
        assert!(registry.build(&rate_config("  CUSTOM ", &[])).is_ok());
        assert!(registry
            .build(&rate_config(" Fixed ", &[("trps", 10.into())]))
            .is_ok());
    }

    #[test]
    fn builtin_rates_validate_options() {
        let registry = RateRegistry::new();
        let err = expect_err(registry.build(&rate_config("constant", &[])));
        assert_eq!(err.to_string(), "missing values for constant");

        let err = expect_err(registry.build(&rate_config("slope", &[("start", 20.into())])));
        assert_eq!(err.to_string(), "missing values for slope");

        assert!(registry
            .build(&rate_config(
                "slope",
                &[("start", 20.into()), ("rate", 1.5.into())]
            ))
            .is_ok());
    }
}
