//! Engine construction from command-line options.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use penumbra_core::catalog::{self, CatalogSource};
use penumbra_core::device::adb::AdbTransport;
use penumbra_core::{EngineOptions, InstallationEngine, Layout};

use crate::Cli;

/// Open an engine for `cli`'s home, catalog and adb binary.
pub async fn open_engine(cli: &Cli) -> Result<InstallationEngine> {
    let layout = match &cli.home {
        Some(home) => Layout::new(home),
        None => Layout::from_env().context("cannot determine home directory; set PENUMBRA_HOME")?,
    };

    let client = penumbra_core::github::build_client()?;
    let source = catalog_source(cli.catalog.as_deref());
    let mut catalog = catalog::load(&source, &client)
        .await
        .context("Failed to load bundle catalog")?;
    let overrides = parse_vars(&cli.vars)?;
    let values = catalog::resolve_variables(&catalog, &overrides)?;
    catalog::apply_variables(&mut catalog, &values)?;

    let transport = match &cli.adb {
        Some(program) => AdbTransport::new(program),
        // Missing adb only matters once a device is needed; the session
        // manager reports it as an unreachable device.
        None => AdbTransport::locate().unwrap_or_else(|e| {
            tracing::debug!("{e}");
            AdbTransport::new("adb")
        }),
    };

    let engine = InstallationEngine::open(EngineOptions::new(layout, catalog), Arc::new(transport))
        .await
        .context("Failed to open installer home")?;
    Ok(engine)
}

fn catalog_source(arg: Option<&str>) -> CatalogSource {
    match arg {
        None => CatalogSource::Builtin,
        Some(s) if s.starts_with("http://") || s.starts_with("https://") => {
            CatalogSource::Url(s.to_string())
        }
        Some(s) => CatalogSource::File(PathBuf::from(s)),
    }
}

fn parse_vars(vars: &[String]) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for var in vars {
        let Some((name, value)) = var.split_once('=') else {
            bail!("invalid --var '{var}', expected NAME=VALUE");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("invalid --var '{var}', name is empty");
        }
        out.insert(name.to_string(), value.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_source() {
        assert_eq!(catalog_source(None), CatalogSource::Builtin);
        assert_eq!(
            catalog_source(Some("https://example.com/bundle.toml")),
            CatalogSource::Url("https://example.com/bundle.toml".to_string())
        );
        assert_eq!(
            catalog_source(Some("./bundle.toml")),
            CatalogSource::File(PathBuf::from("./bundle.toml"))
        );
    }

    #[test]
    fn test_parse_vars() {
        let vars = parse_vars(&["launcher=mabl".to_string(), "empty=".to_string()]).unwrap();
        assert_eq!(vars["launcher"], "mabl");
        assert_eq!(vars["empty"], "");
        assert!(parse_vars(&["novalue".to_string()]).is_err());
        assert!(parse_vars(&["=x".to_string()]).is_err());
    }
}
